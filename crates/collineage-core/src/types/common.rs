//! Shared diagnostic and identity types for the lineage pipeline.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// The closed set of failure kinds a pipeline stage can report.
/// Each kind has a fixed recovery policy: the first four are
/// recoverable by skipping the offending unit; `ParseFailure` and
/// `NoWithClause` skip the whole query; the rest are recovered per projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticKind {
    MissingCatalogEntry,
    UnsupportedResourceType,
    MalformedDependencyKey,
    UnresolvedReference,
    ParseFailure,
    NoWithClause,
    UnknownSource,
    UnsupportedFromShape,
    TraceDepthExceeded,
    TraceInternal,
}

/// Machine-readable diagnostic codes, mirroring `DiagnosticKind`.
pub mod diagnostic_codes {
    pub const MISSING_CATALOG_ENTRY: &str = "MISSING_CATALOG_ENTRY";
    pub const UNSUPPORTED_RESOURCE_TYPE: &str = "UNSUPPORTED_RESOURCE_TYPE";
    pub const MALFORMED_DEPENDENCY_KEY: &str = "MALFORMED_DEPENDENCY_KEY";
    pub const UNRESOLVED_REFERENCE: &str = "UNRESOLVED_REFERENCE";
    pub const PARSE_FAILURE: &str = "PARSE_FAILURE";
    pub const NO_WITH_CLAUSE: &str = "NO_WITH_CLAUSE";
    pub const UNKNOWN_SOURCE: &str = "UNKNOWN_SOURCE";
    pub const UNSUPPORTED_FROM_SHAPE: &str = "UNSUPPORTED_FROM_SHAPE";
    pub const TRACE_DEPTH_EXCEEDED: &str = "TRACE_DEPTH_EXCEEDED";
    pub const TRACE_INTERNAL: &str = "TRACE_INTERNAL";
}

impl DiagnosticKind {
    pub fn code(&self) -> &'static str {
        use diagnostic_codes::*;
        match self {
            Self::MissingCatalogEntry => MISSING_CATALOG_ENTRY,
            Self::UnsupportedResourceType => UNSUPPORTED_RESOURCE_TYPE,
            Self::MalformedDependencyKey => MALFORMED_DEPENDENCY_KEY,
            Self::UnresolvedReference => UNRESOLVED_REFERENCE,
            Self::ParseFailure => PARSE_FAILURE,
            Self::NoWithClause => NO_WITH_CLAUSE,
            Self::UnknownSource => UNKNOWN_SOURCE,
            Self::UnsupportedFromShape => UNSUPPORTED_FROM_SHAPE,
            Self::TraceDepthExceeded => TRACE_DEPTH_EXCEEDED,
            Self::TraceInternal => TRACE_INTERNAL,
        }
    }
}

/// One entry in the pipeline's append-only diagnostic stream.
///
/// Every skip, unresolved placeholder, or recovered per-projection error
/// anywhere in the four stages is surfaced as a `Diagnostic` rather than a
/// propagated error, so callers can assert on error kinds without coupling
/// to log formatting.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    /// The node key, model identity, or column this diagnostic relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)?;
        if let Some(ctx) = &self.context {
            write!(f, " ({ctx})")?;
        }
        Ok(())
    }
}

/// An append-only sink for diagnostics collected while running a pipeline
/// stage. Each stage takes `&mut DiagnosticSink` and pushes as it goes; no
/// error ever propagates out of the pipeline itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

/// Fully-qualified `database.schema.table` identity shared by models, CTEs
/// resolved against the catalog, and lineage rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct ModelKey {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl ModelKey {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table)
    }

    /// Case-insensitive lookup key. Reference-map lookups and catalog joins
    /// compare identities this way, enforced at the loader boundary rather
    /// than re-checked at every call site.
    pub fn normalized(&self) -> String {
        self.full_name().to_lowercase()
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_display_includes_code_and_context() {
        let d = Diagnostic::error(DiagnosticKind::ParseFailure, "unexpected token")
            .with_context("db.sch.model_a");
        assert_eq!(
            d.to_string(),
            "[PARSE_FAILURE] unexpected token (db.sch.model_a)"
        );
    }

    #[test]
    fn model_key_normalized_is_case_insensitive() {
        let a = ModelKey::new("DB", "Sch", "Table");
        let b = ModelKey::new("db", "sch", "table");
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn diagnostic_sink_tracks_errors() {
        let mut sink = DiagnosticSink::new();
        assert!(!sink.has_errors());
        sink.push(Diagnostic::new(DiagnosticKind::UnresolvedReference, "x"));
        assert!(!sink.has_errors());
        sink.push(Diagnostic::error(DiagnosticKind::ParseFailure, "y"));
        assert!(sink.has_errors());
        assert_eq!(sink.len(), 2);
    }
}
