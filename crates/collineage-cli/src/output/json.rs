//! JSON output formatting.

use collineage_core::OutputRow;

/// Formats lineage rows as a JSON array of [`OutputRow`] records.
///
/// If `compact` is true, outputs minified JSON without whitespace.
pub fn format_json(rows: &[OutputRow], compact: bool) -> String {
    if compact {
        serde_json::to_string(rows).expect("serialization cannot fail")
    } else {
        serde_json::to_string_pretty(rows).expect("serialization cannot fail")
    }
}
