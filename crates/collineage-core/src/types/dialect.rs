//! SQL dialect selection for parsing and serialization.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Warehouse SQL dialect. Drives both the parser grammar and the
/// pretty-printer used to serialize `ExpandedSql`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Generic,
    Postgres,
    Snowflake,
    Bigquery,
}

impl Dialect {
    pub fn to_sqlparser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        use sqlparser::dialect::{
            BigQueryDialect, GenericDialect, PostgreSqlDialect, SnowflakeDialect,
        };
        match self {
            Self::Generic => Box::new(GenericDialect {}),
            Self::Postgres => Box::new(PostgreSqlDialect {}),
            Self::Snowflake => Box::new(SnowflakeDialect {}),
            Self::Bigquery => Box::new(BigQueryDialect {}),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Generic => "generic",
            Self::Postgres => "postgres",
            Self::Snowflake => "snowflake",
            Self::Bigquery => "bigquery",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dialect_is_generic() {
        assert_eq!(Dialect::default(), Dialect::Generic);
    }

    #[test]
    fn display_matches_serde_rename() {
        assert_eq!(Dialect::Snowflake.to_string(), "snowflake");
    }
}
