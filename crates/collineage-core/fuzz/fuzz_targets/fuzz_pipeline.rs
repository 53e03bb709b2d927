//! Fuzz target for the full lineage pipeline.
//!
//! This tests that `run_pipeline()` doesn't panic on arbitrary manifest or
//! catalog JSON, including malformed documents and SQL that fails to parse.

#![no_main]

use arbitrary::Arbitrary;
use collineage_core::{run_pipeline, Dialect};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    manifest_json: String,
    catalog_json: String,
    dialect_idx: u8,
}

impl FuzzInput {
    fn dialect(&self) -> Dialect {
        match self.dialect_idx % 4 {
            0 => Dialect::Generic,
            1 => Dialect::Postgres,
            2 => Dialect::Snowflake,
            _ => Dialect::Bigquery,
        }
    }
}

fuzz_target!(|input: FuzzInput| {
    let dialect = input.dialect();
    // Every failure mode (bad JSON, unresolved refs, unparseable SQL, cyclic
    // CTEs) is recovered through the diagnostic sink; the pipeline itself
    // must never panic or abort.
    let _ = run_pipeline(&input.manifest_json, &input.catalog_json, dialect);
});
