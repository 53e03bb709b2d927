//! collineage CLI - column lineage tracer for a manifest + catalog pair.

mod cli;
mod input;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use collineage_core::lineage::catalog::load_catalog;
use collineage_core::{column_description, trace_model, Dialect};
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use cli::{Args, OutputFormat};
use output::{format_json, format_table};

fn main() -> ExitCode {
    match run() {
        Ok(has_errors) => {
            if has_errors {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("collineage: error: {e:#}");
            ExitCode::from(66)
        }
    }
}

fn run() -> Result<bool> {
    let args = Args::parse();

    #[cfg(feature = "tracing")]
    init_tracing(args.quiet);

    let manifest_json = input::read_document(&args.manifest)?;
    let catalog_json = input::read_document(&args.catalog)?;
    let dialect: Dialect = args.dialect.into();

    let mut sink = collineage_core::DiagnosticSink::new();
    let records = load_catalog(&manifest_json, &catalog_json, &mut sink);

    let mut output_rows = Vec::new();
    for (model, reference_map) in &records {
        if model.raw_sql.trim().is_empty() {
            continue;
        }
        for row in trace_model(model, reference_map, dialect, &mut sink) {
            let description = column_description(model, &row.final_column);
            output_rows.push(row.to_output_row(description));
        }
    }

    let rendered = match args.format {
        OutputFormat::Json => format_json(&output_rows, args.compact),
        OutputFormat::Table => format_table(&output_rows, !args.quiet),
    };

    write_output(&args.output, &rendered)?;

    if !args.quiet {
        print_diagnostics_to_stderr(&sink);
    }

    Ok(sink.has_errors())
}

#[cfg(feature = "tracing")]
fn init_tracing(quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if quiet { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn write_output(path: &Option<std::path::PathBuf>, content: &str) -> Result<()> {
    if let Some(path) = path {
        fs::write(path, content)
            .with_context(|| format!("failed to write to {}", path.display()))?;
    } else {
        io::stdout()
            .write_all(content.as_bytes())
            .context("failed to write to stdout")?;
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn print_diagnostics_to_stderr(sink: &collineage_core::DiagnosticSink) {
    for diagnostic in sink.iter() {
        eprintln!("collineage: {diagnostic}");
    }
}
