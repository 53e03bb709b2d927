//! Input handling for the manifest/catalog JSON pair.

use anyhow::{Context, Result};
use std::path::Path;

/// Reads a manifest or catalog document from a path, or from stdin if the
/// path is `-`.
pub fn read_document(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        read_stdin()
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

fn read_stdin() -> Result<String> {
    use std::io::Read;
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .context("failed to read from stdin")?;
    Ok(content)
}
