//! Loading definitions from a directory of JSON/YAML files

use crate::models::definition::Definition;
use crate::workflow::error::ValidationError;
use crate::workflow::parser;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// File extensions recognised as definition documents
pub const DEFINITION_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Outcome of loading one file
#[derive(Debug)]
pub struct LoadedDefinition {
    /// Source file
    pub path: PathBuf,
    /// Definition name (file stem)
    pub name: String,
    /// Parsed definition, or every validation issue found
    pub result: std::result::Result<Definition, ValidationError>,
}

fn is_definition_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| DEFINITION_EXTENSIONS.contains(&ext))
}

/// Load every definition file in `dir`, sorted by file name.
///
/// Files are named after their stem. Invalid documents are returned with
/// their issues rather than failing the whole load; I/O errors fail it.
pub fn load_definitions_from_dir(dir: &Path) -> Result<Vec<LoadedDefinition>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read definitions directory {}", dir.display()))?
    {
        let path = entry.context("Failed to read directory entry")?.path();
        if is_definition_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let result = parser::parse_definition(&name, &text);
        if let Err(e) = &result {
            tracing::warn!(path = %path.display(), issues = e.issues.len(), "invalid definition file");
        }
        loaded.push(LoadedDefinition { path, name, result });
    }
    Ok(loaded)
}
