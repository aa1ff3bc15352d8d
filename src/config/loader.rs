// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{DagFile, RawDagFile};
use crate::config::validate::into_dag_file;
use crate::errors::{DagflowError, Result};

/// Read a definition file and return the raw, unvalidated form.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawDagFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let raw: RawDagFile = toml::from_str(&contents)?;
    Ok(raw)
}

/// Load a definition file and validate it (dependency names, acyclicity).
///
/// This is the entry point the rest of the engine uses; the DAG name falls
/// back to the file stem when the file does not set one.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<DagFile> {
    let path = path.as_ref();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| DagflowError::Config(format!("invalid DAG path: {}", path.display())))?;
    let raw = load_from_path(path)?;
    into_dag_file(stem, raw)
}

/// Resolve a DAG reference to a definition file.
///
/// A reference containing a path separator or a `.toml` suffix is treated as
/// a literal path; anything else is looked up as `<dags_dir>/<name>.toml`.
/// `DagNotFound` if the resolved file does not exist.
pub fn resolve_dag_path(dags_dir: &Path, name_or_path: &str) -> Result<PathBuf> {
    let candidate = if name_or_path.contains(std::path::MAIN_SEPARATOR)
        || name_or_path.ends_with(".toml")
    {
        PathBuf::from(name_or_path)
    } else {
        dags_dir.join(format!("{name_or_path}.toml"))
    };

    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(DagflowError::DagNotFound(name_or_path.to_string()))
    }
}
