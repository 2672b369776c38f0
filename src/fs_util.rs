use std::fs;
use std::io::{self, Write};

use camino::Utf8Path;

use crate::error::PipelineError;

/// Writes `content` to `dest` through a temp file in the same directory, so a
/// reader never sees a half-written script.
pub fn write_atomic(dest: &Utf8Path, content: &str) -> Result<(), PipelineError> {
    let parent = dest
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("create {parent}: {err}")))?;
    let mut temp = tempfile::Builder::new()
        .prefix("kira-pipeline-script")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    temp.write_all(content.as_bytes())
        .map_err(|err| PipelineError::Filesystem(format!("write {dest}: {err}")))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("persist {dest}: {err}")))?;
    Ok(())
}

/// Deletes `path`; a file that is already gone is not an error.
pub fn remove_if_exists(path: &Utf8Path) -> Result<bool, PipelineError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(PipelineError::Filesystem(format!("delete {path}: {err}"))),
    }
}
