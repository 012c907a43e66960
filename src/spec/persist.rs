//! Durable copies of finished specs
//!
//! Every sandbox and container has two: a template in its storage directory
//! and a running copy in its run directory. Both are written before the
//! runtime sees the spec, and the running copy is what a restart reads back.

use crate::{
    errors::{ServerError, SpecError},
    spec::SpecDocument,
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

pub const SPEC_FILE: &str = "config.json";

/// Write `config.json` under `dir`, replacing any earlier copy atomically
pub fn save(spec: &SpecDocument, dir: &Path) -> Result<PathBuf, SpecError> {
    fs::create_dir_all(dir).map_err(|err| SpecError::io(dir, err))?;
    let path = dir.join(SPEC_FILE);
    let temp = dir.join(format!(".{}.tmp", SPEC_FILE));
    let contents = serde_json::to_vec_pretty(spec)?;
    let mut file = fs::File::create(&temp).map_err(|err| SpecError::io(&temp, err))?;
    file.write_all(&contents)
        .and_then(|_| file.sync_all())
        .map_err(|err| SpecError::io(&temp, err))?;
    fs::rename(&temp, &path).map_err(|err| SpecError::io(&path, err))?;
    Ok(path)
}

/// Write both copies
pub fn save_both(spec: &SpecDocument, template_dir: &Path, run_dir: &Path) -> Result<(), SpecError> {
    save(spec, template_dir)?;
    save(spec, run_dir)?;
    Ok(())
}

/// Read a spec back
///
/// Anything that can't be read as a spec is reported as corrupt state; it
/// is never repaired.
pub fn load(dir: &Path) -> Result<SpecDocument, ServerError> {
    let path = dir.join(SPEC_FILE);
    let contents = fs::read(&path).map_err(|err| ServerError::CorruptState {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    let spec: SpecDocument =
        serde_json::from_slice(&contents).map_err(|err| ServerError::CorruptState {
            path: path.clone(),
            reason: err.to_string(),
        })?;
    if spec.oci_version.is_empty() {
        return Err(ServerError::CorruptState {
            path,
            reason: "missing ociVersion".to_string(),
        });
    }
    Ok(spec)
}

/// Remove a saved copy; a missing copy is fine
pub fn remove(dir: &Path) -> Result<(), SpecError> {
    let path = dir.join(SPEC_FILE);
    match fs::remove_file(&path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(SpecError::io(&path, err)),
        _ => Ok(()),
    }
}
