//! Directory-level memoization of stage artifacts.
//!
//! An artifact directory counts as present only when it carries a completion marker whose
//! key digest matches the inputs that should have produced it. Artifacts are built in a
//! sibling staging directory and renamed into place, so a crash never leaves a directory
//! that looks complete.

use crate::digest;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const MARKER_FILE: &str = ".ephys_complete.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionMarker {
    key_digest: String,
    completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoStatus {
    Reused,
    Computed,
}

fn read_marker(dir: &Path) -> Option<CompletionMarker> {
    let text = fs::read_to_string(dir.join(MARKER_FILE)).ok()?;
    match serde_json::from_str(&text) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!("Ignoring unreadable completion marker in {}: {}", dir.display(), e);
            None
        }
    }
}

/// Whether `dir` holds a complete artifact for any key.
pub fn is_published(dir: &Path) -> bool {
    read_marker(dir).is_some()
}

/// Whether `dir` holds a complete artifact for `key`.
pub fn is_complete(dir: &Path, key: &Value) -> Result<bool, Error> {
    let digest = digest::json_digest(key)?;
    Ok(read_marker(dir).is_some_and(|marker| marker.key_digest == digest))
}

/// Reuse the artifact in `dir` when it is complete for `key`; otherwise build it with
/// `compute`, which receives the directory to write into.
pub fn lookup_or_compute<F>(dir: &Path, key: &Value, compute: F) -> Result<MemoStatus, Error>
where
    F: FnOnce(&Path) -> Result<(), Error>,
{
    let key_digest = digest::json_digest(key)?;
    if read_marker(dir).is_some_and(|marker| marker.key_digest == key_digest) {
        debug!("Reusing artifact {}", dir.display());
        return Ok(MemoStatus::Reused);
    }

    let parent = dir.parent().ok_or_else(|| {
        Error::Validation(format!("artifact directory {} has no parent", dir.display()))
    })?;
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(parent)?;

    compute(staging.path())?;

    let marker = CompletionMarker {
        key_digest,
        completed_at: Utc::now(),
    };
    fs::write(
        staging.path().join(MARKER_FILE),
        serde_json::to_vec_pretty(&marker)?,
    )?;

    if dir.exists() {
        debug!("Discarding incomplete artifact {}", dir.display());
        fs::remove_dir_all(dir)?;
    }
    let staged = staging.into_path();
    if let Err(e) = fs::rename(&staged, dir) {
        let _ = fs::remove_dir_all(&staged);
        return Err(e.into());
    }
    debug!("Stored artifact {}", dir.display());
    Ok(MemoStatus::Computed)
}
