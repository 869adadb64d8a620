//! Resolution of raw-data roots, the processed-data root and session directories.
//!
//! A `DataLocator` is built once (usually from [`AppConfig`]) and passed by reference to
//! everything that needs to turn catalog paths into filesystem paths.

use crate::config::{self, AppConfig};
use crate::error::Error;
use crate::storage::models::Session;
use std::io;
use std::path::{Path, PathBuf};

pub trait DataLocator: Send + Sync {
    /// Raw-data roots, in priority order.
    fn root_dirs(&self) -> &[PathBuf];

    /// Directory holding a session's data. May be relative (to one of the roots) or absolute.
    fn session_directory(&self, session: &Session) -> Result<PathBuf, Error>;

    /// Root under which every processed output lives.
    fn processed_root(&self) -> &Path;
}

/// Locator driven entirely by configuration.
///
/// Session directories follow `{experiment_ref}/{start:%Y%m%d%H%M}_{end:%Y%m%d%H%M}`.
#[derive(Debug, Clone)]
pub struct ConfiguredLocator {
    roots: Vec<PathBuf>,
    processed_root: PathBuf,
}

impl ConfiguredLocator {
    pub fn new(roots: Vec<PathBuf>, processed_root: Option<PathBuf>) -> Result<Self, Error> {
        let processed_root = match processed_root {
            Some(dir) => dir,
            None => roots.first().cloned().ok_or_else(|| {
                Error::Validation("at least one ephys root directory is required".to_string())
            })?,
        };
        Ok(Self {
            roots,
            processed_root,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let roots = config::non_overlapping_directories(config.ephys_root_dirs.clone())
            .into_iter()
            .map(PathBuf::from)
            .collect();
        Self::new(roots, config.processed_root_dir.as_ref().map(PathBuf::from))
    }
}

impl DataLocator for ConfiguredLocator {
    fn root_dirs(&self) -> &[PathBuf] {
        &self.roots
    }

    fn session_directory(&self, session: &Session) -> Result<PathBuf, Error> {
        let window = format!(
            "{}_{}",
            session.start_time.format("%Y%m%d%H%M"),
            session.end_time.format("%Y%m%d%H%M")
        );
        Ok(PathBuf::from(&session.experiment_ref).join(window))
    }

    fn processed_root(&self) -> &Path {
        &self.processed_root
    }
}

/// Find the first root under which `relative` exists.
pub fn find_full_path(roots: &[PathBuf], relative: &Path) -> Result<PathBuf, Error> {
    if relative.is_absolute() {
        if relative.exists() {
            return Ok(relative.to_path_buf());
        }
    } else {
        for root in roots {
            let candidate = root.join(relative);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!(
            "{} not found under any root directory {:?}",
            relative.display(),
            roots
        ),
    )))
}

/// Return the root that contains `full_path`.
pub fn find_root_directory<'a>(roots: &'a [PathBuf], full_path: &Path) -> Option<&'a PathBuf> {
    roots.iter().find(|root| full_path.starts_with(root))
}

/// `full_path` relative to whichever root holds it; relative inputs are returned as-is.
pub fn relative_to_root(roots: &[PathBuf], full_path: &Path) -> Result<PathBuf, Error> {
    if full_path.is_relative() {
        return Ok(full_path.to_path_buf());
    }
    let root = find_root_directory(roots, full_path).ok_or_else(|| {
        Error::NotFound(format!(
            "{} is not under any configured root directory",
            full_path.display()
        ))
    })?;
    full_path
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| Error::Consistency(e.to_string()))
}

/// `processed_root / relative(session_directory) / "{method}_{paramset_idx}"`, with `.`
/// in the method name replaced by `-`.
pub fn infer_output_dir(
    locator: &dyn DataLocator,
    session: &Session,
    clustering_method: &str,
    paramset_idx: i64,
) -> Result<PathBuf, Error> {
    let session_dir = locator.session_directory(session)?;
    let relative = relative_to_root(locator.root_dirs(), &session_dir)?;
    let method = clustering_method.replace('.', "-");
    Ok(locator
        .processed_root()
        .join(relative)
        .join(format!("{}_{}", method, paramset_idx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::SessionType;
    use chrono::NaiveDate;

    fn session() -> Session {
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        Session {
            id: 1,
            experiment_ref: "O09".to_string(),
            insertion_number: 1,
            start_time: day.and_hms_opt(14, 0, 0).unwrap(),
            end_time: day.and_hms_opt(14, 10, 0).unwrap(),
            session_type: SessionType::SpikeSorting,
        }
    }

    #[test]
    fn test_infer_output_dir_replaces_dots() {
        let locator = ConfiguredLocator::new(
            vec![PathBuf::from("/data/raw")],
            Some(PathBuf::from("/data/processed")),
        )
        .unwrap();
        let dir = infer_output_dir(&locator, &session(), "kilosort2.5", 3).unwrap();
        assert_eq!(
            dir,
            PathBuf::from("/data/processed/O09/202403051400_202403051410/kilosort2-5_3")
        );
    }

    #[test]
    fn test_processed_root_defaults_to_first_root() {
        let locator = ConfiguredLocator::new(vec![PathBuf::from("/a"), PathBuf::from("/b")], None)
            .unwrap();
        assert_eq!(locator.processed_root(), Path::new("/a"));
        assert!(ConfiguredLocator::new(vec![], None).is_err());
    }

    #[test]
    fn test_relative_to_root_strips_matching_root() {
        let roots = vec![PathBuf::from("/data/raw"), PathBuf::from("/mnt/raw")];
        let rel = relative_to_root(&roots, Path::new("/mnt/raw/O01/x")).unwrap();
        assert_eq!(rel, PathBuf::from("O01/x"));
        assert!(relative_to_root(&roots, Path::new("/elsewhere/x")).is_err());
    }

    #[test]
    fn test_find_full_path_searches_roots_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("a.rhd"), b"x").unwrap();
        let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let found = find_full_path(&roots, Path::new("a.rhd")).unwrap();
        assert_eq!(found, second.path().join("a.rhd"));
        assert!(find_full_path(&roots, Path::new("missing.rhd")).is_err());
    }
}
