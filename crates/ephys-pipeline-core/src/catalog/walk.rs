use super::naming;
use crate::storage::models::AcquisitionSoftware;
use dashmap::DashMap;
use glob::Pattern;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::error;

/// Parallel directory traversal. Builds a map of acquisition software → files written by
/// it, filtering by glob ignore patterns. Skips symlinks, empty files and anything the
/// catalog does not recognize.
pub fn build_software_to_files_map(
    root: &Path,
    ignore_globs: &[&str],
) -> io::Result<DashMap<AcquisitionSoftware, Vec<PathBuf>>> {
    let map: DashMap<AcquisitionSoftware, Vec<PathBuf>> = DashMap::new();

    let ignore_patterns: Vec<Pattern> = ignore_globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect();

    visit_dirs(root, &map, &ignore_patterns)?;

    for mut entry in map.iter_mut() {
        entry.value_mut().sort();
    }
    Ok(map)
}

fn visit_dirs(
    dir: &Path,
    map: &DashMap<AcquisitionSoftware, Vec<PathBuf>>,
    ignore_patterns: &[Pattern],
) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    if ignore_patterns
        .iter()
        .any(|pattern| pattern.matches_path(dir))
    {
        return Ok(());
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!(
                    "Access denied reading directory {}: {}",
                    dir.display(),
                    err
                );
                return Ok(());
            } else {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading directory {}: {}", dir.display(), err),
                ));
            }
        }
    };

    entries.par_bridge().try_for_each(|entry_result| {
        let entry = entry_result.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("Error reading entry in directory {}: {}", dir.display(), err),
            )
        })?;

        let path = entry.path();
        let metadata = fs::symlink_metadata(&path).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("Error getting metadata for {}: {}", path.display(), err),
            )
        })?;

        if metadata.file_type().is_symlink() {
            return Ok(());
        }
        if metadata.is_dir() {
            visit_dirs(&path, map, ignore_patterns)?;
        } else if metadata.len() > 0
            && !ignore_patterns
                .iter()
                .any(|pattern| pattern.matches_path(&path))
        {
            if let Some(software) = naming::classify(&path) {
                map.entry(software).or_default().push(path);
            }
        }
        Ok(())
    })
}
