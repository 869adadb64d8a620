//! Raw-file catalog: discovery of acquisition files and per-session lookups.

pub mod naming;
pub mod walk;

use crate::error::{Error, Outcome, PassSummary};
use crate::locator::{self, DataLocator};
use crate::progress::PipelineReporter;
use crate::reader::RawReader;
use crate::storage::models::{AcquisitionSoftware, RawFile, Session};
use crate::storage::Database;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct CatalogResult {
    pub scan_duration: Duration,
    pub files_found: usize,
    pub files_inserted: usize,
    pub by_software: Vec<(AcquisitionSoftware, usize)>,
}

/// Walk every root, describe recognized files and insert the new ones.
pub fn catalog_roots(
    db: &Database,
    roots: &[PathBuf],
    ignore_patterns: &[String],
    reporter: &dyn PipelineReporter,
) -> Result<CatalogResult, Error> {
    let ignore: Vec<&str> = ignore_patterns.iter().map(|s| s.as_str()).collect();
    reporter.on_catalog_start();
    let started = Instant::now();

    let mut described: Vec<RawFile> = Vec::new();
    let mut counts = std::collections::BTreeMap::new();
    for root in roots {
        info!("Cataloging raw files under {}", root.display());
        let map = walk::build_software_to_files_map(root, &ignore)?;
        for entry in map.iter() {
            for path in entry.value() {
                match naming::describe_file(root, path, *entry.key()) {
                    Ok(file) => {
                        *counts.entry(*entry.key()).or_insert(0usize) += 1;
                        described.push(file);
                    }
                    Err(e) => warn!("Skipping {}: {}", path.display(), e),
                }
            }
        }
        reporter.on_catalog_progress(described.len());
    }

    let files_inserted = db.insert_raw_files(&described)?;
    let scan_duration = started.elapsed();
    reporter.on_catalog_complete(described.len(), scan_duration.as_secs_f64());
    debug!(
        "Catalog completed in {:.2}s: {} files found, {} new",
        scan_duration.as_secs_f64(),
        described.len(),
        files_inserted
    );

    Ok(CatalogResult {
        scan_duration,
        files_found: described.len(),
        files_inserted,
        by_software: counts.into_iter().collect(),
    })
}

/// Raw files inside a session's time window, oldest first, with their full paths.
pub fn session_files(
    db: &Database,
    locator: &dyn DataLocator,
    session: &Session,
) -> Result<Vec<(RawFile, PathBuf)>, Error> {
    db.raw_files_between(session.start_time, session.end_time)?
        .into_iter()
        .map(|file| {
            let full = locator::find_full_path(locator.root_dirs(), Path::new(&file.file_path))?;
            Ok((file, full))
        })
        .collect()
}

/// Store the header of the first raw file in a session's window.
pub fn populate_session_info<R: RawReader + ?Sized>(
    db: &Database,
    locator: &dyn DataLocator,
    reader: &R,
    session: &Session,
) -> Result<Outcome<()>, Error> {
    let files = db.raw_files_between(session.start_time, session.end_time)?;
    let Some(first) = files.first() else {
        return Ok(Outcome::NotReady(format!(
            "no raw files between {} and {}",
            session.start_time, session.end_time
        )));
    };
    let path = locator::find_full_path(locator.root_dirs(), Path::new(&first.file_path))?;
    let header = reader.read_header(&path)?;
    db.insert_session_info(session.id, &serde_json::to_value(&header)?)?;
    debug!("Stored session info for session {} from {}", session.id, path.display());
    Ok(Outcome::Completed(()))
}

pub fn populate_all_session_info<R: RawReader + ?Sized>(
    db: &Database,
    locator: &dyn DataLocator,
    reader: &R,
    reporter: &dyn PipelineReporter,
) -> Result<PassSummary, Error> {
    let pending = db.sessions_without_info()?;
    let started = Instant::now();
    reporter.on_pass_start("session_info", pending.len());

    let mut summary = PassSummary::default();
    for session in &pending {
        reporter.on_item_start("session_info", session.id);
        let result = populate_session_info(db, locator, reader, session);
        match &result {
            Ok(Outcome::NotReady(reason)) => info!("Session {} skipped: {}", session.id, reason),
            Err(e) => error!("Session info failed for session {}: {}", session.id, e),
            Ok(Outcome::Completed(_)) => {}
        }
        summary.record(session.id, &result);
        reporter.on_item_complete("session_info", session.id);
    }
    reporter.on_pass_complete("session_info", &summary, started.elapsed().as_secs_f64());
    Ok(summary)
}
