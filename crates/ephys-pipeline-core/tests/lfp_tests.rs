mod common;

use chrono::Duration;
use common::*;
use ephys_pipeline_core::lfp::LfpEngine;
use ephys_pipeline_core::reader::{RawHeader, RawReader, RawRecording};
use ephys_pipeline_core::storage::models::{Port, SessionType};
use ephys_pipeline_core::storage::Database;
use ephys_pipeline_core::{Error, Outcome};
use ndarray::{s, Array2};
use std::path::Path;

const FS: f64 = 30_000.0;
const FILE_SECONDS: i64 = 4;

/// Session of `session_seconds` with three 4-second Intan files at its start.
fn seed(
    db: &Database,
    ws: &Workspace,
    session_seconds: i64,
    used: Option<Vec<u32>>,
) -> i64 {
    let start = day_start();
    let session_id = db
        .insert_session(&session(start, session_seconds, SessionType::Lfp))
        .unwrap();
    let files: Vec<_> = (0..3)
        .map(|i| ws.intan_file("O09", start + Duration::seconds(i * FILE_SECONDS)))
        .collect();
    db.insert_raw_files(&files).unwrap();
    let config = electrode_config(16, |i| 4 * i + 1);
    assign_probe(db, session_id, &config, Port::A, used);
    session_id
}

fn reader() -> FakeReader {
    FakeReader::new(
        header(FS, &[(Port::B, 8), (Port::A, 64)]),
        (FS as usize) * FILE_SECONDS as usize,
    )
}

fn rms(samples: &[f32]) -> f64 {
    let sum: f64 = samples.iter().map(|&v| (v as f64) * (v as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

#[test]
fn test_lfp_end_to_end_three_files() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let session_id = seed(&db, &ws, 12, None);
    let reader = reader();

    let summary = LfpEngine::new(&db, &ws.locator, &reader)
        .populate_all()
        .unwrap();
    assert_eq!(summary.completed, vec![session_id]);
    assert!(summary.failed.is_empty(), "{:?}", summary.failed);

    let result = db.lfp_result(session_id).unwrap().unwrap();
    assert_eq!(result.lfp_sampling_rate, 2500.0);

    let traces = db.lfp_traces(session_id).unwrap();
    assert_eq!(traces.len(), 16);
    for trace in &traces {
        let expected_len = 12 * 2500;
        assert!(
            (trace.samples.len() as i64 - expected_len).abs() <= 1,
            "electrode {} has {} samples",
            trace.electrode,
            trace.samples.len()
        );

        // Electrode 100 + i sits on port-A channel 4i + 1, which is raw row 8 + 4i + 1
        // and carries a 10 Hz sine of amplitude row + 1. The 60 Hz hum must be gone.
        let i = trace.electrode - 100;
        let amplitude = (8 + 4 * i + 1 + 1) as f64;
        let measured = rms(&trace.samples[5_000..25_000]);
        let expected = amplitude / 2f64.sqrt();
        assert!(
            (measured - expected).abs() / expected < 0.02,
            "electrode {}: rms {} expected {}",
            trace.electrode,
            measured,
            expected
        );
    }

    // Second pass has nothing to do.
    let again = LfpEngine::new(&db, &ws.locator, &reader)
        .populate_all()
        .unwrap();
    assert_eq!(again.total(), 0);
}

#[test]
fn test_used_electrodes_limit_traces() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let session_id = seed(&db, &ws, 12, Some(vec![103, 101]));
    let reader = reader();

    let session = db.get_session(session_id).unwrap().unwrap();
    let outcome = LfpEngine::new(&db, &ws.locator, &reader)
        .populate(&session)
        .unwrap();
    assert!(outcome.is_completed());
    let electrodes: Vec<u32> = db
        .lfp_traces(session_id)
        .unwrap()
        .iter()
        .map(|t| t.electrode)
        .collect();
    assert_eq!(electrodes, vec![101, 103]);
}

#[test]
fn test_unknown_used_electrode_is_rejected() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let session_id = seed(&db, &ws, 12, Some(vec![101, 999]));
    let reader = reader();

    let session = db.get_session(session_id).unwrap().unwrap();
    let err = LfpEngine::new(&db, &ws.locator, &reader)
        .populate(&session)
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(db.lfp_result(session_id).unwrap().is_none());
}

#[test]
fn test_long_session_rejected_before_any_read() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let session_id = seed(&db, &ws, 31 * 60, None);
    let reader = reader();

    let session = db.get_session(session_id).unwrap().unwrap();
    let err = LfpEngine::new(&db, &ws.locator, &reader)
        .populate(&session)
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert_eq!(reader.opens(), 0);
}

#[test]
fn test_session_without_files_is_skipped() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let later = day_start() + Duration::hours(3);
    let session_id = db
        .insert_session(&session(later, 60, SessionType::Lfp))
        .unwrap();
    assign_probe(&db, session_id, &electrode_config(4, |i| i), Port::A, None);
    let reader = reader();

    let summary = LfpEngine::new(&db, &ws.locator, &reader)
        .populate_all()
        .unwrap();
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].0, session_id);
    assert!(summary.failed.is_empty());
    assert_eq!(reader.opens(), 0);

    // Still pending for the next run.
    assert_eq!(db.pending_lfp_sessions().unwrap().len(), 1);
}

#[test]
fn test_short_trace_fails_duration_check() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    // 12 s of data for a 60 s session.
    let session_id = seed(&db, &ws, 60, None);
    let reader = reader();

    let session = db.get_session(session_id).unwrap().unwrap();
    let err = LfpEngine::new(&db, &ws.locator, &reader)
        .populate(&session)
        .unwrap_err();
    assert_eq!(err.kind(), "consistency");
}

#[test]
fn test_mismatched_file_rates_fail() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let session_id = seed(&db, &ws, 12, None);
    let mut reader = reader();
    let second = format!(
        "O09_{}.rhd",
        (day_start() + Duration::seconds(FILE_SECONDS)).format("%y%m%d_%H%M%S")
    );
    reader.rate_overrides.insert(second, 20_000.0);

    let session = db.get_session(session_id).unwrap().unwrap();
    let err = LfpEngine::new(&db, &ws.locator, &reader)
        .populate(&session)
        .unwrap_err();
    assert_eq!(err.kind(), "consistency");
}

#[test]
fn test_fractional_downsample_ratio_rejected() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let session_id = seed(&db, &ws, 12, None);
    let reader = FakeReader::new(header(29_000.0, &[(Port::A, 64)]), 1_000);

    let session = db.get_session(session_id).unwrap().unwrap();
    let outcome = LfpEngine::new(&db, &ws.locator, &reader).populate(&session);
    match outcome {
        Err(e) => assert_eq!(e.kind(), "validation"),
        Ok(Outcome::Completed(_)) | Ok(Outcome::NotReady(_)) => panic!("expected rejection"),
    }
}

/// Returns only the first half of the requested rows.
struct HalfRowsReader(FakeReader);

impl RawReader for HalfRowsReader {
    fn read_header(&self, file: &Path) -> Result<RawHeader, Error> {
        self.0.read_header(file)
    }

    fn load_file(&self, file: &Path) -> Result<RawRecording, Error> {
        self.0.load_file(file)
    }

    fn load_rows(&self, file: &Path, rows: &[usize]) -> Result<(RawHeader, Array2<f32>), Error> {
        let (header, samples) = self.0.load_rows(file, rows)?;
        let half = samples.nrows() / 2;
        Ok((header, samples.slice(s![..half, ..]).to_owned()))
    }
}

#[test]
fn test_reader_returning_too_few_rows_fails() {
    let ws = Workspace::new();
    let db = Database::open_in_memory().unwrap();
    let session_id = seed(&db, &ws, 12, None);
    let reader = HalfRowsReader(reader());

    let session = db.get_session(session_id).unwrap().unwrap();
    let err = LfpEngine::new(&db, &ws.locator, &reader)
        .populate(&session)
        .unwrap_err();
    assert_eq!(err.kind(), "consistency");
    assert!(db.lfp_result(session_id).unwrap().is_none());
    assert!(db.lfp_traces(session_id).unwrap().is_empty());
}
