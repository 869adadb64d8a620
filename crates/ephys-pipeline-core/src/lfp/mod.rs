//! LFP extraction: duration gates, channel selection, multi-file concatenation,
//! notch filtering and decimation to the target rate.

pub mod filter;

use crate::catalog;
use crate::config::JobConfig;
use crate::error::{Error, Outcome, PassSummary};
use crate::locator::DataLocator;
use crate::probe::{self, ElectrodeConfig};
use crate::progress::{PipelineReporter, SilentReporter};
use crate::reader::RawReader;
use crate::storage::models::{LfpResult, LfpTrace, ProbeAssignment, Session};
use crate::storage::Database;
use filter::{iir_notch, Decimator};
use ndarray::{concatenate, Array2, Axis};
use rayon::prelude::*;
use std::io;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const TARGET_SAMPLING_RATE: f64 = 2500.0;
pub const POWERLINE_NOISE_FREQ: f64 = 60.0;
pub const MAX_DURATION_MINUTES: f64 = 30.0;
pub const NOTCH_QUALITY_FACTOR: f64 = 30.0;
/// Relative tolerance between `sample_rate / TARGET_SAMPLING_RATE` and its rounding.
pub const RATIO_TOLERANCE: f64 = 0.01;
/// Allowed gap between the concatenated trace length and the declared session length.
pub const DURATION_TOLERANCE_MINUTES: f64 = 0.5;

pub fn check_session_duration(duration_minutes: f64) -> Result<(), Error> {
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(Error::Validation(format!(
            "LFP session duration {:.2} min exceeds the maximum of {} min",
            duration_minutes, MAX_DURATION_MINUTES
        )));
    }
    Ok(())
}

/// Integer decimation factor taking `sample_rate` to the target rate.
pub fn downsample_factor(sample_rate: f64) -> Result<usize, Error> {
    let ratio = sample_rate / TARGET_SAMPLING_RATE;
    let factor = ratio.round();
    if !ratio.is_finite() || factor < 1.0 {
        return Err(Error::Validation(format!(
            "sample rate {} Hz is below the LFP target of {} Hz",
            sample_rate, TARGET_SAMPLING_RATE
        )));
    }
    if (ratio - factor).abs() > 1e-8 + RATIO_TOLERANCE * factor {
        return Err(Error::Validation(format!(
            "downsampling ratio {:.4} is too far from an integer; check the LFP sampling rate",
            ratio
        )));
    }
    Ok(factor as usize)
}

/// Compare the concatenated trace length against the declared session length.
/// Returns the trace duration in minutes.
pub fn check_trace_duration(
    total_samples: usize,
    sample_rate: f64,
    declared_minutes: f64,
) -> Result<f64, Error> {
    let trace_minutes = total_samples as f64 / sample_rate / 60.0;
    if (trace_minutes - declared_minutes).abs() > DURATION_TOLERANCE_MINUTES {
        return Err(Error::Consistency(format!(
            "trace duration mismatch: expected {:.3} min, got {:.3} min",
            declared_minutes, trace_minutes
        )));
    }
    Ok(trace_minutes)
}

/// Everything needed to extract one session's LFP.
pub struct LfpRequest<'a> {
    pub session: &'a Session,
    /// Raw files in acquisition-time order.
    pub files: &'a [PathBuf],
    pub electrode_config: &'a ElectrodeConfig,
    pub assignment: &'a ProbeAssignment,
}

#[derive(Debug, Clone)]
pub struct LfpExtraction {
    /// Realized output rate, `sample_rate / downsample_factor`.
    pub sampling_rate: f64,
    pub downsample_factor: usize,
    pub powerline_frequency: f64,
    /// One trace per selected electrode, in raw row order.
    pub traces: Vec<LfpTrace>,
    /// Hours.
    pub execution_duration: f64,
}

pub fn extract_lfp<R: RawReader + ?Sized>(
    reader: &R,
    request: &LfpRequest<'_>,
    jobs: &JobConfig,
) -> Result<Outcome<LfpExtraction>, Error> {
    let declared_minutes = request.session.duration_minutes();
    check_session_duration(declared_minutes)?;

    let Some(first) = request.files.first() else {
        return Ok(Outcome::NotReady(format!(
            "no raw files between {} and {}",
            request.session.start_time, request.session.end_time
        )));
    };
    let started = Instant::now();

    let header = reader.read_header(first)?;
    let sample_rate = header.sample_rate;
    let factor = downsample_factor(sample_rate)?;
    let powerline_frequency = header.notch_filter_frequency.unwrap_or(POWERLINE_NOISE_FREQ);

    let channel_map = probe::resolve(
        request.electrode_config,
        request.assignment.port,
        request.assignment.used_electrodes.as_deref(),
    )?;
    let bindings = channel_map.bind_rows(&header.amplifier_channels)?;
    let rows: Vec<usize> = bindings.iter().map(|b| b.row).collect();
    debug!(
        "Session {}: {} files, {} channels, factor {}, notch {} Hz",
        request.session.id,
        request.files.len(),
        rows.len(),
        factor,
        powerline_frequency
    );

    let mut chunks: Vec<Array2<f32>> = Vec::with_capacity(request.files.len());
    for file in request.files {
        let (file_header, samples) = reader.load_rows(file, &rows)?;
        if samples.nrows() != rows.len() {
            return Err(Error::Consistency(format!(
                "{} returned {} channels, expected {}",
                file.display(),
                samples.nrows(),
                rows.len()
            )));
        }
        if file_header.sample_rate != sample_rate {
            return Err(Error::Consistency(format!(
                "{} is sampled at {} Hz, expected {} Hz",
                file.display(),
                file_header.sample_rate,
                sample_rate
            )));
        }
        chunks.push(samples);
    }
    let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
    let full = concatenate(Axis(1), &views)
        .map_err(|e| Error::Consistency(format!("cannot concatenate raw files: {}", e)))?;
    drop(chunks);

    check_trace_duration(full.ncols(), sample_rate, declared_minutes)?;

    let notch = iir_notch(powerline_frequency, sample_rate, NOTCH_QUALITY_FACTOR)?;
    let decimator = Decimator::new(factor)?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.worker_count())
        .build()
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

    let filtered: Vec<Vec<f32>> = pool.install(|| {
        (0..full.nrows())
            .into_par_iter()
            .map(|row| {
                let raw: Vec<f64> = full.row(row).iter().map(|&v| v as f64).collect();
                decimator
                    .apply(&notch.filtfilt(&raw))
                    .into_iter()
                    .map(|v| v as f32)
                    .collect()
            })
            .collect()
    });

    let traces = bindings
        .iter()
        .zip(filtered)
        .map(|(binding, samples)| LfpTrace {
            electrode: binding.electrode,
            samples,
        })
        .collect();

    Ok(Outcome::Completed(LfpExtraction {
        sampling_rate: sample_rate / factor as f64,
        downsample_factor: factor,
        powerline_frequency,
        traces,
        execution_duration: started.elapsed().as_secs_f64() / 3600.0,
    }))
}

/// Populates LFP results for pending sessions.
pub struct LfpEngine<'a, R: RawReader + ?Sized> {
    db: &'a Database,
    locator: &'a dyn DataLocator,
    reader: &'a R,
    jobs: JobConfig,
    reporter: &'a dyn PipelineReporter,
}

impl<'a, R: RawReader + ?Sized> LfpEngine<'a, R> {
    pub fn new(db: &'a Database, locator: &'a dyn DataLocator, reader: &'a R) -> Self {
        Self {
            db,
            locator,
            reader,
            jobs: JobConfig::default(),
            reporter: &SilentReporter,
        }
    }

    pub fn with_jobs(mut self, jobs: JobConfig) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_reporter(mut self, reporter: &'a dyn PipelineReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn pending_sessions(&self) -> Result<Vec<Session>, Error> {
        Ok(self.db.pending_lfp_sessions()?)
    }

    /// Extract and store LFP for one session.
    pub fn populate(&self, session: &Session) -> Result<Outcome<LfpResult>, Error> {
        check_session_duration(session.duration_minutes())?;

        let files = catalog::session_files(self.db, self.locator, session)?;
        if files.is_empty() {
            let reason = format!("no raw data files for session {}", session.id);
            info!("{}; skipping LFP", reason);
            return Ok(Outcome::NotReady(reason));
        }
        info!("Populating LFP for session {}", session.id);

        let (assignment, electrode_config) = probe::session_geometry(self.db, session.id)?;

        let paths: Vec<PathBuf> = files.into_iter().map(|(_, path)| path).collect();
        let request = LfpRequest {
            session,
            files: &paths,
            electrode_config: &electrode_config,
            assignment: &assignment,
        };
        let extraction = match extract_lfp(self.reader, &request, &self.jobs)? {
            Outcome::Completed(extraction) => extraction,
            Outcome::NotReady(reason) => return Ok(Outcome::NotReady(reason)),
        };

        let result = LfpResult {
            session_id: session.id,
            lfp_sampling_rate: extraction.sampling_rate,
            execution_duration: extraction.execution_duration,
            electrode_config_hash: electrode_config.electrode_config_hash.clone(),
        };
        self.db.insert_lfp(&result, &extraction.traces)?;
        debug!(
            "Stored {} LFP traces for session {} at {} Hz",
            extraction.traces.len(),
            session.id,
            extraction.sampling_rate
        );
        Ok(Outcome::Completed(result))
    }

    pub fn populate_all(&self) -> Result<PassSummary, Error> {
        let pending = self.pending_sessions()?;
        let started = Instant::now();
        self.reporter.on_pass_start("lfp", pending.len());

        let mut summary = PassSummary::default();
        for session in &pending {
            self.reporter.on_item_start("lfp", session.id);
            let result = self.populate(session);
            match &result {
                Ok(Outcome::NotReady(reason)) => warn!("Session {} skipped: {}", session.id, reason),
                Err(e) => error!("LFP failed for session {}: {}", session.id, e),
                Ok(Outcome::Completed(_)) => {}
            }
            summary.record(session.id, &result);
            self.reporter.on_item_complete("lfp", session.id);
        }

        self.reporter
            .on_pass_complete("lfp", &summary, started.elapsed().as_secs_f64());
        Ok(summary)
    }
}
