use crate::catalog::{self, CatalogResult};
use crate::config::{AppConfig, DEFAULT_DATABASE_PATH};
use crate::error::{Error, PassSummary};
use crate::lfp::LfpEngine;
use crate::locator::{ConfiguredLocator, DataLocator};
use crate::progress::PipelineReporter;
use crate::reader::RawReader;
use crate::sorting::orchestrator::pending_tasks;
use crate::sorting::{Aggregator, Orchestrator, SortingEngine, Stage};
use crate::storage::models::{ClusteringTask, Session};
use crate::storage::Database;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Wires configuration, storage and the locator into the pipeline passes.
pub struct EphysEngine {
    config: AppConfig,
    db_path: String,
    locator: ConfiguredLocator,
}

#[derive(Debug)]
pub struct SortingRunResult {
    pub stage_duration: Duration,
    pub aggregation_duration: Duration,
    pub stages: PassSummary,
    pub aggregation: PassSummary,
}

/// Work the next run would pick up.
#[derive(Debug, Default)]
pub struct PendingWork {
    pub session_info: Vec<Session>,
    pub lfp: Vec<Session>,
    pub stages: Vec<(Stage, Vec<ClusteringTask>)>,
    pub units: Vec<ClusteringTask>,
    pub metrics: Vec<ClusteringTask>,
    pub waveforms: Vec<ClusteringTask>,
}

impl EphysEngine {
    pub fn new(config: AppConfig) -> Result<Self, Error> {
        let locator = ConfiguredLocator::from_config(&config)?;
        let db_path = if config.database_path.is_empty() {
            DEFAULT_DATABASE_PATH.to_string()
        } else {
            config.database_path.clone()
        };
        Ok(Self {
            config,
            db_path,
            locator,
        })
    }

    pub fn with_db_path(mut self, path: &str) -> Self {
        self.db_path = path.to_string();
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn locator(&self) -> &ConfiguredLocator {
        &self.locator
    }

    pub fn open_database(&self) -> Result<Database, Error> {
        Ok(Database::open(&self.db_path)?)
    }

    /// Walk the configured roots and record every recognized raw file.
    pub fn catalog(&self, reporter: &dyn PipelineReporter) -> Result<CatalogResult, Error> {
        let roots: Vec<PathBuf> = self.locator.root_dirs().to_vec();
        info!("Cataloging directories: {:?}", roots);
        let db = self.open_database()?;
        catalog::catalog_roots(&db, &roots, &self.config.ignore_patterns, reporter)
    }

    pub fn session_info<R: RawReader + ?Sized>(
        &self,
        reader: &R,
        reporter: &dyn PipelineReporter,
    ) -> Result<PassSummary, Error> {
        let db = self.open_database()?;
        catalog::populate_all_session_info(&db, &self.locator, reader, reporter)
    }

    pub fn lfp<R: RawReader + ?Sized>(
        &self,
        reader: &R,
        reporter: &dyn PipelineReporter,
    ) -> Result<PassSummary, Error> {
        let db = self.open_database()?;
        LfpEngine::new(&db, &self.locator, reader)
            .with_jobs(self.config.jobs)
            .with_reporter(reporter)
            .populate_all()
    }

    /// Run every pending sorting stage, then aggregate whatever reached PostProcessing.
    pub fn sort<R: RawReader + ?Sized, E: SortingEngine>(
        &self,
        reader: &R,
        engine: &E,
        reporter: &dyn PipelineReporter,
    ) -> Result<SortingRunResult, Error> {
        let db = self.open_database()?;

        info!("Running pending sorting stages...");
        let stage_start = Instant::now();
        let stages = Orchestrator::new(&db, &self.locator, reader, engine)
            .with_jobs(self.config.jobs)
            .with_reporter(reporter)
            .run_all()?;
        let stage_duration = stage_start.elapsed();
        debug!(
            "Stages completed in {:.2}s: {} completed, {} skipped, {} failed",
            stage_duration.as_secs_f64(),
            stages.completed.len(),
            stages.skipped.len(),
            stages.failed.len()
        );

        info!("Aggregating units...");
        let aggregation_start = Instant::now();
        let aggregation = Aggregator::new(&db, &self.locator, engine)
            .with_reporter(reporter)
            .populate_all()?;
        let aggregation_duration = aggregation_start.elapsed();
        debug!(
            "Aggregation completed in {:.2}s: {} records",
            aggregation_duration.as_secs_f64(),
            aggregation.completed.len()
        );

        Ok(SortingRunResult {
            stage_duration,
            aggregation_duration,
            stages,
            aggregation,
        })
    }

    pub fn pending(&self) -> Result<PendingWork, Error> {
        let db = self.open_database()?;
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| pending_tasks(&db, stage).map(|tasks| (stage, tasks)))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(PendingWork {
            session_info: db.sessions_without_info()?,
            lfp: db.pending_lfp_sessions()?,
            stages,
            units: db.tasks_pending_units()?,
            metrics: db.tasks_pending_metrics()?,
            waveforms: db.tasks_pending_waveforms()?,
        })
    }
}
