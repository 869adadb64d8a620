use super::models::*;
use super::sqlite::Database;
use crate::probe::{Electrode, ElectrodeConfig};
use crate::sorting::stage::Stage;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Result, Row, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn decode<T: DeserializeOwned>(column: usize, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Blob, Box::new(e)))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: DeserializeOwned>(column: usize, text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

const RAW_FILE_COLUMNS: &str =
    "id, file_path, acq_software, file_time, parent_folder, filename_prefix";

fn raw_file_from_row(row: &Row<'_>) -> Result<RawFile> {
    Ok(RawFile {
        id: row.get(0)?,
        file_path: row.get(1)?,
        acq_software: row.get(2)?,
        file_time: row.get(3)?,
        parent_folder: row.get(4)?,
        filename_prefix: row.get(5)?,
    })
}

const SESSION_COLUMNS: &str =
    "s.id, s.experiment_ref, s.insertion_number, s.start_time, s.end_time, s.session_type";

fn session_from_row(row: &Row<'_>) -> Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        experiment_ref: row.get(1)?,
        insertion_number: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        session_type: row.get(5)?,
    })
}

const PARAMSET_COLUMNS: &str =
    "paramset_idx, clustering_method, description, content_hash, params";

fn parameter_set_from_row(row: &Row<'_>) -> Result<ParameterSet> {
    let params: String = row.get(4)?;
    Ok(ParameterSet {
        paramset_idx: row.get(0)?,
        clustering_method: row.get(1)?,
        description: row.get(2)?,
        content_hash: row.get(3)?,
        params: from_json(4, &params)?,
    })
}

const TASK_COLUMNS: &str = "t.id, t.session_id, t.paramset_idx, t.output_dir";

fn task_from_row(row: &Row<'_>) -> Result<ClusteringTask> {
    Ok(ClusteringTask {
        id: row.get(0)?,
        session_id: row.get(1)?,
        paramset_idx: row.get(2)?,
        output_dir: row.get(3)?,
    })
}

fn metric_columns() -> impl Iterator<Item = &'static str> {
    CLUSTER_METRIC_COLUMNS
        .iter()
        .chain(WAVEFORM_METRIC_COLUMNS.iter())
        .copied()
}

impl Database {
    // ── Raw Files ────────────────────────────────────────────────

    /// Insert cataloged files; paths already present are left untouched.
    pub fn insert_raw_files(&self, files: &[RawFile]) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO raw_file \
                 (file_path, acq_software, file_time, parent_folder, filename_prefix) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for file in files {
                count += stmt.execute(params![
                    file.file_path,
                    file.acq_software,
                    file.file_time,
                    file.parent_folder,
                    file.filename_prefix,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} of {} raw files", count, files.len());
        Ok(count)
    }

    /// Files whose acquisition time falls in `[start, end]`, oldest first.
    pub fn raw_files_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<RawFile>> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "SELECT {} FROM raw_file WHERE file_time >= ?1 AND file_time <= ?2 \
             ORDER BY file_time, file_path",
            RAW_FILE_COLUMNS
        ))?;
        let files = stmt
            .query_map(params![start, end], raw_file_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(files)
    }

    pub fn count_raw_files(&self) -> Result<i64> {
        self.connection()
            .query_row("SELECT COUNT(*) FROM raw_file", [], |row| row.get(0))
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Insert a session, or return the id of the one with the same natural key.
    pub fn insert_session(&self, session: &Session) -> Result<i64> {
        self.connection().execute(
            "INSERT OR IGNORE INTO session \
             (experiment_ref, insertion_number, start_time, end_time, session_type) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.experiment_ref,
                session.insertion_number,
                session.start_time,
                session.end_time,
                session.session_type,
            ],
        )?;
        self.connection().query_row(
            "SELECT id FROM session WHERE experiment_ref = ?1 AND insertion_number = ?2 \
             AND start_time = ?3 AND end_time = ?4",
            params![
                session.experiment_ref,
                session.insertion_number,
                session.start_time,
                session.end_time,
            ],
            |row| row.get(0),
        )
    }

    pub fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        self.connection()
            .query_row(
                &format!("SELECT {} FROM session s WHERE s.id = ?1", SESSION_COLUMNS),
                params![session_id],
                session_from_row,
            )
            .optional()
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM session s ORDER BY s.start_time, s.id",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub fn sessions_without_info(&self) -> Result<Vec<Session>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM session s \
             WHERE NOT EXISTS (SELECT 1 FROM session_info i WHERE i.session_id = s.id) \
             ORDER BY s.start_time, s.id",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub fn insert_session_info(&self, session_id: i64, header: &serde_json::Value) -> Result<()> {
        self.connection().execute(
            "INSERT INTO session_info (session_id, header) VALUES (?1, ?2)",
            params![session_id, to_json(header)?],
        )?;
        Ok(())
    }

    pub fn session_info(&self, session_id: i64) -> Result<Option<serde_json::Value>> {
        let text: Option<String> = self
            .connection()
            .query_row(
                "SELECT header FROM session_info WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        text.map(|t| from_json(0, &t)).transpose()
    }

    // ── Probes ───────────────────────────────────────────────────

    pub fn insert_probe(&self, probe: &Probe) -> Result<()> {
        self.connection().execute(
            "INSERT INTO probe (probe_id, probe_type) VALUES (?1, ?2) \
             ON CONFLICT(probe_id) DO UPDATE SET probe_type = excluded.probe_type",
            params![probe.probe_id, probe.probe_type],
        )?;
        Ok(())
    }

    pub fn get_probe(&self, probe_id: &str) -> Result<Option<Probe>> {
        self.connection()
            .query_row(
                "SELECT probe_id, probe_type FROM probe WHERE probe_id = ?1",
                params![probe_id],
                |row| {
                    Ok(Probe {
                        probe_id: row.get(0)?,
                        probe_type: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    /// Store a configuration and its electrodes. A probe type that already has a
    /// configuration keeps it; the stored id is returned either way.
    pub fn insert_electrode_config(&self, config: &ElectrodeConfig) -> Result<i64> {
        let tx = self.connection().unchecked_transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM electrode_config WHERE probe_type = ?1",
                params![config.probe_type],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        tx.execute(
            "INSERT INTO electrode_config (probe_type, electrode_config_hash) VALUES (?1, ?2)",
            params![config.probe_type, config.electrode_config_hash],
        )?;
        let config_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO electrode \
                 (config_id, electrode, channel_idx, shank, x_coord, y_coord) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for e in &config.electrodes {
                stmt.execute(params![
                    config_id,
                    e.electrode,
                    e.channel_idx,
                    e.shank,
                    e.x_coord,
                    e.y_coord
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            "Stored electrode config for '{}' ({} electrodes)",
            config.probe_type,
            config.electrodes.len()
        );
        Ok(config_id)
    }

    pub fn electrode_config(&self, probe_type: &str) -> Result<Option<ElectrodeConfig>> {
        let header: Option<(i64, String)> = self
            .connection()
            .query_row(
                "SELECT id, electrode_config_hash FROM electrode_config WHERE probe_type = ?1",
                params![probe_type],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((config_id, electrode_config_hash)) = header else {
            return Ok(None);
        };

        let mut stmt = self.connection().prepare_cached(
            "SELECT electrode, channel_idx, shank, x_coord, y_coord FROM electrode \
             WHERE config_id = ?1 ORDER BY electrode",
        )?;
        let electrodes = stmt
            .query_map(params![config_id], |row| {
                Ok(Electrode {
                    electrode: row.get(0)?,
                    channel_idx: row.get(1)?,
                    shank: row.get(2)?,
                    x_coord: row.get(3)?,
                    y_coord: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ElectrodeConfig {
            probe_type: probe_type.to_string(),
            electrode_config_hash,
            electrodes,
        }))
    }

    pub fn insert_probe_assignment(&self, assignment: &ProbeAssignment) -> Result<()> {
        let used = assignment
            .used_electrodes
            .as_ref()
            .map(|ids| to_json(ids))
            .transpose()?;
        self.connection().execute(
            "INSERT INTO probe_assignment (session_id, probe_id, port, used_electrodes) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(session_id) DO UPDATE SET probe_id = excluded.probe_id, \
                 port = excluded.port, used_electrodes = excluded.used_electrodes",
            params![assignment.session_id, assignment.probe_id, assignment.port, used],
        )?;
        Ok(())
    }

    pub fn probe_assignment(&self, session_id: i64) -> Result<Option<ProbeAssignment>> {
        self.connection()
            .query_row(
                "SELECT session_id, probe_id, port, used_electrodes FROM probe_assignment \
                 WHERE session_id = ?1",
                params![session_id],
                |row| {
                    let used: Option<String> = row.get(3)?;
                    Ok(ProbeAssignment {
                        session_id: row.get(0)?,
                        probe_id: row.get(1)?,
                        port: row.get(2)?,
                        used_electrodes: used.map(|t| from_json(3, &t)).transpose()?,
                    })
                },
            )
            .optional()
    }

    // ── LFP ──────────────────────────────────────────────────────

    /// LFP-typed sessions with a probe assignment and no stored LFP yet.
    pub fn pending_lfp_sessions(&self) -> Result<Vec<Session>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM session s \
             JOIN probe_assignment pa ON pa.session_id = s.id \
             WHERE s.session_type IN ('lfp', 'both') \
               AND NOT EXISTS (SELECT 1 FROM lfp l WHERE l.session_id = s.id) \
             ORDER BY s.start_time, s.id",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Store an LFP result and its traces in one transaction.
    pub fn insert_lfp(&self, result: &LfpResult, traces: &[LfpTrace]) -> Result<()> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO lfp \
             (session_id, lfp_sampling_rate, execution_duration, electrode_config_hash, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.session_id,
                result.lfp_sampling_rate,
                result.execution_duration,
                result.electrode_config_hash,
                Utc::now(),
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO lfp_trace (session_id, electrode, samples) VALUES (?1, ?2, ?3)",
            )?;
            for trace in traces {
                stmt.execute(params![result.session_id, trace.electrode, encode(&trace.samples)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn lfp_result(&self, session_id: i64) -> Result<Option<LfpResult>> {
        self.connection()
            .query_row(
                "SELECT session_id, lfp_sampling_rate, execution_duration, electrode_config_hash \
                 FROM lfp WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(LfpResult {
                        session_id: row.get(0)?,
                        lfp_sampling_rate: row.get(1)?,
                        execution_duration: row.get(2)?,
                        electrode_config_hash: row.get(3)?,
                    })
                },
            )
            .optional()
    }

    pub fn lfp_traces(&self, session_id: i64) -> Result<Vec<LfpTrace>> {
        let mut stmt = self.connection().prepare_cached(
            "SELECT electrode, samples FROM lfp_trace WHERE session_id = ?1 ORDER BY electrode",
        )?;
        let traces = stmt
            .query_map(params![session_id], |row| {
                let blob: Vec<u8> = row.get(1)?;
                Ok(LfpTrace {
                    electrode: row.get(0)?,
                    samples: decode(1, &blob)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(traces)
    }

    // ── Parameter Sets ───────────────────────────────────────────

    pub fn insert_parameter_set_row(&self, paramset: &ParameterSet) -> Result<()> {
        self.connection().execute(
            "INSERT INTO parameter_set \
             (paramset_idx, clustering_method, description, content_hash, params) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                paramset.paramset_idx,
                paramset.clustering_method,
                paramset.description,
                paramset.content_hash,
                to_json(&paramset.params)?,
            ],
        )?;
        Ok(())
    }

    pub fn parameter_set(&self, paramset_idx: i64) -> Result<Option<ParameterSet>> {
        self.connection()
            .query_row(
                &format!(
                    "SELECT {} FROM parameter_set WHERE paramset_idx = ?1",
                    PARAMSET_COLUMNS
                ),
                params![paramset_idx],
                parameter_set_from_row,
            )
            .optional()
    }

    pub fn parameter_set_by_hash(&self, content_hash: &str) -> Result<Option<ParameterSet>> {
        self.connection()
            .query_row(
                &format!(
                    "SELECT {} FROM parameter_set WHERE content_hash = ?1",
                    PARAMSET_COLUMNS
                ),
                params![content_hash],
                parameter_set_from_row,
            )
            .optional()
    }

    pub fn max_paramset_idx(&self) -> Result<Option<i64>> {
        self.connection()
            .query_row("SELECT MAX(paramset_idx) FROM parameter_set", [], |row| {
                row.get(0)
            })
    }

    pub fn list_parameter_sets(&self) -> Result<Vec<ParameterSet>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM parameter_set ORDER BY paramset_idx",
            PARAMSET_COLUMNS
        ))?;
        let sets = stmt
            .query_map([], parameter_set_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(sets)
    }

    // ── Clustering Tasks ─────────────────────────────────────────

    /// Insert a task, or return the existing one for the same (session, paramset).
    pub fn insert_clustering_task(
        &self,
        session_id: i64,
        paramset_idx: i64,
        output_dir: Option<&str>,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT OR IGNORE INTO clustering_task (session_id, paramset_idx, output_dir) \
             VALUES (?1, ?2, ?3)",
            params![session_id, paramset_idx, output_dir],
        )?;
        self.connection().query_row(
            "SELECT id FROM clustering_task WHERE session_id = ?1 AND paramset_idx = ?2",
            params![session_id, paramset_idx],
            |row| row.get(0),
        )
    }

    pub fn clustering_task(&self, task_id: i64) -> Result<Option<ClusteringTask>> {
        self.connection()
            .query_row(
                &format!("SELECT {} FROM clustering_task t WHERE t.id = ?1", TASK_COLUMNS),
                params![task_id],
                task_from_row,
            )
            .optional()
    }

    pub fn list_clustering_tasks(&self) -> Result<Vec<ClusteringTask>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM clustering_task t ORDER BY t.id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn set_task_output_dir(&self, task_id: i64, output_dir: &str) -> Result<()> {
        self.connection().execute(
            "UPDATE clustering_task SET output_dir = ?1 WHERE id = ?2",
            params![output_dir, task_id],
        )?;
        Ok(())
    }

    /// Tasks of sorting-typed sessions whose upstream stage is complete and which have
    /// nothing recorded for `stage` or any later stage.
    pub fn candidate_tasks(&self, stage: Stage) -> Result<Vec<ClusteringTask>> {
        let upstream = stage.upstream().map(|s| s.ordinal()).unwrap_or(0);
        let mut stmt = self.connection().prepare_cached(&format!(
            "SELECT {} FROM clustering_task t \
             JOIN session s ON s.id = t.session_id \
             WHERE s.session_type IN ('spike_sorting', 'both') \
               AND (?1 = 0 OR EXISTS (SELECT 1 FROM stage_result r \
                                      WHERE r.task_id = t.id AND r.stage_ordinal = ?1)) \
               AND NOT EXISTS (SELECT 1 FROM stage_result r \
                               WHERE r.task_id = t.id AND r.stage_ordinal >= ?2) \
             ORDER BY t.id",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![upstream, stage.ordinal()], task_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn completed_stages(&self, task_id: i64) -> Result<Vec<Stage>> {
        let mut stmt = self.connection().prepare_cached(
            "SELECT stage FROM stage_result WHERE task_id = ?1 ORDER BY stage_ordinal",
        )?;
        let stages = stmt
            .query_map(params![task_id], |row| row.get(0))?
            .collect::<Result<Vec<_>>>()?;
        Ok(stages)
    }

    pub fn stage_results(&self, task_id: i64) -> Result<Vec<StageResult>> {
        let mut stmt = self.connection().prepare_cached(
            "SELECT task_id, stage, execution_time, execution_duration FROM stage_result \
             WHERE task_id = ?1 ORDER BY stage_ordinal",
        )?;
        let results = stmt
            .query_map(params![task_id], |row| {
                Ok(StageResult {
                    task_id: row.get(0)?,
                    stage: row.get(1)?,
                    execution_time: row.get(2)?,
                    execution_duration: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Record a stage completion. Returns `false` (and writes nothing) when the upstream
    /// stage has no result yet or this stage is already recorded.
    pub fn insert_stage_result(&self, result: &StageResult) -> Result<bool> {
        insert_stage_result_in(self.connection(), result)
    }

    /// Record PostProcessing together with the clustering completion record.
    pub fn insert_postprocessing_result(
        &self,
        result: &StageResult,
        clustering_time: DateTime<Utc>,
    ) -> Result<bool> {
        let tx = self.connection().unchecked_transaction()?;
        if !insert_stage_result_in(&tx, result)? {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO clustering (task_id, clustering_time) VALUES (?1, ?2)",
            params![result.task_id, clustering_time],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn has_clustering(&self, task_id: i64) -> Result<bool> {
        self.connection().query_row(
            "SELECT EXISTS (SELECT 1 FROM clustering WHERE task_id = ?1)",
            params![task_id],
            |row| row.get(0),
        )
    }

    pub fn insert_export_files(
        &self,
        task_id: i64,
        kind: ExportKind,
        relative_paths: &[String],
    ) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO export_file (task_id, export_kind, file_path) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for path in relative_paths {
                count += stmt.execute(params![task_id, kind, path])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn export_files(&self, task_id: i64) -> Result<Vec<(ExportKind, String)>> {
        let mut stmt = self.connection().prepare_cached(
            "SELECT export_kind, file_path FROM export_file WHERE task_id = ?1 \
             ORDER BY export_kind, file_path",
        )?;
        let files = stmt
            .query_map(params![task_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(files)
    }

    // ── Units ────────────────────────────────────────────────────

    /// Clustered tasks whose units have not been aggregated.
    pub fn tasks_pending_units(&self) -> Result<Vec<ClusteringTask>> {
        self.tasks_with_clustering_missing("curated_clustering", "clustering")
    }

    pub fn tasks_pending_metrics(&self) -> Result<Vec<ClusteringTask>> {
        self.tasks_with_clustering_missing("quality_metrics", "curated_clustering")
    }

    pub fn tasks_pending_waveforms(&self) -> Result<Vec<ClusteringTask>> {
        self.tasks_with_clustering_missing("waveform_set", "curated_clustering")
    }

    fn tasks_with_clustering_missing(
        &self,
        missing: &str,
        required: &str,
    ) -> Result<Vec<ClusteringTask>> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "SELECT {cols} FROM clustering_task t \
             JOIN {required} req ON req.task_id = t.id \
             WHERE NOT EXISTS (SELECT 1 FROM {missing} m WHERE m.task_id = t.id) \
             ORDER BY t.id",
            cols = TASK_COLUMNS,
            required = required,
            missing = missing,
        ))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Write the aggregate record, then every unit, in one transaction.
    pub fn insert_units(&self, task_id: i64, units: &[UnitRecord]) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO curated_clustering (task_id, unit_count, created_at) VALUES (?1, ?2, ?3)",
            params![task_id, units.len() as i64, Utc::now()],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO sorted_unit \
                 (task_id, unit_id, peak_electrode, quality_label, spike_count, \
                  spike_times, spike_sites, spike_depths) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for unit in units {
                stmt.execute(params![
                    task_id,
                    unit.unit_id,
                    unit.peak_electrode,
                    unit.quality_label,
                    unit.spike_count as i64,
                    encode(&unit.spike_times)?,
                    encode(&unit.spike_sites)?,
                    encode(&unit.spike_depths)?,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} units for task {}", units.len(), task_id);
        Ok(units.len())
    }

    pub fn units(&self, task_id: i64) -> Result<Vec<UnitRecord>> {
        let mut stmt = self.connection().prepare_cached(
            "SELECT unit_id, peak_electrode, quality_label, spike_count, \
                    spike_times, spike_sites, spike_depths \
             FROM sorted_unit WHERE task_id = ?1 ORDER BY unit_id",
        )?;
        let units = stmt
            .query_map(params![task_id], |row| {
                let times: Vec<u8> = row.get(4)?;
                let sites: Vec<u8> = row.get(5)?;
                let depths: Vec<u8> = row.get(6)?;
                Ok(UnitRecord {
                    unit_id: row.get(0)?,
                    peak_electrode: row.get(1)?,
                    quality_label: row.get(2)?,
                    spike_count: row.get::<_, i64>(3)? as usize,
                    spike_times: decode(4, &times)?,
                    spike_sites: decode(5, &sites)?,
                    spike_depths: decode(6, &depths)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(units)
    }

    // ── Metrics ──────────────────────────────────────────────────

    pub fn insert_unit_metrics(&self, task_id: i64, metrics: &[UnitMetrics]) -> Result<usize> {
        let columns: Vec<&str> = metric_columns().collect();
        let placeholders: Vec<String> = (3..columns.len() + 3).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO unit_metric (task_id, unit_id, {}) VALUES (?1, ?2, {})",
            columns.join(", "),
            placeholders.join(", ")
        );

        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO quality_metrics (task_id, created_at) VALUES (?1, ?2)",
            params![task_id, Utc::now()],
        )?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for unit in metrics {
                let mut values = vec![Value::Integer(task_id), Value::Integer(unit.unit_id)];
                values.extend(columns.iter().map(|c| match unit.get(c) {
                    Some(v) => Value::Real(v),
                    None => Value::Null,
                }));
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(metrics.len())
    }

    pub fn unit_metrics(&self, task_id: i64) -> Result<Vec<UnitMetrics>> {
        let columns: Vec<&'static str> = metric_columns().collect();
        let mut stmt = self.connection().prepare_cached(&format!(
            "SELECT unit_id, {} FROM unit_metric WHERE task_id = ?1 ORDER BY unit_id",
            columns.join(", ")
        ))?;
        let metrics = stmt
            .query_map(params![task_id], |row| {
                let mut values = Vec::with_capacity(columns.len());
                for (i, column) in columns.iter().enumerate() {
                    values.push((*column, row.get::<_, Option<f64>>(i + 1)?));
                }
                Ok(UnitMetrics {
                    unit_id: row.get(0)?,
                    values,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(metrics)
    }

    // ── Waveforms ────────────────────────────────────────────────

    /// Open a transaction that writes the waveform aggregate record and then accepts one
    /// unit at a time. Nothing is visible until [`WaveformWriter::finish`].
    pub fn begin_waveforms(&self, task_id: i64) -> Result<WaveformWriter<'_>> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO waveform_set (task_id, created_at) VALUES (?1, ?2)",
            params![task_id, Utc::now()],
        )?;
        Ok(WaveformWriter {
            tx,
            task_id,
            units: 0,
        })
    }

    pub fn unit_waveforms(&self, task_id: i64, unit_id: i64) -> Result<Option<UnitWaveforms>> {
        let peak: Option<(u32, Vec<u8>)> = self
            .connection()
            .query_row(
                "SELECT peak_electrode, waveform FROM peak_waveform \
                 WHERE task_id = ?1 AND unit_id = ?2",
                params![task_id, unit_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((peak_electrode, peak_blob)) = peak else {
            return Ok(None);
        };

        let mut stmt = self.connection().prepare_cached(
            "SELECT electrode, waveform FROM unit_waveform \
             WHERE task_id = ?1 AND unit_id = ?2 ORDER BY electrode",
        )?;
        let electrode_waveforms = stmt
            .query_map(params![task_id, unit_id], |row| {
                let blob: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, decode(1, &blob)?))
            })?
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(UnitWaveforms {
            unit_id,
            peak_electrode,
            peak_electrode_waveform: decode(1, &peak_blob)?,
            electrode_waveforms,
        }))
    }
}

fn insert_stage_result_in(conn: &rusqlite::Connection, result: &StageResult) -> Result<bool> {
    let upstream = result.stage.upstream().map(|s| s.ordinal()).unwrap_or(0);
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO stage_result \
         (task_id, stage, stage_ordinal, execution_time, execution_duration) \
         SELECT ?1, ?2, ?3, ?4, ?5 \
         WHERE ?6 = 0 OR EXISTS (SELECT 1 FROM stage_result \
                                 WHERE task_id = ?1 AND stage_ordinal = ?6)",
        params![
            result.task_id,
            result.stage,
            result.stage.ordinal(),
            result.execution_time,
            result.execution_duration,
            upstream,
        ],
    )?;
    Ok(inserted == 1)
}

/// Streaming writer for per-unit waveforms.
pub struct WaveformWriter<'a> {
    tx: Transaction<'a>,
    task_id: i64,
    units: usize,
}

impl WaveformWriter<'_> {
    pub fn write(&mut self, unit: &UnitWaveforms) -> Result<()> {
        self.tx
            .prepare_cached(
                "INSERT INTO peak_waveform (task_id, unit_id, peak_electrode, waveform) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                self.task_id,
                unit.unit_id,
                unit.peak_electrode,
                encode(&unit.peak_electrode_waveform)?
            ])?;

        let mut stmt = self.tx.prepare_cached(
            "INSERT INTO unit_waveform (task_id, unit_id, electrode, waveform) \
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (electrode, waveform) in &unit.electrode_waveforms {
            stmt.execute(params![self.task_id, unit.unit_id, electrode, encode(waveform)?])?;
        }
        self.units += 1;
        Ok(())
    }

    /// Commit everything written so far; returns the number of units.
    pub fn finish(self) -> Result<usize> {
        self.tx.commit()?;
        debug!("Stored waveforms for {} units of task {}", self.units, self.task_id);
        Ok(self.units)
    }
}
