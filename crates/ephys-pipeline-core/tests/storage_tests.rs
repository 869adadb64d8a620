use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use ephys_pipeline_core::probe::{Electrode, ElectrodeConfig};
use ephys_pipeline_core::sorting::Stage;
use ephys_pipeline_core::storage::models::*;
use ephys_pipeline_core::storage::Database;
use serde_json::json;

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 5)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn make_raw_file(path: &str, time: NaiveDateTime) -> RawFile {
    RawFile {
        id: 0,
        file_path: path.to_string(),
        acq_software: AcquisitionSoftware::Intan,
        file_time: time,
        parent_folder: "O09".to_string(),
        filename_prefix: "O09".to_string(),
    }
}

fn make_session(start: NaiveDateTime, minutes: i64, session_type: SessionType) -> Session {
    Session {
        id: 0,
        experiment_ref: "O09".to_string(),
        insertion_number: 1,
        start_time: start,
        end_time: start + Duration::minutes(minutes),
        session_type,
    }
}

fn stage_result(task_id: i64, stage: Stage) -> StageResult {
    StageResult {
        task_id,
        stage,
        execution_time: Utc::now(),
        execution_duration: 0.01,
    }
}

fn seed_task(db: &Database) -> i64 {
    let session_id = db
        .insert_session(&make_session(at(14, 0), 10, SessionType::SpikeSorting))
        .unwrap();
    db.insert_parameter_set_row(&ParameterSet {
        paramset_idx: 1,
        clustering_method: "kilosort4".to_string(),
        description: "default".to_string(),
        content_hash: "abc".to_string(),
        params: json!({"SI_SORTING_PARAMS": {}}),
    })
    .unwrap();
    db.insert_clustering_task(session_id, 1, None).unwrap()
}

#[test]
fn test_raw_files_are_inserted_once() {
    let db = Database::open_in_memory().unwrap();
    let files = vec![
        make_raw_file("O09/O09_240305_140000.rhd", at(14, 0)),
        make_raw_file("O09/O09_240305_140500.rhd", at(14, 5)),
    ];
    assert_eq!(db.insert_raw_files(&files).unwrap(), 2);
    assert_eq!(db.insert_raw_files(&files).unwrap(), 0);
    assert_eq!(db.count_raw_files().unwrap(), 2);
}

#[test]
fn test_raw_files_between_is_inclusive_and_ordered() {
    let db = Database::open_in_memory().unwrap();
    db.insert_raw_files(&[
        make_raw_file("c.rhd", at(14, 10)),
        make_raw_file("a.rhd", at(14, 0)),
        make_raw_file("b.rhd", at(14, 5)),
        make_raw_file("late.rhd", at(14, 11)),
    ])
    .unwrap();

    let files = db.raw_files_between(at(14, 0), at(14, 10)).unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.file_path.as_str()).collect();
    assert_eq!(names, vec!["a.rhd", "b.rhd", "c.rhd"]);
    assert_eq!(files[0].acq_software, AcquisitionSoftware::Intan);
}

#[test]
fn test_insert_session_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let session = make_session(at(14, 0), 10, SessionType::Lfp);
    let first = db.insert_session(&session).unwrap();
    let second = db.insert_session(&session).unwrap();
    assert_eq!(first, second);

    let stored = db.get_session(first).unwrap().unwrap();
    assert_eq!(stored.session_type, SessionType::Lfp);
    assert!((stored.duration_minutes() - 10.0).abs() < 1e-9);
    assert_eq!(db.list_sessions().unwrap().len(), 1);
}

#[test]
fn test_session_info_round_trip() {
    let db = Database::open_in_memory().unwrap();
    let id = db
        .insert_session(&make_session(at(9, 0), 5, SessionType::Both))
        .unwrap();
    assert_eq!(db.sessions_without_info().unwrap().len(), 1);

    db.insert_session_info(id, &json!({"sample_rate": 30000.0})).unwrap();
    assert_eq!(db.session_info(id).unwrap().unwrap()["sample_rate"], 30000.0);
    assert!(db.sessions_without_info().unwrap().is_empty());
}

#[test]
fn test_electrode_config_kept_per_probe_type() {
    let db = Database::open_in_memory().unwrap();
    let electrode = |electrode, channel_idx| Electrode {
        electrode,
        channel_idx,
        shank: 0,
        x_coord: 0.0,
        y_coord: 15.0,
    };
    let config = ElectrodeConfig::new("H6", vec![electrode(2, 1), electrode(1, 0)]);
    let id = db.insert_electrode_config(&config).unwrap();

    let other = ElectrodeConfig::new("H6", vec![electrode(5, 5)]);
    assert_eq!(db.insert_electrode_config(&other).unwrap(), id);

    let stored = db.electrode_config("H6").unwrap().unwrap();
    assert_eq!(stored.electrode_config_hash, config.electrode_config_hash);
    assert_eq!(stored.electrodes.len(), 2);
    assert_eq!(stored.electrodes[0].electrode, 1);
    assert!(db.electrode_config("H5").unwrap().is_none());
}

#[test]
fn test_probe_assignment_upsert() {
    let db = Database::open_in_memory().unwrap();
    let session_id = db
        .insert_session(&make_session(at(14, 0), 10, SessionType::Lfp))
        .unwrap();
    db.insert_probe(&Probe {
        probe_id: "p1".to_string(),
        probe_type: "H6".to_string(),
    })
    .unwrap();

    let mut assignment = ProbeAssignment {
        session_id,
        probe_id: "p1".to_string(),
        port: Port::A,
        used_electrodes: None,
    };
    db.insert_probe_assignment(&assignment).unwrap();
    assert_eq!(db.probe_assignment(session_id).unwrap().unwrap().used_electrodes, None);

    assignment.port = Port::C;
    assignment.used_electrodes = Some(vec![3, 1]);
    db.insert_probe_assignment(&assignment).unwrap();
    let stored = db.probe_assignment(session_id).unwrap().unwrap();
    assert_eq!(stored.port, Port::C);
    assert_eq!(stored.used_electrodes, Some(vec![3, 1]));
}

#[test]
fn test_pending_lfp_sessions_require_assignment_and_type() {
    let db = Database::open_in_memory().unwrap();
    let lfp = db
        .insert_session(&make_session(at(10, 0), 10, SessionType::Lfp))
        .unwrap();
    let sorting = db
        .insert_session(&make_session(at(11, 0), 10, SessionType::SpikeSorting))
        .unwrap();
    db.insert_probe(&Probe {
        probe_id: "p1".to_string(),
        probe_type: "H6".to_string(),
    })
    .unwrap();
    for session_id in [lfp, sorting] {
        db.insert_probe_assignment(&ProbeAssignment {
            session_id,
            probe_id: "p1".to_string(),
            port: Port::A,
            used_electrodes: None,
        })
        .unwrap();
    }

    let pending: Vec<i64> = db.pending_lfp_sessions().unwrap().iter().map(|s| s.id).collect();
    assert_eq!(pending, vec![lfp]);

    db.insert_lfp(
        &LfpResult {
            session_id: lfp,
            lfp_sampling_rate: 2500.0,
            execution_duration: 0.001,
            electrode_config_hash: "h".to_string(),
        },
        &[LfpTrace {
            electrode: 7,
            samples: vec![0.5, -0.5],
        }],
    )
    .unwrap();
    assert!(db.pending_lfp_sessions().unwrap().is_empty());
    assert_eq!(db.lfp_traces(lfp).unwrap()[0].samples, vec![0.5, -0.5]);
}

#[test]
fn test_stage_results_are_guarded_by_upstream() {
    let db = Database::open_in_memory().unwrap();
    let task_id = seed_task(&db);

    assert!(!db.insert_stage_result(&stage_result(task_id, Stage::Sorting)).unwrap());
    assert!(db.insert_stage_result(&stage_result(task_id, Stage::PreProcessing)).unwrap());
    assert!(!db.insert_stage_result(&stage_result(task_id, Stage::PreProcessing)).unwrap());
    assert!(db.insert_stage_result(&stage_result(task_id, Stage::Sorting)).unwrap());

    assert_eq!(
        db.completed_stages(task_id).unwrap(),
        vec![Stage::PreProcessing, Stage::Sorting]
    );
    assert!(db.candidate_tasks(Stage::Sorting).unwrap().is_empty());
    assert_eq!(db.candidate_tasks(Stage::PostProcessing).unwrap().len(), 1);

    assert!(!db.has_clustering(task_id).unwrap());
    assert!(db
        .insert_postprocessing_result(&stage_result(task_id, Stage::PostProcessing), Utc::now())
        .unwrap());
    assert!(db.has_clustering(task_id).unwrap());
    assert_eq!(db.tasks_pending_units().unwrap().len(), 1);
}

#[test]
fn test_units_metrics_and_waveforms() {
    let db = Database::open_in_memory().unwrap();
    let task_id = seed_task(&db);

    db.insert_units(
        task_id,
        &[UnitRecord {
            unit_id: 4,
            peak_electrode: 12,
            quality_label: "mua".to_string(),
            spike_count: 2,
            spike_times: vec![0.5, 1.5],
            spike_sites: vec![12, 13],
            spike_depths: vec![100.0, 120.0],
        }],
    )
    .unwrap();
    let units = db.units(task_id).unwrap();
    assert_eq!(units[0].spike_sites, vec![12, 13]);
    assert_eq!(db.tasks_pending_metrics().unwrap().len(), 1);

    db.insert_unit_metrics(
        task_id,
        &[UnitMetrics {
            unit_id: 4,
            values: vec![("snr", Some(7.5)), ("spread", None)],
        }],
    )
    .unwrap();
    let metrics = db.unit_metrics(task_id).unwrap();
    assert_eq!(metrics[0].get("snr"), Some(7.5));
    assert_eq!(metrics[0].get("spread"), None);
    assert!(db.tasks_pending_metrics().unwrap().is_empty());

    let mut writer = db.begin_waveforms(task_id).unwrap();
    writer
        .write(&UnitWaveforms {
            unit_id: 4,
            peak_electrode: 12,
            peak_electrode_waveform: vec![1.0, 2.0],
            electrode_waveforms: vec![(13, vec![0.0, 0.5]), (12, vec![1.0, 2.0])],
        })
        .unwrap();
    assert_eq!(writer.finish().unwrap(), 1);

    let stored = db.unit_waveforms(task_id, 4).unwrap().unwrap();
    assert_eq!(stored.peak_electrode, 12);
    assert_eq!(stored.electrode_waveforms[0].0, 12);
    assert!(db.tasks_pending_waveforms().unwrap().is_empty());
}

#[test]
fn test_truncate_all() {
    let db = Database::open_in_memory().unwrap();
    seed_task(&db);
    db.insert_raw_files(&[make_raw_file("a.rhd", at(14, 0))]).unwrap();

    db.truncate_all().unwrap();
    assert_eq!(db.count_raw_files().unwrap(), 0);
    assert!(db.list_sessions().unwrap().is_empty());
    assert!(db.list_clustering_tasks().unwrap().is_empty());
}

#[test]
fn test_foreign_schema_version_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.db");
    {
        let db = Database::open(&path).unwrap();
        db.insert_raw_files(&[make_raw_file("O09/O09_240305_100000.rhd", at(10, 0))])
            .unwrap();
        db.connection().execute_batch("PRAGMA user_version = 7;").unwrap();
    }

    let db = Database::open(&path).unwrap();
    assert_eq!(db.count_raw_files().unwrap(), 0);
    let version: i64 = db
        .connection()
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap();
    assert_eq!(version, 1);
}

#[test]
fn test_tasks_of_lfp_only_sessions_are_never_candidates() {
    let db = Database::open_in_memory().unwrap();
    let sorting_task = seed_task(&db);
    let lfp_session = db
        .insert_session(&make_session(at(16, 0), 10, SessionType::Lfp))
        .unwrap();
    db.insert_clustering_task(lfp_session, 1, None).unwrap();

    let ids: Vec<i64> = db
        .candidate_tasks(Stage::PreProcessing)
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![sorting_task]);
}
