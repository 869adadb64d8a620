mod bridge;
mod commands;
mod logging;
mod manifest;
mod progress;

use std::io::{self, Write};
use std::path::Path;
use std::process;

use bridge::{Bridge, BridgeEngine, BridgeReader};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use ephys_pipeline_core::{AppConfig, EphysEngine, Error, PassSummary};
use progress::CliReporter;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match ephys_pipeline_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let engine = match EphysEngine::new(config.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            error!("Error initializing pipeline: {}", err);
            process::exit(1);
        }
    };

    let result = match args.command {
        Some(Commands::Catalog) => run_catalog(&engine),
        Some(Commands::Import { manifest }) => run_import(&engine, &manifest),
        Some(Commands::AddParams { file }) => run_add_params(&engine, &file),
        Some(Commands::SessionInfo) => run_session_info(&engine, &config),
        Some(Commands::Lfp) => run_lfp(&engine, &config),
        Some(Commands::Sort) => run_sort(&engine, &config),
        Some(Commands::Pending) => run_pending(&engine),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:?}", config);
            Ok(())
        }
        Some(Commands::TruncateDb) => {
            match prompt_confirm(
                "Are you SURE you want to COMPLETELY DELETE the Database?",
                Some(false),
            ) {
                Ok(true) => engine
                    .open_database()
                    .and_then(|db| Ok(db.truncate_all()?))
                    .map(|_| println!("All tables truncated")),
                _ => process::exit(0),
            }
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {}", err);
        process::exit(1);
    }

    Ok(())
}

fn open_bridge(app_config: &AppConfig) -> Result<Bridge, Error> {
    let bridge_config = app_config.bridge.as_ref().ok_or_else(|| {
        Error::Config(config::ConfigError::Message(
            "no [bridge] section configured; it is required to read raw data".to_string(),
        ))
    })?;
    Bridge::from_config(bridge_config)
}

fn run_catalog(engine: &EphysEngine) -> Result<(), Error> {
    let reporter = CliReporter::new();
    let result = engine.catalog(&reporter)?;

    println!();
    info!(
        "Catalog: {}, {} files found, {} new",
        format!("{:.2}s", result.scan_duration.as_secs_f64()).green(),
        format!("{}", result.files_found).cyan(),
        format!("{}", result.files_inserted).cyan(),
    );
    for (software, count) in &result.by_software {
        info!("  {}: {}", software, count);
    }
    Ok(())
}

fn run_import(engine: &EphysEngine, path: &Path) -> Result<(), Error> {
    let manifest: manifest::Manifest = manifest::read_json(path)?;
    let db = engine.open_database()?;
    let summary = manifest::import(&db, &manifest)?;
    info!(
        "{} sessions, {} probe assignments, {} clustering tasks imported",
        format!("{}", summary.sessions).cyan(),
        format!("{}", summary.assignments).cyan(),
        format!("{}", summary.tasks).cyan(),
    );
    Ok(())
}

fn run_add_params(engine: &EphysEngine, path: &Path) -> Result<(), Error> {
    let file: manifest::ParamsFile = manifest::read_json(path)?;
    let db = engine.open_database()?;
    let idx = manifest::add_params(&db, &file)?;
    info!(
        "Parameter set {} registered for {}",
        format!("{}", idx).green(),
        file.clustering_method
    );
    Ok(())
}

fn run_session_info(engine: &EphysEngine, config: &AppConfig) -> Result<(), Error> {
    let reader = BridgeReader::new(open_bridge(config)?);
    let summary = engine.session_info(&reader, &CliReporter::new())?;
    report("session_info", &summary);
    Ok(())
}

fn run_lfp(engine: &EphysEngine, config: &AppConfig) -> Result<(), Error> {
    let reader = BridgeReader::new(open_bridge(config)?);
    let summary = engine.lfp(&reader, &CliReporter::new())?;
    report("lfp", &summary);
    Ok(())
}

fn run_sort(engine: &EphysEngine, config: &AppConfig) -> Result<(), Error> {
    let bridge = open_bridge(config)?;
    let reader = BridgeReader::new(bridge.clone());
    let sorting = BridgeEngine::new(bridge);
    let result = engine.sort(&reader, &sorting, &CliReporter::new())?;

    println!();
    info!(
        "Stages: {}, Aggregation: {}",
        format!("{:.2}s", result.stage_duration.as_secs_f64()).green(),
        format!("{:.2}s", result.aggregation_duration.as_secs_f64()).green(),
    );
    report("stages", &result.stages);
    report("aggregation", &result.aggregation);
    Ok(())
}

fn run_pending(engine: &EphysEngine) -> Result<(), Error> {
    let pending = engine.pending()?;
    info!("{} sessions without session info", format!("{}", pending.session_info.len()).cyan());
    info!("{} sessions pending LFP", format!("{}", pending.lfp.len()).cyan());
    for (stage, tasks) in &pending.stages {
        let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        info!("{}: {} tasks {:?}", stage, format!("{}", tasks.len()).cyan(), ids);
    }
    info!(
        "Aggregation: {} units, {} metrics, {} waveforms pending",
        format!("{}", pending.units.len()).cyan(),
        format!("{}", pending.metrics.len()).cyan(),
        format!("{}", pending.waveforms.len()).cyan(),
    );
    Ok(())
}

fn report(pass: &str, summary: &PassSummary) {
    info!(
        "{}: {} completed, {} skipped, {} failed",
        pass,
        format!("{}", summary.completed.len()).green(),
        format!("{}", summary.skipped.len()).yellow(),
        format!("{}", summary.failed.len()).red(),
    );
    for (id, reason) in &summary.skipped {
        info!("  skipped #{}: {}", id, reason);
    }
    for (id, kind, message) in &summary.failed {
        error!("  failed #{} [{}]: {}", id, kind, message);
    }
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
