use rusqlite::{Connection, Result};
use std::path::Path;
use tracing::debug;

pub const SCHEMA_VERSION: i64 = 1;

/// Tables in dependency order (children first), for drops and truncation.
const TABLES: [&str; 20] = [
    "unit_waveform",
    "peak_waveform",
    "waveform_set",
    "unit_metric",
    "quality_metrics",
    "sorted_unit",
    "curated_clustering",
    "export_file",
    "clustering",
    "stage_result",
    "clustering_task",
    "parameter_set",
    "lfp_trace",
    "lfp",
    "probe_assignment",
    "electrode",
    "electrode_config",
    "probe",
    "session_info",
    "session",
];

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -64000;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, 64MB cache)");
        Ok(())
    }

    /// Create the schema, dropping tables written by any other layout first.
    /// The raw-file catalog is rebuilt by the next catalog pass.
    fn migrate_schema(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version != 0 && version != SCHEMA_VERSION {
            debug!(
                "Schema version {} != {}, dropping all tables and recreating",
                version, SCHEMA_VERSION
            );
            for table in TABLES.iter().chain(std::iter::once(&"raw_file")) {
                self.conn
                    .execute_batch(&format!("DROP TABLE IF EXISTS {};", table))?;
            }
        }

        self.conn.execute_batch(include_str!("schema.sql"))?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn truncate_all(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for table in TABLES.iter().chain(std::iter::once(&"raw_file")) {
            tx.execute_batch(&format!("DELETE FROM {};", table))?;
        }
        tx.commit()?;
        debug!("All tables truncated");
        Ok(())
    }
}
