use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read raw file {path}: {message}")]
    RawRead { path: PathBuf, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External engine error: {0}")]
    Engine(String),
}

impl Error {
    /// Short category name used in pass summaries and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) | Error::RawRead { .. } => "io",
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Serialization(_) | Error::Encoding(_) => "serialization",
            Error::Validation(_) => "validation",
            Error::Consistency(_) => "consistency",
            Error::Unsupported(_) => "unsupported",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Engine(_) => "engine",
        }
    }
}

/// Result of a unit of work that may legitimately have nothing to do yet.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    /// Inputs are not available yet (e.g. raw files still arriving). Not a failure.
    NotReady(String),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::NotReady(_) => None,
        }
    }
}

/// Per-item results of one population pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PassSummary {
    pub completed: Vec<i64>,
    /// (id, reason) for items whose inputs were not ready.
    pub skipped: Vec<(i64, String)>,
    /// (id, error kind, message) for items that failed.
    pub failed: Vec<(i64, &'static str, String)>,
}

impl PassSummary {
    pub fn record<T>(&mut self, id: i64, result: &Result<Outcome<T>, Error>) {
        match result {
            Ok(Outcome::Completed(_)) => self.completed.push(id),
            Ok(Outcome::NotReady(reason)) => self.skipped.push((id, reason.clone())),
            Err(e) => self.failed.push((id, e.kind(), e.to_string())),
        }
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.skipped.len() + self.failed.len()
    }

    pub fn merge(&mut self, other: PassSummary) {
        self.completed.extend(other.completed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}
