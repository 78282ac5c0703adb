//! Error types for the ingest engine

use std::path::PathBuf;

use dwh_common::ConfigError;
use thiserror::Error;

use crate::report::RunReport;
use crate::warehouse::WarehouseError;

/// Result type alias for ingest operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Run-level failures.
///
/// Row-level problems never show up here; they are counted in the
/// [`RunReport`] instead. Every variant below ends the run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Cannot open source file {}: {source}", path.display())]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Cannot read header row of {}: {source}", path.display())]
    SourceHeader {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Reading source failed after data row {row}: {source}")]
    SourceRead {
        row: i64,
        #[source]
        source: csv::Error,
    },

    #[error("Source {} is missing required column(s): {}", path.display(), columns.join(", "))]
    MissingColumns { path: PathBuf, columns: Vec<String> },

    #[error("Invalid target schema '{target}': {reason}")]
    Schema { target: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Truncating staging table {table} failed: {source}")]
    Truncate {
        table: String,
        #[source]
        source: WarehouseError,
    },

    #[error("Staging batch {batch} failed after {attempts} attempt(s): {source}")]
    BatchFailed {
        batch: usize,
        attempts: u32,
        #[source]
        source: WarehouseError,
        report: Box<RunReport>,
    },

    #[error("Merge from {staging} into {target} failed: {source}")]
    MergeFailed {
        staging: String,
        target: String,
        #[source]
        source: WarehouseError,
        report: Box<RunReport>,
    },

    #[error("Warehouse unavailable: {0}")]
    Warehouse(#[from] WarehouseError),
}

impl IngestError {
    pub(crate) fn schema(target: &str, reason: impl Into<String>) -> Self {
        Self::Schema {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    /// Counters accumulated before a batch or merge failure, if any.
    pub fn partial_report(&self) -> Option<&RunReport> {
        match self {
            Self::BatchFailed { report, .. } | Self::MergeFailed { report, .. } => Some(&**report),
            _ => None,
        }
    }
}
