//! Warehouse backends
//!
//! The engine needs exactly four primitives from a store: truncate a staging
//! relation, append typed rows in one transaction, run one set-based merge in
//! one transaction, and count a relation. [`Warehouse`] is that contract;
//! [`PgWarehouse`] and [`MemoryWarehouse`] implement it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::ValidatedRecord;
use crate::schema::{ColumnSpec, ConflictPolicy, TableName, TargetSchema};

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

/// Failures reported by a warehouse backend
#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Warehouse configuration error: {0}")]
    Config(String),

    #[error("Warehouse unavailable: {0}")]
    Unavailable(String),

    #[error("Row shape mismatch: {0}")]
    Shape(String),
}

pub type WarehouseResult<T> = std::result::Result<T, WarehouseError>;

/// Everything a backend needs to reconcile staging into a permanent table
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub staging: TableName,
    pub target: TableName,
    pub columns: Vec<String>,
    pub key: Vec<String>,
    pub policy: ConflictPolicy,
}

impl MergePlan {
    pub fn for_schema(schema: &TargetSchema) -> Self {
        Self {
            staging: schema.staging.clone(),
            target: schema.target.clone(),
            columns: schema.columns.iter().map(|c| c.name.clone()).collect(),
            key: schema.key.clone(),
            policy: schema.policy.clone(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub(crate) fn key_indices(&self) -> Vec<usize> {
        self.key.iter().filter_map(|k| self.column_index(k)).collect()
    }

    pub(crate) fn update_indices(&self) -> Vec<usize> {
        self.policy
            .update_columns()
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect()
    }
}

/// The storage contract of the ingest engine
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Short backend name for logs and reports
    fn backend(&self) -> &'static str;

    /// Empty a staging relation
    async fn truncate(&self, staging: &TableName) -> WarehouseResult<()>;

    /// Append rows in a single transaction: all land or none do
    async fn append(
        &self,
        staging: &TableName,
        columns: &[ColumnSpec],
        rows: &[ValidatedRecord],
    ) -> WarehouseResult<u64>;

    /// Reconcile staging into the permanent table in a single transaction.
    ///
    /// Returns the number of rows inserted or changed.
    async fn merge(&self, plan: &MergePlan) -> WarehouseResult<u64>;

    /// Row count of a relation
    async fn count(&self, table: &TableName) -> WarehouseResult<i64>;
}
