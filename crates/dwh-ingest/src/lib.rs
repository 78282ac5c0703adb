//! Goodbooks warehouse ingest engine
//!
//! Loads the goodbooks `books.csv` and `ratings.csv` exports into a
//! PostgreSQL warehouse through a staging table per target:
//!
//! 1. [`reader`] splits the source into bounded batches
//! 2. [`normalize`] types every field against the target schema
//! 3. [`quality`] drops rows that break required or range rules
//! 4. [`staging`] appends each batch to a freshly truncated staging table
//! 5. [`merge`] reconciles staging into the permanent table in one statement
//! 6. [`report`] accounts for every row read
//!
//! Re-running a load over the same file leaves the target unchanged.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use dwh_ingest::{pipeline, schema, LoadConfig, MemoryWarehouse};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let warehouse = MemoryWarehouse::new();
//! let target = schema::books()?;
//! let report = pipeline::run(&warehouse, &target, &LoadConfig::default(), Path::new("books.csv")).await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod quality;
pub mod reader;
pub mod record;
pub mod report;
pub mod schema;
pub mod staging;
pub mod warehouse;

pub use config::{LoadConfig, WarehouseConfig};
pub use error::{IngestError, IngestResult};
pub use pipeline::Pipeline;
pub use report::{Phase, RunReport};
pub use schema::{Aggregation, BuiltinTarget, ConflictPolicy, TargetSchema};
pub use warehouse::{MemoryWarehouse, PgWarehouse, Warehouse, WarehouseError};
