//! Staging writer
//!
//! Truncates the staging relation once per run and then appends validated
//! batches, each in its own transaction. A batch that fails is retried with
//! exponential backoff; because appends are atomic a retry never duplicates
//! rows.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};
use crate::record::ValidatedRecord;
use crate::schema::TargetSchema;
use crate::warehouse::{Warehouse, WarehouseError};

/// A batch that reached staging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedBatch {
    pub rows: u64,
    pub attempts: u32,
}

/// A batch that did not reach staging after every attempt
#[derive(Debug)]
pub struct StagingFailure {
    pub attempts: u32,
    pub source: WarehouseError,
}

pub struct StagingWriter<'w, W: Warehouse + ?Sized> {
    warehouse: &'w W,
    schema: &'w TargetSchema,
    retries: u32,
    backoff: Duration,
    prepared: bool,
}

impl<'w, W: Warehouse + ?Sized> StagingWriter<'w, W> {
    pub fn new(warehouse: &'w W, schema: &'w TargetSchema) -> Self {
        Self {
            warehouse,
            schema,
            retries: 0,
            backoff: Duration::ZERO,
            prepared: false,
        }
    }

    /// Retry a failed batch up to `retries` more times
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Empty the staging relation. Only the first call per writer truncates.
    pub async fn prepare(&mut self) -> IngestResult<()> {
        if self.prepared {
            return Ok(());
        }

        let staging = &self.schema.staging;
        self.warehouse
            .truncate(staging)
            .await
            .map_err(|source| IngestError::Truncate {
                table: staging.to_string(),
                source,
            })?;
        self.prepared = true;

        debug!(staging = %staging, "Truncated staging table");
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Append one batch, all rows or none
    pub async fn write_batch(
        &self,
        index: usize,
        rows: &[ValidatedRecord],
    ) -> Result<StagedBatch, StagingFailure> {
        if rows.is_empty() {
            return Ok(StagedBatch {
                rows: 0,
                attempts: 0,
            });
        }

        let max_attempts = self.retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self
                .warehouse
                .append(&self.schema.staging, &self.schema.columns, rows)
                .await
            {
                Ok(written) => {
                    return Ok(StagedBatch {
                        rows: written,
                        attempts: attempt,
                    })
                },
                Err(source) if attempt >= max_attempts => {
                    return Err(StagingFailure {
                        attempts: attempt,
                        source,
                    })
                },
                Err(e) => {
                    warn!(
                        batch = index,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Staging batch failed, retrying"
                    );
                    let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                },
            }
        }
    }
}
