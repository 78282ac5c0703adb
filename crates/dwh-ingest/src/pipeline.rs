//! Load pipeline
//!
//! A run moves through `Idle -> Staging -> Merging -> Done`. The states are
//! types, so merging before staging has finished, or staging after a failed
//! batch, does not compile:
//!
//! ```text
//! Pipeline<Idle> --begin--> Pipeline<Staging> --stage*--> --finish--> Pipeline<Merging> --merge--> RunReport
//! ```
//!
//! Every failing transition consumes the pipeline and, for batch and merge
//! failures, hands back the partial [`RunReport`] inside the error.

use std::path::Path;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LoadConfig;
use crate::error::{IngestError, IngestResult};
use crate::merge::MergeReconciler;
use crate::normalize::Normalizer;
use crate::quality::QualityFilter;
use crate::reader::{ChunkedReader, ColumnLayout, RawBatch};
use crate::record::{RejectReason, RowOutcome};
use crate::report::{BatchStats, Phase, RunReport};
use crate::schema::TargetSchema;
use crate::staging::StagingWriter;
use crate::warehouse::Warehouse;

/// Created, nothing touched yet
pub struct Idle;

/// Staging truncated, batches being appended
pub struct Staging {
    layout: ColumnLayout,
}

/// Every batch staged, merge pending
pub struct Merging;

pub struct Pipeline<'w, W: Warehouse + ?Sized, S> {
    warehouse: &'w W,
    schema: &'w TargetSchema,
    filter: QualityFilter,
    writer: StagingWriter<'w, W>,
    report: RunReport,
    state: S,
}

impl<'w, W: Warehouse + ?Sized, S> Pipeline<'w, W, S> {
    pub fn run_id(&self) -> Uuid {
        self.report.run_id
    }

    pub fn phase(&self) -> Phase {
        self.report.phase
    }

    /// Counters so far
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    fn fail(mut self) -> Box<RunReport> {
        self.report.finish(Phase::Failed);
        Box::new(self.report)
    }
}

impl<'w, W: Warehouse + ?Sized> Pipeline<'w, W, Idle> {
    pub fn new(warehouse: &'w W, schema: &'w TargetSchema, config: &LoadConfig) -> Self {
        let mut report = RunReport::new(Uuid::new_v4(), &schema.name, warehouse.backend());
        report.staging_table = schema.staging.to_string();
        report.target_table = schema.target.to_string();
        report.policy = schema.policy.label();
        report.batch_size = config.batch_size_for(schema);

        Self {
            warehouse,
            schema,
            filter: QualityFilter::new(schema),
            writer: StagingWriter::new(warehouse, schema)
                .with_retries(config.batch_retries, config.retry_backoff),
            report,
            state: Idle,
        }
    }

    /// Truncate staging and start accepting batches.
    ///
    /// `layout` must already be resolved against the source header, so a
    /// file with missing required columns never reaches this point.
    pub async fn begin(
        mut self,
        source: &Path,
        layout: ColumnLayout,
    ) -> IngestResult<Pipeline<'w, W, Staging>> {
        self.report.source = source.display().to_string();
        self.writer.prepare().await?;
        self.report.phase = Phase::Staging;

        info!(
            source = %self.report.source,
            staging = %self.schema.staging,
            batch_size = self.report.batch_size,
            "Staging started"
        );

        Ok(Pipeline {
            warehouse: self.warehouse,
            schema: self.schema,
            filter: self.filter,
            writer: self.writer,
            report: self.report,
            state: Staging { layout },
        })
    }
}

impl<'w, W: Warehouse + ?Sized> Pipeline<'w, W, Staging> {
    /// Normalize, filter and append one batch
    pub async fn stage(mut self, batch: RawBatch) -> IngestResult<Self> {
        let mut stats = BatchStats {
            index: batch.index,
            rows_read: batch.rows_read() as u64,
            ..BatchStats::default()
        };

        for row in &batch.malformed {
            debug!(row, "Rejected undecodable row");
            stats.rejected.record(&RejectReason::Malformed { column: None });
        }

        let normalizer = Normalizer::new(self.schema, &self.state.layout);
        let mut valid = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            let outcome = match normalizer.normalize(record) {
                Ok(normalized) => {
                    stats.normalized += 1;
                    self.filter.check(normalized)
                },
                Err(reason) => RowOutcome::Rejected {
                    row: record.row,
                    reason,
                },
            };

            match outcome {
                RowOutcome::Valid(record) => valid.push(record),
                RowOutcome::Rejected { row, reason } => {
                    debug!(row, reason = %reason, "Rejected row");
                    stats.rejected.record(&reason);
                },
            }
        }

        let written = self.writer.write_batch(batch.index, &valid).await;
        match written {
            Ok(staged) => {
                stats.staged = staged.rows;
                stats.attempts = staged.attempts;
            },
            Err(failure) => {
                error!(
                    batch = batch.index,
                    attempts = failure.attempts,
                    error = %failure.source,
                    "Staging batch failed, aborting before merge"
                );
                return Err(IngestError::BatchFailed {
                    batch: batch.index,
                    attempts: failure.attempts,
                    source: failure.source,
                    report: self.fail(),
                });
            },
        }

        info!(
            batch = stats.index,
            rows_read = stats.rows_read,
            staged = stats.staged,
            rejected = stats.rejected.total(),
            "Staged batch"
        );
        self.report.record_batch(stats);
        Ok(self)
    }

    /// No more batches; the staging relation is complete
    pub fn finish(self) -> Pipeline<'w, W, Merging> {
        info!(
            batches = self.report.totals.batches,
            staged = self.report.totals.staged,
            "Staging complete"
        );

        let mut report = self.report;
        report.phase = Phase::Merging;

        Pipeline {
            warehouse: self.warehouse,
            schema: self.schema,
            filter: self.filter,
            writer: self.writer,
            report,
            state: Merging,
        }
    }
}

impl<'w, W: Warehouse + ?Sized> Pipeline<'w, W, Merging> {
    /// Merge staging into the target and count it
    pub async fn merge(mut self) -> IngestResult<RunReport> {
        let reconciler = MergeReconciler::new(self.warehouse, self.schema);

        match reconciler.merge().await {
            Ok(affected) => self.report.merged_rows = Some(affected),
            Err(source) => {
                error!(table = %self.schema.target, error = %source, "Merge failed, target unchanged");
                return Err(IngestError::MergeFailed {
                    staging: self.schema.staging.to_string(),
                    target: self.schema.target.to_string(),
                    source,
                    report: self.fail(),
                });
            },
        }

        // The merge has committed; a failed count only degrades the report
        match reconciler.count().await {
            Ok(count) => self.report.final_row_count = Some(count),
            Err(e) => {
                warn!(table = %self.schema.target, error = %e, "Row count after merge failed");
                self.report.count_error = Some(e.to_string());
            },
        }

        self.report.finish(Phase::Done);
        info!(
            merged = self.report.merged_rows,
            final_row_count = self.report.final_row_count,
            "Load finished"
        );
        Ok(self.report)
    }
}

/// Load one source file into one target.
///
/// The source is opened and its header checked before staging is touched.
#[tracing::instrument(
    skip(warehouse, schema, config, source),
    fields(load = %schema.name, run_id = tracing::field::Empty)
)]
pub async fn run<W: Warehouse + ?Sized>(
    warehouse: &W,
    schema: &TargetSchema,
    config: &LoadConfig,
    source: &Path,
) -> IngestResult<RunReport> {
    let pipeline = Pipeline::new(warehouse, schema, config);
    tracing::Span::current().record("run_id", tracing::field::display(pipeline.run_id()));

    let reader = ChunkedReader::open_with_delimiter(source, config.batch_size_for(schema), config.delimiter)?
        .with_limit(config.limit);
    let layout = ColumnLayout::resolve(schema, reader.headers(), reader.path())?;

    let mut pipeline = pipeline.begin(source, layout).await?;
    for batch in reader {
        pipeline = pipeline.stage(batch?).await?;
    }

    pipeline.finish().merge().await
}
