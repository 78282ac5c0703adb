//! Run reporting
//!
//! Every row read ends up in exactly one bucket: staged or rejected for one
//! reason. Counters are kept per batch and summed into run totals.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::record::RejectReason;

/// Rows excluded from staging, by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RejectCounts {
    pub malformed: u64,
    pub null_required_field: u64,
    pub out_of_range: u64,
}

impl RejectCounts {
    pub fn record(&mut self, reason: &RejectReason) {
        let bucket = match reason {
            RejectReason::Malformed { .. } => &mut self.malformed,
            RejectReason::NullRequiredField { .. } => &mut self.null_required_field,
            RejectReason::OutOfRange { .. } => &mut self.out_of_range,
        };
        *bucket = bucket.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.malformed
            .saturating_add(self.null_required_field)
            .saturating_add(self.out_of_range)
    }

    fn add(&mut self, other: &RejectCounts) {
        self.malformed = self.malformed.saturating_add(other.malformed);
        self.null_required_field = self.null_required_field.saturating_add(other.null_required_field);
        self.out_of_range = self.out_of_range.saturating_add(other.out_of_range);
    }
}

/// Counters of one staged batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub index: usize,
    pub rows_read: u64,
    /// Rows that survived normalisation
    pub normalized: u64,
    pub rejected: RejectCounts,
    pub staged: u64,
    /// Append attempts, 1 when the first try succeeded
    pub attempts: u32,
}

/// Sums over all batches of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub batches: u64,
    pub rows_read: u64,
    pub normalized: u64,
    pub rejected: RejectCounts,
    pub staged: u64,
}

/// Where a run stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Staging,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Staging => "staging",
            Phase::Merging => "merging",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything observable about one load run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub target: String,
    pub staging_table: String,
    pub target_table: String,
    pub policy: String,
    pub backend: String,
    pub source: String,
    pub batch_size: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub batches: Vec<BatchStats>,
    pub totals: RunTotals,
    /// Rows inserted or changed by the merge
    pub merged_rows: Option<u64>,
    pub final_row_count: Option<i64>,
    /// Set when the merge committed but the follow-up count failed
    pub count_error: Option<String>,
}

impl RunReport {
    pub fn new(run_id: Uuid, target: &str, backend: &str) -> Self {
        Self {
            run_id,
            target: target.to_string(),
            staging_table: String::new(),
            target_table: String::new(),
            policy: String::new(),
            backend: backend.to_string(),
            source: String::new(),
            batch_size: 0,
            started_at: Utc::now(),
            finished_at: None,
            phase: Phase::Idle,
            batches: Vec::new(),
            totals: RunTotals::default(),
            merged_rows: None,
            final_row_count: None,
            count_error: None,
        }
    }

    /// Fold one batch into the report
    pub fn record_batch(&mut self, batch: BatchStats) {
        let t = &mut self.totals;
        t.batches = t.batches.saturating_add(1);
        t.rows_read = t.rows_read.saturating_add(batch.rows_read);
        t.normalized = t.normalized.saturating_add(batch.normalized);
        t.rejected.add(&batch.rejected);
        t.staged = t.staged.saturating_add(batch.staged);
        self.batches.push(batch);
    }

    /// Close the report in its final phase
    pub fn finish(&mut self, phase: Phase) {
        self.phase = phase;
        self.finished_at = Some(Utc::now());
    }

    /// Wall time in seconds, if the run has finished
    pub fn elapsed_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.totals;
        writeln!(
            f,
            "Run {} [{}] {} -> {} ({}, {} backend)",
            self.run_id, self.phase, self.target, self.target_table, self.policy, self.backend
        )?;
        writeln!(f, "  Source:     {}", self.source)?;
        writeln!(f, "  Batches:    {} of up to {} rows", t.batches, self.batch_size)?;
        writeln!(f, "  Rows read:  {}", t.rows_read)?;
        writeln!(f, "  Staged:     {}", t.staged)?;
        writeln!(
            f,
            "  Rejected:   {} (malformed {}, null required field {}, out of range {})",
            t.rejected.total(),
            t.rejected.malformed,
            t.rejected.null_required_field,
            t.rejected.out_of_range
        )?;
        match self.merged_rows {
            Some(merged) => writeln!(f, "  Merged:     {} rows inserted or changed", merged)?,
            None => writeln!(f, "  Merged:     -")?,
        }
        match (&self.final_row_count, &self.count_error) {
            (Some(count), _) => writeln!(f, "  Row count:  {}", count)?,
            (None, Some(error)) => writeln!(f, "  Row count:  unavailable ({})", error)?,
            (None, None) => writeln!(f, "  Row count:  -")?,
        }
        if let Some(secs) = self.elapsed_secs() {
            write!(f, "  Elapsed:    {:.1}s", secs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn batch(index: usize, read: u64, staged: u64, out_of_range: u64) -> BatchStats {
        BatchStats {
            index,
            rows_read: read,
            normalized: read,
            rejected: RejectCounts {
                out_of_range,
                ..RejectCounts::default()
            },
            staged,
            attempts: 1,
        }
    }

    #[test]
    fn test_totals_accumulate() {
        let mut report = RunReport::new(Uuid::new_v4(), "ratings", "memory");
        report.record_batch(batch(1, 10, 9, 1));
        report.record_batch(batch(2, 5, 3, 2));

        assert_eq!(report.totals.batches, 2);
        assert_eq!(report.totals.rows_read, 15);
        assert_eq!(report.totals.staged, 12);
        assert_eq!(report.totals.rejected.out_of_range, 3);
        assert_eq!(report.totals.rejected.total(), 3);
    }

    #[test]
    fn test_reject_counts_by_reason() {
        let mut counts = RejectCounts::default();
        counts.record(&RejectReason::Malformed { column: None });
        counts.record(&RejectReason::NullRequiredField {
            column: "user_id".to_string(),
        });
        counts.record(&RejectReason::NullRequiredField {
            column: "book_id".to_string(),
        });

        assert_eq!(counts.malformed, 1);
        assert_eq!(counts.null_required_field, 2);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_counters_saturate() {
        let mut counts = RejectCounts {
            malformed: u64::MAX,
            ..RejectCounts::default()
        };
        counts.record(&RejectReason::Malformed { column: None });
        assert_eq!(counts.malformed, u64::MAX);
    }

    #[test]
    fn test_summary_mentions_count_error() {
        let mut report = RunReport::new(Uuid::new_v4(), "books", "memory");
        report.merged_rows = Some(3);
        report.count_error = Some("connection reset".to_string());
        report.finish(Phase::Done);

        let text = report.to_string();
        assert!(text.contains("[done]"));
        assert!(text.contains("3 rows inserted or changed"));
        assert!(text.contains("unavailable (connection reset)"));
    }

    #[test]
    fn test_report_serializes_phase_in_snake_case() {
        let mut report = RunReport::new(Uuid::new_v4(), "books", "memory");
        report.finish(Phase::Failed);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["phase"], "failed");
        assert_eq!(json["totals"]["rejected"]["out_of_range"], 0);
    }
}
