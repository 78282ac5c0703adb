//! Quality filter: required fields and closed-interval ranges

use crate::record::{NormalizedRecord, RejectReason, RowOutcome, ValidatedRecord};
use crate::schema::TargetSchema;

/// Validity predicates of one target, resolved to column positions
#[derive(Debug, Clone)]
pub struct QualityFilter {
    width: usize,
    required: Vec<(usize, String)>,
    ranges: Vec<(usize, String, f64, f64)>,
}

impl QualityFilter {
    pub fn new(schema: &TargetSchema) -> Self {
        // Names were checked by TargetSchema::validate
        let required = schema
            .required
            .iter()
            .filter_map(|name| schema.column_index(name).map(|i| (i, name.clone())))
            .collect();
        let ranges = schema
            .ranges
            .iter()
            .filter_map(|rule| {
                schema
                    .column_index(&rule.column)
                    .map(|i| (i, rule.column.clone(), rule.min, rule.max))
            })
            .collect();

        Self {
            width: schema.columns.len(),
            required,
            ranges,
        }
    }

    /// Accept a record or name the first rule it breaks.
    ///
    /// Required fields are checked before ranges, so a null rating counts as
    /// a null, not as out of range. A record that does not carry exactly one
    /// value per schema column is malformed.
    pub fn check(&self, record: NormalizedRecord) -> RowOutcome {
        if record.values.len() != self.width {
            return RowOutcome::Rejected {
                row: record.row,
                reason: RejectReason::Malformed { column: None },
            };
        }

        for (index, column) in &self.required {
            if record.values[*index].is_null() {
                return RowOutcome::Rejected {
                    row: record.row,
                    reason: RejectReason::NullRequiredField {
                        column: column.clone(),
                    },
                };
            }
        }

        for (index, column, min, max) in &self.ranges {
            // Nulls in optional range columns pass; only present values are bounded
            if let Some(v) = record.values[*index].as_f64() {
                if v < *min || v > *max {
                    return RowOutcome::Rejected {
                        row: record.row,
                        reason: RejectReason::OutOfRange {
                            column: column.clone(),
                        },
                    };
                }
            }
        }

        RowOutcome::Valid(ValidatedRecord::new(record))
    }
}
