//! In-memory warehouse
//!
//! Implements the same four primitives as the PostgreSQL backend with the
//! same merge semantics. Used for `--dry-run` and throughout the tests. Every
//! operation validates first and mutates last, so a failed call leaves no
//! trace, matching a rolled-back transaction.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{MergePlan, Warehouse, WarehouseError, WarehouseResult};
use crate::record::{ValidatedRecord, Value};
use crate::schema::{Aggregation, ColumnSpec, ConflictPolicy, TableName};

/// Hashable, ordered projection of a key value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum KeyPart {
    Null,
    Int(i64),
    Float(u64),
    Text(String),
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Int(v) => KeyPart::Int(*v),
            Value::Float(v) => KeyPart::Float(v.to_bits()),
            Value::Text(v) => KeyPart::Text(v.clone()),
        }
    }
}

type Key = Vec<KeyPart>;
type StagedRow = (i64, Vec<Value>);

#[derive(Default)]
struct MemoryState {
    staging: HashMap<String, Vec<StagedRow>>,
    tables: HashMap<String, BTreeMap<Key, Vec<Value>>>,
    truncations: HashMap<String, usize>,
    failing_appends: u32,
    failing_counts: u32,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> WarehouseResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| WarehouseError::Unavailable("memory warehouse lock poisoned".to_string()))
    }

    /// Make the next `n` appends fail without writing anything
    pub fn fail_next_appends(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_appends = n;
        }
    }

    /// Make the next `n` count queries fail
    pub fn fail_next_counts(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_counts = n;
        }
    }

    /// Rows currently staged in a relation
    pub fn staged_len(&self, staging: &TableName) -> usize {
        self.state
            .lock()
            .map(|s| s.staging.get(&staging.to_string()).map_or(0, Vec::len))
            .unwrap_or_default()
    }

    /// How often a staging relation was truncated
    pub fn truncations(&self, staging: &TableName) -> usize {
        self.state
            .lock()
            .map(|s| s.truncations.get(&staging.to_string()).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Permanent table contents in key order
    pub fn rows(&self, table: &TableName) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .map(|s| {
                s.tables
                    .get(&table.to_string())
                    .map(|t| t.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

fn key_of(values: &[Value], key: &[usize]) -> Key {
    key.iter().map(|&i| KeyPart::from(&values[i])).collect()
}

/// Fold another staged row with the same key into the current candidate
fn reduce(policy: &ConflictPolicy, update: &[usize], current: &mut StagedRow, incoming: StagedRow) {
    match policy {
        ConflictPolicy::InsertIfAbsent => {
            if incoming.0 < current.0 {
                *current = incoming;
            }
        },
        ConflictPolicy::Overwrite { .. }
        | ConflictPolicy::AggregateThenUpsert {
            aggregation: Aggregation::Latest,
            ..
        } => {
            if incoming.0 > current.0 {
                *current = incoming;
            }
        },
        ConflictPolicy::AggregateThenUpsert { aggregation, .. } => {
            let wanted = if *aggregation == Aggregation::Min {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            };
            for &i in update {
                let replace = match (&current.1[i], &incoming.1[i]) {
                    (_, Value::Null) => false,
                    (Value::Null, _) => true,
                    (have, new) => new.compare(have) == Some(wanted),
                };
                if replace {
                    current.1[i] = incoming.1[i].clone();
                }
            }
        },
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn truncate(&self, staging: &TableName) -> WarehouseResult<()> {
        let mut state = self.lock()?;
        let name = staging.to_string();
        state.staging.insert(name.clone(), Vec::new());
        *state.truncations.entry(name).or_default() += 1;
        Ok(())
    }

    async fn append(
        &self,
        staging: &TableName,
        columns: &[ColumnSpec],
        rows: &[ValidatedRecord],
    ) -> WarehouseResult<u64> {
        let mut state = self.lock()?;

        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(WarehouseError::Unavailable(format!(
                "append to {} interrupted",
                staging
            )));
        }
        if let Some(bad) = rows.iter().find(|r| r.values().len() != columns.len()) {
            return Err(WarehouseError::Shape(format!(
                "row {} has {} values for {} columns",
                bad.row(),
                bad.values().len(),
                columns.len()
            )));
        }

        state
            .staging
            .entry(staging.to_string())
            .or_default()
            .extend(rows.iter().map(|r| (r.row(), r.values().to_vec())));

        Ok(rows.len() as u64)
    }

    async fn merge(&self, plan: &MergePlan) -> WarehouseResult<u64> {
        let mut guard = self.lock()?;
        let MemoryState {
            staging, tables, ..
        } = &mut *guard;

        let key = plan.key_indices();
        let update = plan.update_indices();
        let staged = staging
            .get(&plan.staging.to_string())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut candidates: BTreeMap<Key, StagedRow> = BTreeMap::new();
        for (row, values) in staged {
            if values.len() != plan.columns.len() {
                return Err(WarehouseError::Shape(format!(
                    "staged row {} does not match {} columns of {}",
                    row,
                    plan.columns.len(),
                    plan.target
                )));
            }
            let incoming = (*row, values.clone());
            match candidates.entry(key_of(values, &key)) {
                Entry::Vacant(slot) => {
                    slot.insert(incoming);
                },
                Entry::Occupied(mut slot) => reduce(&plan.policy, &update, slot.get_mut(), incoming),
            }
        }

        let table = tables.entry(plan.target.to_string()).or_default();
        let mut affected = 0;
        for (k, (_, values)) in candidates {
            match table.entry(k) {
                Entry::Vacant(slot) => {
                    slot.insert(values);
                    affected += 1;
                },
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    let mut changed = false;
                    for &i in &update {
                        if existing[i] != values[i] {
                            existing[i] = values[i].clone();
                            changed = true;
                        }
                    }
                    if changed {
                        affected += 1;
                    }
                },
            }
        }

        Ok(affected)
    }

    async fn count(&self, table: &TableName) -> WarehouseResult<i64> {
        let mut state = self.lock()?;

        if state.failing_counts > 0 {
            state.failing_counts -= 1;
            return Err(WarehouseError::Unavailable(format!("count of {} timed out", table)));
        }

        let name = table.to_string();
        let len = match state.tables.get(&name) {
            Some(rows) => rows.len(),
            None => state.staging.get(&name).map_or(0, Vec::len),
        };
        Ok(len as i64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::quality::QualityFilter;
    use crate::record::{NormalizedRecord, RowOutcome};
    use crate::schema::{self, TargetSchema};

    fn validated(schema: &TargetSchema, row: i64, values: Vec<Value>) -> ValidatedRecord {
        match QualityFilter::new(schema).check(NormalizedRecord { row, values }) {
            RowOutcome::Valid(record) => record,
            RowOutcome::Rejected { reason, .. } => panic!("fixture rejected: {reason}"),
        }
    }

    async fn stage_and_merge(wh: &MemoryWarehouse, schema: &TargetSchema, rows: &[ValidatedRecord]) -> u64 {
        wh.truncate(&schema.staging).await.unwrap();
        wh.append(&schema.staging, &schema.columns, rows).await.unwrap();
        wh.merge(&MergePlan::for_schema(schema)).await.unwrap()
    }

    fn rating(schema: &TargetSchema, row: i64, user: i64, book: i64, r: i64) -> ValidatedRecord {
        validated(schema, row, vec![Value::Int(user), Value::Int(book), Value::Int(r)])
    }

    #[tokio::test]
    async fn test_aggregate_max_keeps_one_row_per_key() {
        let wh = MemoryWarehouse::new();
        let schema = schema::ratings(Aggregation::Max).unwrap();
        let rows = vec![rating(&schema, 1, 1, 42, 3), rating(&schema, 2, 1, 42, 5)];

        assert_eq!(stage_and_merge(&wh, &schema, &rows).await, 1);
        assert_eq!(
            wh.rows(&schema.target),
            vec![vec![Value::Int(1), Value::Int(42), Value::Int(5)]]
        );
    }

    #[tokio::test]
    async fn test_aggregate_min_and_latest() {
        let rows_for = |schema: &TargetSchema| {
            vec![
                rating(schema, 1, 1, 42, 4),
                rating(schema, 2, 1, 42, 2),
                rating(schema, 3, 1, 42, 3),
            ]
        };

        let min = schema::ratings(Aggregation::Min).unwrap();
        let wh = MemoryWarehouse::new();
        stage_and_merge(&wh, &min, &rows_for(&min)).await;
        assert_eq!(wh.rows(&min.target)[0][2], Value::Int(2));

        let latest = schema::ratings(Aggregation::Latest).unwrap();
        let wh = MemoryWarehouse::new();
        stage_and_merge(&wh, &latest, &rows_for(&latest)).await;
        assert_eq!(wh.rows(&latest.target)[0][2], Value::Int(3));
    }

    #[tokio::test]
    async fn test_remerge_of_identical_staging_changes_nothing() {
        let wh = MemoryWarehouse::new();
        let schema = schema::ratings(Aggregation::Max).unwrap();
        let rows = vec![rating(&schema, 1, 1, 1, 4), rating(&schema, 2, 2, 1, 5)];

        assert_eq!(stage_and_merge(&wh, &schema, &rows).await, 2);
        assert_eq!(stage_and_merge(&wh, &schema, &rows).await, 0);
        assert_eq!(wh.count(&schema.target).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_injected_append_failure_writes_nothing() {
        let wh = MemoryWarehouse::new();
        let schema = schema::ratings(Aggregation::Max).unwrap();
        wh.truncate(&schema.staging).await.unwrap();
        wh.fail_next_appends(1);

        let rows = vec![rating(&schema, 1, 1, 1, 4)];
        assert!(wh.append(&schema.staging, &schema.columns, &rows).await.is_err());
        assert_eq!(wh.staged_len(&schema.staging), 0);

        assert_eq!(wh.append(&schema.staging, &schema.columns, &rows).await.unwrap(), 1);
        assert_eq!(wh.staged_len(&schema.staging), 1);
    }

    #[tokio::test]
    async fn test_count_of_unknown_table_is_zero() {
        let wh = MemoryWarehouse::new();
        let table = TableName::parse("dwh.nothing").unwrap();
        assert_eq!(wh.count(&table).await.unwrap(), 0);

        wh.fail_next_counts(1);
        assert!(wh.count(&table).await.is_err());
        assert!(wh.count(&table).await.is_ok());
    }
}
