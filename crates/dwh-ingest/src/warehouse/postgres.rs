//! PostgreSQL warehouse backend
//!
//! Staging appends use multi-row `INSERT ... VALUES` built with
//! [`QueryBuilder::push_values`], split to respect the bind parameter limit
//! and wrapped in one transaction per batch. The merge is a single
//! `INSERT ... SELECT ... ON CONFLICT` statement generated from the plan.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use super::{MergePlan, Warehouse, WarehouseError, WarehouseResult};
use crate::config::WarehouseConfig;
use crate::record::{ValidatedRecord, Value};
use crate::schema::{
    quote_ident, Aggregation, ColumnSpec, ConflictPolicy, FieldKind, TableName,
    STAGING_ROW_COLUMN,
};

/// PostgreSQL accepts at most this many bind parameters per statement
const PG_BIND_LIMIT: usize = 65_535;

pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration and check the server answers
    pub async fn connect(config: &WarehouseConfig) -> WarehouseResult<Self> {
        let options = connect_options(config)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(
            target_db = %config.describe(),
            max_connections = config.max_connections,
            "Warehouse connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Connection options from a full URL or from the individual parts
pub fn connect_options(config: &WarehouseConfig) -> WarehouseResult<PgConnectOptions> {
    if let Some(url) = &config.url {
        return url
            .parse::<PgConnectOptions>()
            .map_err(|e| WarehouseError::Config(format!("invalid DATABASE_URL: {}", e)));
    }

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user);
    if !config.password.is_empty() {
        options = options.password(&config.password);
    }
    Ok(options)
}

/// Rows per `INSERT` so that `(columns + stg_row) * rows` stays under the limit
pub fn rows_per_statement(column_count: usize) -> usize {
    (PG_BIND_LIMIT / (column_count + 1)).max(1)
}

fn join_quoted<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_prefix(staging: &TableName, columns: &[ColumnSpec]) -> String {
    let names: Vec<&str> = std::iter::once(STAGING_ROW_COLUMN)
        .chain(columns.iter().map(|c| c.name.as_str()))
        .collect();
    format!("INSERT INTO {} ({}) ", staging.quoted(), join_quoted(&names))
}

fn bind_value<'args>(
    b: &mut Separated<'_, 'args, Postgres, &'static str>,
    kind: FieldKind,
    value: &'args Value,
) {
    match value {
        Value::Int(v) => {
            b.push_bind(*v);
        },
        Value::Float(v) => {
            b.push_bind(*v);
        },
        Value::Text(v) => {
            b.push_bind(v.as_str());
        },
        // Typed nulls, so the server does not have to guess the parameter type
        Value::Null => match kind {
            FieldKind::Integer => {
                b.push_bind(None::<i64>);
            },
            FieldKind::Float => {
                b.push_bind(None::<f64>);
            },
            FieldKind::Text => {
                b.push_bind(None::<&str>);
            },
        },
    }
}

/// The single reconciliation statement for a plan
pub fn merge_statement(plan: &MergePlan) -> String {
    let target = plan.target.quoted();
    let staging = plan.staging.quoted();
    let columns = join_quoted(&plan.columns);
    let key = join_quoted(&plan.key);
    let row = quote_ident(STAGING_ROW_COLUMN);

    let source = match &plan.policy {
        // First staged row per key is the insert candidate
        ConflictPolicy::InsertIfAbsent => format!(
            "SELECT DISTINCT ON ({key}) {columns}\nFROM {staging}\nORDER BY {key}, {row} ASC"
        ),
        ConflictPolicy::Overwrite { .. }
        | ConflictPolicy::AggregateThenUpsert {
            aggregation: Aggregation::Latest,
            ..
        } => format!(
            "SELECT DISTINCT ON ({key}) {columns}\nFROM {staging}\nORDER BY {key}, {row} DESC"
        ),
        ConflictPolicy::AggregateThenUpsert {
            aggregation,
            columns: aggregated,
        } => {
            let func = if *aggregation == Aggregation::Min { "MIN" } else { "MAX" };
            let select = plan
                .columns
                .iter()
                .map(|c| {
                    let q = quote_ident(c);
                    if aggregated.contains(c) {
                        format!("{func}({q}) AS {q}")
                    } else {
                        q
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("SELECT {select}\nFROM {staging}\nGROUP BY {key}")
        },
    };

    let updates = plan.policy.update_columns();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let set = updates
            .iter()
            .map(|c| format!("{q} = EXCLUDED.{q}", q = quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let current = updates
            .iter()
            .map(|c| format!("t.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let incoming = updates
            .iter()
            .map(|c| format!("EXCLUDED.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        // Unchanged rows are not rewritten and not counted
        format!("DO UPDATE SET {set}\nWHERE ({current}) IS DISTINCT FROM ({incoming})")
    };

    format!("INSERT INTO {target} AS t ({columns})\n{source}\nON CONFLICT ({key}) {conflict}")
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn truncate(&self, staging: &TableName) -> WarehouseResult<()> {
        let sql = format!("TRUNCATE TABLE {}", staging.quoted());

        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(table = %staging, "Staging table truncated");
        Ok(())
    }

    async fn append(
        &self,
        staging: &TableName,
        columns: &[ColumnSpec],
        rows: &[ValidatedRecord],
    ) -> WarehouseResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = rows.iter().find(|r| r.values().len() != columns.len()) {
            return Err(WarehouseError::Shape(format!(
                "row {} has {} values for {} columns",
                bad.row(),
                bad.values().len(),
                columns.len()
            )));
        }

        let prefix = insert_prefix(staging, columns);
        let mut inserted = 0;

        // Dropping `tx` on any early return rolls the whole batch back
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(prefix.as_str());
            query_builder.push_values(chunk, |mut b, record| {
                b.push_bind(record.row());
                for (column, value) in columns.iter().zip(record.values()) {
                    bind_value(&mut b, column.kind, value);
                }
            });
            inserted += query_builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn merge(&self, plan: &MergePlan) -> WarehouseResult<u64> {
        let sql = merge_statement(plan);
        debug!(sql = %sql, "Executing merge");

        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        Ok(affected)
    }

    async fn count(&self, table: &TableName) -> WarehouseResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
        let count = sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}
