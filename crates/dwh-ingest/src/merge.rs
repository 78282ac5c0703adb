//! Merge reconciler
//!
//! Runs the single set-based statement that moves staging into the permanent
//! table under the target's conflict policy, then counts the result. The
//! count is informational: once the merge has committed, a failing count is
//! reported but does not fail the run.

use tracing::info;

use crate::schema::TargetSchema;
use crate::warehouse::{MergePlan, Warehouse, WarehouseError};

pub struct MergeReconciler<'w, W: Warehouse + ?Sized> {
    warehouse: &'w W,
    plan: MergePlan,
}

impl<'w, W: Warehouse + ?Sized> MergeReconciler<'w, W> {
    pub fn new(warehouse: &'w W, schema: &TargetSchema) -> Self {
        Self {
            warehouse,
            plan: MergePlan::for_schema(schema),
        }
    }

    pub fn plan(&self) -> &MergePlan {
        &self.plan
    }

    /// Merge staging into the target.
    ///
    /// An error here means the merge transaction rolled back and the target
    /// table is unchanged.
    pub async fn merge(&self) -> Result<u64, WarehouseError> {
        let affected = self.warehouse.merge(&self.plan).await?;
        info!(
            staging = %self.plan.staging,
            table = %self.plan.target,
            policy = %self.plan.policy.label(),
            affected,
            "Merged staging into target"
        );
        Ok(affected)
    }

    /// Row count of the target, queried after the merge committed
    pub async fn count(&self) -> Result<i64, WarehouseError> {
        self.warehouse.count(&self.plan.target).await
    }
}
