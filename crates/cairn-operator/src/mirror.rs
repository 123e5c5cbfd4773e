//! rbd-mirror lifecycle

use std::sync::Arc;

use tracing::{info, instrument};

use cairn_common::Result;
use cairn_plan::{mirror_plan, ClusterContext, MirrorSpec};

use crate::reconciler::{DeploymentReconciler, ReconcileReport};

/// Starts the singleton rbd-mirror daemon
pub struct MirrorReconciler {
    reconciler: Arc<DeploymentReconciler>,
}

impl MirrorReconciler {
    /// Create a mirror reconciler sharing `reconciler`'s clients and locks
    pub fn new(reconciler: Arc<DeploymentReconciler>) -> Self {
        Self { reconciler }
    }

    /// Check the memory floor, converge instance `a` and remove any other
    /// instances
    #[instrument(skip_all, fields(namespace = %cluster.namespace))]
    pub async fn start(&self, cluster: &ClusterContext, spec: &MirrorSpec) -> Result<ReconcileReport> {
        let plan = mirror_plan(cluster, spec)?;
        let report = self.reconciler.reconcile(&plan).await?;
        info!(
            deployment = %report.name,
            outcome = ?report.outcome,
            removed = report.cleanup.as_ref().map_or(0, |c| c.removed.len()),
            "rbd-mirror started"
        );
        Ok(report)
    }
}
