//! Converge live Deployments to execution plans
//!
//! Each identity is in one of four states. Absent plans are created,
//! current ones are left alone, stale ones are updated in place and
//! conflicting ones (changed selector, or an update the API server rejects
//! for touching an immutable field) are deleted and created again, at most
//! once per call.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use cairn_common::{Error, Result, ANNOTATION_SPEC_HASH};
use cairn_plan::k8s::Deployment;
use cairn_plan::ExecutionPlan;

use crate::cleanup::{remove_extra_instances, CleanupReport, CredentialStore};
use crate::client::{DeleteMode, DeploymentClient, LiveDeployment};
use crate::locks::IdentityLocks;

/// Reconciler view of one live Deployment, rebuilt on every pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentRecord {
    /// Deployment name
    pub identity: String,
    /// Spec hash recorded on the live object
    pub spec_hash: Option<String>,
    /// The object exists
    pub exists: bool,
    /// Live selector equals the desired one
    pub selector_matches: bool,
}

impl DeploymentRecord {
    /// Build a record from what the API returned
    pub fn observe(
        identity: impl Into<String>,
        live: Option<&LiveDeployment>,
        desired_selector: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            spec_hash: live.and_then(|d| d.annotations.get(ANNOTATION_SPEC_HASH).cloned()),
            exists: live.is_some(),
            selector_matches: live.is_some_and(|d| &d.selector == desired_selector),
        }
    }

    /// Classify against the desired spec hash
    pub fn state(&self, desired_hash: &str) -> ReconcileState {
        if !self.exists {
            ReconcileState::Absent
        } else if !self.selector_matches {
            ReconcileState::PresentConflicting
        } else if self.spec_hash.as_deref() == Some(desired_hash) {
            ReconcileState::PresentCurrent
        } else {
            ReconcileState::PresentStale
        }
    }
}

/// Where a live identity stands relative to its plan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileState {
    /// No live object
    Absent,
    /// Live object matches the plan
    PresentCurrent,
    /// Live object differs in fields that can be updated
    PresentStale,
    /// Live object differs in fields that cannot be updated
    PresentConflicting,
}

/// What convergence did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Created from scratch
    Created,
    /// Already current
    Unchanged,
    /// Updated in place
    Updated,
    /// Deleted and created again
    Recreated,
}

/// Result of reconciling one plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Deployment name
    pub name: String,
    /// What convergence did
    pub outcome: ReconcileOutcome,
    /// Singleton cleanup, for singleton classes
    pub cleanup: Option<CleanupReport>,
}

/// Converges Deployments one identity at a time
pub struct DeploymentReconciler {
    deployments: Arc<dyn DeploymentClient>,
    credentials: Arc<dyn CredentialStore>,
    locks: IdentityLocks,
}

impl DeploymentReconciler {
    /// Create a reconciler
    pub fn new(deployments: Arc<dyn DeploymentClient>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            deployments,
            credentials,
            locks: IdentityLocks::new(),
        }
    }

    /// Converge the plan's Deployment, then run singleton cleanup when the
    /// class requires it
    #[instrument(skip_all, fields(deployment = %plan.name(), namespace = %plan.namespace))]
    pub async fn reconcile(&self, plan: &ExecutionPlan) -> Result<ReconcileReport> {
        let name = plan.name();
        let outcome = {
            let _guard = self.locks.lock(&plan.namespace, &name).await;
            self.converge(plan).await?
        };
        info!(?outcome, "deployment converged");

        let cleanup = if plan.class.is_singleton() {
            let report = remove_extra_instances(
                self.deployments.as_ref(),
                self.credentials.as_ref(),
                plan.class,
                &plan.namespace,
            )
            .await;
            if !report.warnings.is_empty() {
                warn!(warnings = report.warnings.len(), "singleton cleanup incomplete");
            }
            Some(report)
        } else {
            None
        };

        Ok(ReconcileReport {
            name,
            outcome,
            cleanup,
        })
    }

    /// Converge without cleanup. Callers hold the identity lock.
    async fn converge(&self, plan: &ExecutionPlan) -> Result<ReconcileOutcome> {
        let desired = plan.to_deployment()?;
        let desired_hash = desired
            .metadata
            .annotations
            .get(ANNOTATION_SPEC_HASH)
            .cloned()
            .ok_or_else(|| Error::internal_with_context("reconciler", "desired deployment has no spec hash"))?;

        let live = self
            .deployments
            .get(&desired.metadata.namespace, &desired.metadata.name)
            .await?;
        let record = DeploymentRecord::observe(&desired.metadata.name, live.as_ref(), &plan.selector());
        let state = record.state(&desired_hash);
        debug!(?state, live_hash = ?record.spec_hash, %desired_hash, "observed");

        match state {
            ReconcileState::Absent => match self.deployments.create(&desired).await {
                Ok(()) => Ok(ReconcileOutcome::Created),
                Err(e) if e.is_already_exists() => {
                    debug!("created concurrently, updating instead");
                    self.update(&desired).await
                }
                Err(e) => Err(e),
            },
            ReconcileState::PresentCurrent => Ok(ReconcileOutcome::Unchanged),
            ReconcileState::PresentStale => self.update(&desired).await,
            ReconcileState::PresentConflicting => self.recreate(&desired).await,
        }
    }

    async fn update(&self, desired: &Deployment) -> Result<ReconcileOutcome> {
        match self.deployments.apply(desired).await {
            Ok(()) => Ok(ReconcileOutcome::Updated),
            Err(e) if e.is_immutable_rejection() => {
                warn!(error = %e, "update rejected, recreating");
                self.recreate(desired).await
            }
            Err(e) => Err(e),
        }
    }

    async fn recreate(&self, desired: &Deployment) -> Result<ReconcileOutcome> {
        let name = &desired.metadata.name;
        self.deployments
            .delete(&desired.metadata.namespace, name, DeleteMode::Background)
            .await?;
        self.deployments
            .create(desired)
            .await
            .map_err(|e| Error::recreate(name, e.to_string()))?;
        Ok(ReconcileOutcome::Recreated)
    }
}
