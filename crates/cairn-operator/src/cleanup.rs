//! Garbage collection of extra singleton instances
//!
//! A singleton class keeps only its canonical instance (ordinal 0). Other
//! instances, left over from when the class was scaled out, are deleted
//! together with their auth credential. Nothing here fails the reconcile;
//! problems are reported as warnings.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use cairn_common::{Error, Result};
use cairn_plan::DaemonClass;

use crate::client::{DeleteMode, DeploymentClient};

const AUTH_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Removes daemon auth credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Delete the credential of `entity` (e.g. "client.rbd-mirror.b")
    async fn delete(&self, entity: &str) -> Result<()>;
}

/// [`CredentialStore`] running `ceph auth del` against the cluster
pub struct CephAuthStore {
    args: Vec<String>,
}

impl CephAuthStore {
    /// Create a store; `args` go before the subcommand (e.g. `--conf`, `--keyring`)
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }
}

#[async_trait]
impl CredentialStore for CephAuthStore {
    async fn delete(&self, entity: &str) -> Result<()> {
        let mut cmd = Command::new("ceph");
        cmd.args(&self.args).args(["auth", "del", entity]);

        let output = tokio::time::timeout(AUTH_COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::credential(entity, format!("timed out after {:?}", AUTH_COMMAND_TIMEOUT)))?
            .map_err(|e| Error::credential(entity, format!("failed to execute: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::credential(
                entity,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// A non-fatal cleanup problem
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupWarning {
    /// Deployment or credential the warning is about
    pub resource: String,
    /// What went wrong
    pub message: String,
}

impl CleanupWarning {
    fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        let warning = Self {
            resource: resource.into(),
            message: message.into(),
        };
        warn!(resource = %warning.resource, "{}", warning.message);
        warning
    }
}

/// What a cleanup pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Deployments removed
    pub removed: Vec<String>,
    /// Credentials removed
    pub credentials_removed: Vec<String>,
    /// Problems encountered
    pub warnings: Vec<CleanupWarning>,
}

/// Delete every instance of a singleton class except ordinal 0
pub async fn remove_extra_instances(
    deployments: &dyn DeploymentClient,
    credentials: &dyn CredentialStore,
    class: DaemonClass,
    namespace: &str,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    let live = match deployments.list(namespace, class.app_label()).await {
        Ok(live) => live,
        Err(e) => {
            report
                .warnings
                .push(CleanupWarning::new(class.app_label(), format!("failed to list instances: {}", e)));
            return report;
        }
    };
    if live.len() <= 1 {
        return report;
    }

    let label = class.identity_label();
    for deployment in live {
        let Some(value) = deployment.labels.get(label) else {
            report.warnings.push(CleanupWarning::new(
                &deployment.name,
                format!("unrecognized instance: no '{}' label", label),
            ));
            continue;
        };
        let Some(ordinal) = class.parse_identity(value) else {
            report.warnings.push(CleanupWarning::new(
                &deployment.name,
                format!("unrecognized instance: bad '{}' label '{}'", label, value),
            ));
            continue;
        };
        if ordinal == 0 {
            continue;
        }

        info!(deployment = %deployment.name, ordinal, "removing extra singleton instance");
        if let Err(e) = deployments
            .delete(namespace, &deployment.name, DeleteMode::ForegroundImmediate)
            .await
        {
            report
                .warnings
                .push(CleanupWarning::new(&deployment.name, format!("failed to delete: {}", e)));
            continue;
        }
        report.removed.push(deployment.name.clone());

        let entity = class.credential_entity(ordinal);
        match credentials.delete(&entity).await {
            Ok(()) => report.credentials_removed.push(entity),
            Err(e) => report
                .warnings
                .push(CleanupWarning::new(&entity, format!("failed to delete credential: {}", e))),
        }
    }
    report
}
