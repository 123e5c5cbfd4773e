//! Deployment access behind a mockable trait

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment as ApiDeployment;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use cairn_common::{Error, Result, FIELD_MANAGER, LABEL_APP};
use cairn_plan::k8s::Deployment;

/// The parts of a live Deployment the reconciler reads
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveDeployment {
    /// Name
    pub name: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// `spec.selector.matchLabels`
    pub selector: BTreeMap<String, String>,
}

impl From<ApiDeployment> for LiveDeployment {
    fn from(d: ApiDeployment) -> Self {
        Self {
            name: d.metadata.name.unwrap_or_default(),
            labels: d.metadata.labels.unwrap_or_default(),
            annotations: d.metadata.annotations.unwrap_or_default(),
            selector: d
                .spec
                .and_then(|s| s.selector.match_labels)
                .unwrap_or_default(),
        }
    }
}

/// How a delete removes dependents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteMode {
    /// Remove the Deployment now and garbage-collect its pods afterwards
    Background,
    /// Remove pods first, with no grace period
    ForegroundImmediate,
}

/// Deployment operations the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Get a Deployment, `None` when absent
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<LiveDeployment>>;

    /// Create a Deployment
    async fn create(&self, deployment: &Deployment) -> Result<()>;

    /// Update a Deployment in place with a forced server-side apply
    async fn apply(&self, deployment: &Deployment) -> Result<()>;

    /// Delete a Deployment; deleting an absent one succeeds
    async fn delete(&self, namespace: &str, name: &str, mode: DeleteMode) -> Result<()>;

    /// List Deployments by `app` label
    async fn list(&self, namespace: &str, app: &str) -> Result<Vec<LiveDeployment>>;
}

/// [`DeploymentClient`] backed by the cluster API
pub struct KubeDeploymentClient {
    client: Client,
}

impl KubeDeploymentClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ApiDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Convert the planner's Deployment into the API type
pub fn to_api_deployment(deployment: &Deployment) -> Result<ApiDeployment> {
    serde_json::to_value(deployment)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind("Deployment", e.to_string()))
}

#[async_trait]
impl DeploymentClient for KubeDeploymentClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<LiveDeployment>> {
        match self.api(namespace).get(name).await {
            Ok(d) => Ok(Some(d.into())),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::from_kube(name, "get", e)),
        }
    }

    async fn create(&self, deployment: &Deployment) -> Result<()> {
        let name = &deployment.metadata.name;
        let obj = to_api_deployment(deployment)?;
        self.api(&deployment.metadata.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| Error::from_kube(name, "create", e))?;
        debug!(deployment = %name, "created");
        Ok(())
    }

    async fn apply(&self, deployment: &Deployment) -> Result<()> {
        let name = &deployment.metadata.name;
        let obj = to_api_deployment(deployment)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api(&deployment.metadata.namespace)
            .patch(name, &params, &Patch::Apply(&obj))
            .await
            .map_err(|e| Error::from_kube(name, "update", e))?;
        debug!(deployment = %name, "applied");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, mode: DeleteMode) -> Result<()> {
        let params = match mode {
            DeleteMode::Background => DeleteParams::background(),
            DeleteMode::ForegroundImmediate => DeleteParams {
                grace_period_seconds: Some(0),
                propagation_policy: Some(PropagationPolicy::Foreground),
                ..Default::default()
            },
        };
        match self.api(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(deployment = %name, "already deleted");
                Ok(())
            }
            Err(e) => Err(Error::from_kube(name, "delete", e)),
        }
    }

    async fn list(&self, namespace: &str, app: &str) -> Result<Vec<LiveDeployment>> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_APP, app));
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(app, "list", e))?;
        Ok(list.items.into_iter().map(LiveDeployment::from).collect())
    }
}
