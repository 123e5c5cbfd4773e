//! Execution plans and their Deployment form

use std::collections::{BTreeMap, BTreeSet};

use cairn_common::kube_utils::{deterministic_hash, index_to_name, name_to_index, ObjectMeta};
use cairn_common::{Error, Result, ANNOTATION_SPEC_HASH, LABEL_APP, LABEL_CLUSTER};

use crate::k8s::{
    Deployment, DeploymentSpec, DeploymentStrategy, LabelSelector, PodMeta, PodSpec,
    PodTemplateSpec, Volume,
};
use crate::step::PipelineStep;

/// Kind of storage daemon a plan runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DaemonClass {
    /// Object storage daemon, one per disk
    Osd,
    /// Block mirroring daemon, one per cluster
    RbdMirror,
}

impl DaemonClass {
    /// Value of the `app` label
    pub fn app_label(&self) -> &'static str {
        match self {
            DaemonClass::Osd => "cairn-osd",
            DaemonClass::RbdMirror => "cairn-rbd-mirror",
        }
    }

    /// Label carrying the daemon identity
    pub fn identity_label(&self) -> &'static str {
        match self {
            DaemonClass::Osd => "ceph-osd-id",
            DaemonClass::RbdMirror => "rbd-mirror",
        }
    }

    /// At most one canonical instance (ordinal 0) may exist
    pub fn is_singleton(&self) -> bool {
        matches!(self, DaemonClass::RbdMirror)
    }

    /// Identity label value for an ordinal
    pub fn identity_value(&self, ordinal: u32) -> String {
        match self {
            DaemonClass::Osd => ordinal.to_string(),
            DaemonClass::RbdMirror => index_to_name(ordinal),
        }
    }

    /// Parse an identity label value back into an ordinal
    pub fn parse_identity(&self, value: &str) -> Option<u32> {
        match self {
            DaemonClass::Osd => value.parse().ok(),
            DaemonClass::RbdMirror => name_to_index(value),
        }
    }

    /// Auth entity whose key the instance uses
    pub fn credential_entity(&self, ordinal: u32) -> String {
        match self {
            DaemonClass::Osd => format!("osd.{}", ordinal),
            DaemonClass::RbdMirror => format!("client.rbd-mirror.{}", index_to_name(ordinal)),
        }
    }

    /// Deployment name for an ordinal
    pub fn resource_name(&self, ordinal: u32) -> String {
        format!("{}-{}", self.app_label(), self.identity_value(ordinal))
    }

    /// Service account the pods run as
    pub fn service_account(&self) -> &'static str {
        match self {
            DaemonClass::Osd => "cairn-osd",
            DaemonClass::RbdMirror => "cairn-rbd-mirror",
        }
    }
}

/// Pod-level fields of a plan
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSettings {
    /// Host network namespace
    pub host_network: bool,
    /// Host PID namespace
    pub host_pid: bool,
    /// Host IPC namespace
    pub host_ipc: bool,
    /// Priority class
    pub priority_class_name: Option<String>,
    /// Scheduler
    pub scheduler_name: Option<String>,
    /// Node selector
    pub node_selector: BTreeMap<String, String>,
}

/// Ordered init steps, the daemon container and the pod around them
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    /// Daemon class
    pub class: DaemonClass,
    /// Ordinal identity (OSD id, mirror index)
    pub ordinal: u32,
    /// Namespace
    pub namespace: String,
    /// Init steps in run order
    pub steps: Vec<PipelineStep>,
    /// The long-running daemon container
    pub daemon: PipelineStep,
    /// Pod volumes
    pub volumes: Vec<Volume>,
    /// Pod-level settings
    pub pod: PodSettings,
    /// Labels beyond the selector labels (claim, device set)
    pub extra_labels: BTreeMap<String, String>,
}

impl ExecutionPlan {
    /// Deployment name
    pub fn name(&self) -> String {
        self.class.resource_name(self.ordinal)
    }

    /// Daemon name used in errors
    pub fn daemon_name(&self) -> String {
        self.class.credential_entity(self.ordinal)
    }

    /// Labels selecting this plan's pods
    pub fn selector(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP.to_string(), self.class.app_label().to_string());
        labels.insert(LABEL_CLUSTER.to_string(), self.namespace.clone());
        labels.insert(
            self.class.identity_label().to_string(),
            self.class.identity_value(self.ordinal),
        );
        labels
    }

    /// All pod labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector();
        labels.extend(self.extra_labels.clone());
        labels
    }

    /// Init step names in order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Look up an init step by name
    pub fn step(&self, name: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Check structural invariants: unique container names and every mount
    /// or device backed by a declared volume
    pub fn validate(&self) -> Result<()> {
        let daemon = self.daemon_name();
        let mut names = BTreeSet::new();
        for step in self.steps.iter().chain(std::iter::once(&self.daemon)) {
            if !names.insert(step.name.as_str()) {
                return Err(Error::plan_build(
                    &daemon,
                    format!("step name '{}' is used twice", step.name),
                ));
            }
        }

        let mut declared = BTreeSet::new();
        for volume in &self.volumes {
            if !declared.insert(volume.name.as_str()) {
                return Err(Error::plan_build(
                    &daemon,
                    format!("volume '{}' is declared twice", volume.name),
                ));
            }
        }
        for step in self.steps.iter().chain(std::iter::once(&self.daemon)) {
            let referenced = step
                .volume_mounts
                .iter()
                .map(|m| m.name.as_str())
                .chain(step.volume_devices.iter().map(|d| d.name.as_str()));
            for name in referenced {
                if !declared.contains(name) {
                    return Err(Error::plan_build(
                        &daemon,
                        format!("step '{}' uses undeclared volume '{}'", step.name, name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Deployment spec for this plan: one replica, stop-then-start rollout
    pub fn deployment_spec(&self) -> DeploymentSpec {
        let pod = &self.pod;
        DeploymentSpec {
            replicas: 1,
            selector: LabelSelector {
                match_labels: self.selector(),
            },
            strategy: Some(DeploymentStrategy::recreate()),
            template: PodTemplateSpec {
                metadata: PodMeta {
                    name: Some(self.class.app_label().to_string()),
                    labels: self.labels(),
                    annotations: BTreeMap::new(),
                },
                spec: PodSpec {
                    service_account_name: Some(self.class.service_account().to_string()),
                    init_containers: self.steps.iter().map(PipelineStep::to_container).collect(),
                    containers: vec![self.daemon.to_container()],
                    volumes: self.volumes.clone(),
                    restart_policy: Some("Always".to_string()),
                    host_network: Some(pod.host_network),
                    host_pid: Some(pod.host_pid),
                    host_ipc: Some(pod.host_ipc),
                    dns_policy: pod
                        .host_network
                        .then(|| "ClusterFirstWithHostNet".to_string()),
                    priority_class_name: pod.priority_class_name.clone(),
                    scheduler_name: pod.scheduler_name.clone(),
                    node_selector: (!pod.node_selector.is_empty())
                        .then(|| pod.node_selector.clone()),
                },
            },
        }
    }

    /// Content hash of the Deployment this plan produces
    pub fn spec_hash(&self) -> Result<String> {
        let spec = self.deployment_spec();
        let json = serde_json::to_string(&(self.labels(), &spec))
            .map_err(|e| Error::serialization_for_kind("Deployment", e.to_string()))?;
        Ok(deterministic_hash(&json))
    }

    /// Convert to a Deployment carrying the spec-hash annotation
    pub fn to_deployment(&self) -> Result<Deployment> {
        self.validate()?;
        let hash = self.spec_hash()?;
        let mut metadata = ObjectMeta::new(self.name(), &self.namespace)
            .with_annotation(ANNOTATION_SPEC_HASH, hash);
        metadata.labels.extend(self.labels());
        Ok(Deployment::new(metadata, self.deployment_spec()))
    }
}
