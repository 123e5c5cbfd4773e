//! Kubernetes resource types for execution plans
//!
//! Only the fields the planner sets are mirrored. The operator converts these
//! into `k8s_openapi` types at the API boundary.

use std::collections::BTreeMap;

use cairn_common::kube_utils::ObjectMeta;
use serde::{Deserialize, Serialize};

// =============================================================================
// Container
// =============================================================================

/// Container spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name
    pub name: String,
    /// Image
    pub image: String,
    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Args
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Raw block devices
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_devices: Vec<VolumeDevice>,
    /// Security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

/// Environment variable -- either a literal value or a reference to a secret key
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Literal value (mutually exclusive with `value_from`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Reference to a secret key (mutually exclusive with `value`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

impl EnvVar {
    /// Create an env var with a literal value
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    /// Create an env var that references a secret key
    pub fn from_secret(
        name: impl Into<String>,
        secret_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name.into(),
                    key: key.into(),
                }),
            }),
        }
    }
}

/// Source for an environment variable value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    /// Reference to a specific key in a K8s Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeySelector>,
}

/// Selector for a key within a K8s Secret
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    /// Name of the K8s Secret
    pub name: String,
    /// Key within the secret
    pub key: String,
}

// =============================================================================
// Resource requirements
// =============================================================================

/// Resource requirements
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantity>,
    /// Limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantity>,
}

impl ResourceRequirements {
    /// True when neither requests nor limits are set
    pub fn is_empty(&self) -> bool {
        self.requests.is_none() && self.limits.is_none()
    }

    /// Memory limit in bytes, if set and parseable
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.limits
            .as_ref()
            .and_then(|q| q.memory.as_deref())
            .and_then(parse_quantity_bytes)
    }

    /// Memory request in bytes, if set and parseable
    pub fn memory_request_bytes(&self) -> Option<u64> {
        self.requests
            .as_ref()
            .and_then(|q| q.memory.as_deref())
            .and_then(parse_quantity_bytes)
    }
}

/// Resource quantity
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceQuantity {
    /// CPU (e.g. "500m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory (e.g. "4Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Parse a Kubernetes memory quantity ("512Mi", "1G", "1048576") into bytes.
///
/// Decimal fractions and exponent notation are not accepted.
pub fn parse_quantity_bytes(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, suffix) = quantity.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

// =============================================================================
// Security context
// =============================================================================

/// Kubernetes container security context
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    /// Run container in privileged mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    /// UID to run the container as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// Mount root filesystem as read-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_root_filesystem: Option<bool>,
}

impl SecurityContext {
    /// Root, privileged, writable root filesystem. Device mapping and
    /// ownership changes need all three.
    pub fn privileged() -> Self {
        Self {
            privileged: Some(true),
            run_as_user: Some(0),
            read_only_root_filesystem: Some(false),
        }
    }

    /// Root without extra privileges
    pub fn unprivileged() -> Self {
        Self {
            privileged: Some(false),
            run_as_user: Some(0),
            read_only_root_filesystem: None,
        }
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// Volume
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// HostPath source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    /// ConfigMap source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,
    /// Secret source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,
    /// EmptyDir source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    /// PVC source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcVolumeSource>,
}

impl Volume {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_path: None,
            config_map: None,
            secret: None,
            empty_dir: None,
            persistent_volume_claim: None,
        }
    }

    /// Create a Volume backed by a host directory.
    pub fn from_host_path(
        name: impl Into<String>,
        path: impl Into<String>,
        type_: Option<&str>,
    ) -> Self {
        Self {
            host_path: Some(HostPathVolumeSource {
                path: path.into(),
                type_: type_.map(str::to_string),
            }),
            ..Self::named(name)
        }
    }

    /// Create a Volume backed by a ConfigMap.
    pub fn from_config_map(name: impl Into<String>, cm_name: impl Into<String>) -> Self {
        Self {
            config_map: Some(ConfigMapVolumeSource {
                name: cm_name.into(),
                items: Vec::new(),
            }),
            ..Self::named(name)
        }
    }

    /// Create a Volume backed by a Secret.
    pub fn from_secret(name: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            secret: Some(SecretVolumeSource {
                secret_name: secret_name.into(),
                items: Vec::new(),
                default_mode: None,
            }),
            ..Self::named(name)
        }
    }

    /// Create a Volume that projects one secret key to a file, readable only by its owner.
    pub fn from_secret_key(
        name: impl Into<String>,
        secret_name: impl Into<String>,
        key: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            secret: Some(SecretVolumeSource {
                secret_name: secret_name.into(),
                items: vec![KeyToPath {
                    key: key.into(),
                    path: path.into(),
                }],
                default_mode: Some(0o400),
            }),
            ..Self::named(name)
        }
    }

    /// Create a Volume backed by an emptyDir.
    pub fn from_empty_dir(name: impl Into<String>, medium: Option<&str>) -> Self {
        Self {
            empty_dir: Some(EmptyDirVolumeSource {
                medium: medium.map(str::to_string),
            }),
            ..Self::named(name)
        }
    }

    /// Create a Volume backed by a PVC.
    pub fn from_pvc(name: impl Into<String>, claim_name: impl Into<String>) -> Self {
        Self {
            persistent_volume_claim: Some(PvcVolumeSource {
                claim_name: claim_name.into(),
                read_only: None,
            }),
            ..Self::named(name)
        }
    }
}

/// HostPath volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostPathVolumeSource {
    /// Path on the node
    pub path: String,
    /// HostPath type (e.g. "DirectoryOrCreate")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// ConfigMap volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapVolumeSource {
    /// ConfigMap name
    pub name: String,
    /// Keys to project (all keys when empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<KeyToPath>,
}

/// Secret volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretVolumeSource {
    /// Secret name
    pub secret_name: String,
    /// Keys to project (all keys when empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<KeyToPath>,
    /// File mode for projected keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<i32>,
}

/// Projection of one key to a relative file path
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyToPath {
    /// Key in the source object
    pub key: String,
    /// Relative path of the projected file
    pub path: String,
}

/// EmptyDir volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirVolumeSource {
    /// Storage medium ("Memory" for tmpfs, empty for default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
}

/// PVC volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcVolumeSource {
    /// PVC claim name
    pub claim_name: String,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Volume mount
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name
    pub name: String,
    /// Mount path
    pub mount_path: String,
    /// Sub path within the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

impl VolumeMount {
    /// Create a read-write mount
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            sub_path: None,
            read_only: None,
        }
    }

    /// Create a read-only mount
    pub fn read_only(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            read_only: Some(true),
            ..Self::new(name, mount_path)
        }
    }
}

/// Raw block device exposed to a container
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDevice {
    /// Volume name (a PVC in block mode)
    pub name: String,
    /// Device node path inside the container
    pub device_path: String,
}

impl VolumeDevice {
    /// Create a device binding
    pub fn new(name: impl Into<String>, device_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_path: device_path.into(),
        }
    }
}

// =============================================================================
// Deployment
// =============================================================================

/// Kubernetes Deployment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: DeploymentSpec,
}

impl Deployment {
    /// Create a Deployment around a spec
    pub fn new(metadata: ObjectMeta, spec: DeploymentSpec) -> Self {
        Self {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            metadata,
            spec,
        }
    }
}

/// Deployment spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Number of replicas
    pub replicas: u32,
    /// Label selector
    pub selector: LabelSelector,
    /// Pod template
    pub template: PodTemplateSpec,
    /// Deployment strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,
}

/// Deployment strategy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStrategy {
    /// Strategy type: RollingUpdate or Recreate
    #[serde(rename = "type")]
    pub type_: String,
}

impl DeploymentStrategy {
    /// Stop the old pod before starting the new one
    pub fn recreate() -> Self {
        Self {
            type_: "Recreate".to_string(),
        }
    }
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

/// Pod template spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    /// Pod metadata
    pub metadata: PodMeta,
    /// Pod spec
    pub spec: PodSpec,
}

/// Pod metadata (subset of ObjectMeta)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    /// Name prefix for the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Pod spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Service account name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Init containers (run before main containers)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Containers
    pub containers: Vec<Container>,
    /// Volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    /// Use host network namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
    /// Use host PID namespace
    #[serde(rename = "hostPID", default, skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<bool>,
    /// Use host IPC namespace
    #[serde(rename = "hostIPC", default, skip_serializing_if = "Option::is_none")]
    pub host_ipc: Option<bool>,
    /// DNS policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    /// Priority class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    /// Scheduler name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    /// Node selector for scheduling onto specific nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity_bytes() {
        assert_eq!(parse_quantity_bytes("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_quantity_bytes("4Gi"), Some(4 << 30));
        assert_eq!(parse_quantity_bytes("1G"), Some(1_000_000_000));
        assert_eq!(parse_quantity_bytes("1048576"), Some(1_048_576));
        assert_eq!(parse_quantity_bytes("1.5Gi"), None);
        assert_eq!(parse_quantity_bytes("lots"), None);
        assert_eq!(parse_quantity_bytes(""), None);
    }

    #[test]
    fn test_host_namespace_fields_use_api_casing() {
        let spec = PodSpec {
            host_pid: Some(true),
            host_ipc: Some(true),
            host_network: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["hostPID"], true);
        assert_eq!(json["hostIPC"], true);
        assert_eq!(json["hostNetwork"], false);
        assert!(json.get("nodeSelector").is_none());
    }

    #[test]
    fn test_secret_key_volume_is_owner_only() {
        let vol = Volume::from_secret_key("key", "osd-key", "dmcrypt-key", "luks_key");
        let json = serde_json::to_value(&vol).unwrap();
        assert_eq!(json["secret"]["secretName"], "osd-key");
        assert_eq!(json["secret"]["items"][0]["key"], "dmcrypt-key");
        assert_eq!(json["secret"]["defaultMode"], 0o400);
        assert!(json.get("hostPath").is_none());
    }

    #[test]
    fn test_host_path_type_renames() {
        let vol = Volume::from_host_path("udev", "/run/udev", Some("Directory"));
        let json = serde_json::to_value(&vol).unwrap();
        assert_eq!(json["hostPath"]["type"], "Directory");
    }
}
