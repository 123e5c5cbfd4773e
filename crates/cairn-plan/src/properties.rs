//! Raw daemon inputs: per-OSD properties and the cluster-wide context they
//! are planned against.

use std::collections::{BTreeMap, BTreeSet};

use cairn_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::k8s::ResourceRequirements;

/// Key in the key-management connection details naming the provider
pub const KMS_PROVIDER_KEY: &str = "KMS_PROVIDER";
/// Key in the key-management connection details naming the auth method
pub const KMS_AUTH_METHOD_KEY: &str = "VAULT_AUTH_METHOD";
/// Key in the key-management connection details holding the service address
pub const VAULT_ADDR_KEY: &str = "VAULT_ADDR";

/// Cluster-wide settings shared by every daemon plan
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterContext {
    /// Namespace the daemons run in
    pub namespace: String,
    /// Cluster fsid passed to every daemon
    pub fsid: String,
    /// Image carrying the storage daemons and their tooling
    pub ceph_image: String,
    /// Image carrying the cairn binary (config rendering, binary staging)
    pub operator_image: String,
    /// Root of the per-namespace host directories backing bridges
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    /// Host directory for logs and crash dumps; emptyDirs are used when unset
    #[serde(default)]
    pub data_dir_host_path: Option<String>,
    /// Run daemons on the host network
    #[serde(default)]
    pub host_network: bool,
    /// Share the host PID namespace (legacy daemons that need it)
    #[serde(default)]
    pub host_pid: bool,
    /// Bind messengers to IPv6
    #[serde(default)]
    pub ipv6: bool,
    /// Priority class for OSD pods
    #[serde(default)]
    pub osd_priority_class_name: Option<String>,
    /// Remote key-management service, when one is configured
    #[serde(default)]
    pub kms: Option<KmsConfig>,
}

fn default_config_dir() -> String {
    "/var/lib/cairn".to_string()
}

/// Remote key-management configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KmsConfig {
    /// Provider connection details (`KMS_PROVIDER`, `VAULT_ADDR`, `VAULT_BACKEND_PATH`, ...)
    #[serde(default)]
    pub connection_details: BTreeMap<String, String>,
    /// Secret holding the access token under the `token` key
    #[serde(default)]
    pub token_secret_name: Option<String>,
}

impl KmsConfig {
    /// Look up a connection detail, treating empty values as absent
    pub fn param(&self, key: &str) -> Option<&str> {
        self.connection_details
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Provider name as configured (lowercased), or "" when unset
    pub fn provider_name(&self) -> String {
        self.param(KMS_PROVIDER_KEY)
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    /// Auth method name; token auth is the default when a token secret is set
    pub fn auth_method_name(&self) -> String {
        match self.param(KMS_AUTH_METHOD_KEY) {
            Some(method) => method.to_ascii_lowercase(),
            None if self.token_secret_name.is_some() => "token".to_string(),
            None => String::new(),
        }
    }
}

/// Device-class tuning applied to PVC-backed daemons
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTuning {
    /// No tuning flags
    #[default]
    None,
    /// Flash-backed storage class
    Fast,
    /// Rotational or network-backed storage class
    Slow,
}

/// Raw properties of one OSD, as recorded when the disk was prepared
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonProperties {
    /// OSD id
    pub id: u32,
    /// OSD fsid/uuid
    pub uuid: String,
    /// Hostname the daemon is placed on
    pub crush_hostname: String,
    /// CRUSH location (e.g. "root=default host=node-a")
    #[serde(default)]
    pub location: String,
    /// Block path recorded at prepare time
    #[serde(default)]
    pub block_path: String,
    /// Preparation tool mode ("lvm", "raw", or "" for daemons prepared
    /// before the mode was recorded)
    #[serde(default)]
    pub cv_mode: String,
    /// The volume is a logical volume carved from a PV
    #[serde(default)]
    pub lv_backed_pv: bool,
    /// Data claim; its presence makes this a PVC-backed daemon
    #[serde(default)]
    pub data_claim: Option<String>,
    /// Separate metadata (block.db) claim
    #[serde(default)]
    pub metadata_claim: Option<String>,
    /// Separate WAL (block.wal) claim
    #[serde(default)]
    pub wal_claim: Option<String>,
    /// Local metadata device for raw activation of host disks
    #[serde(default)]
    pub metadata_device: Option<String>,
    /// Local WAL device for raw activation of host disks
    #[serde(default)]
    pub wal_device: Option<String>,
    /// Requested PVC size; a change restarts the daemon
    #[serde(default)]
    pub pvc_size: Option<String>,
    /// Device set the claims belong to
    #[serde(default)]
    pub device_set: Option<String>,
    /// Disk is encrypted with dm-crypt
    #[serde(default)]
    pub encrypted: bool,
    /// Daemon may move between nodes with its volume
    #[serde(default)]
    pub portable: bool,
    /// Topology affinity recorded at prepare time (portable daemons)
    #[serde(default)]
    pub topology_affinity: Option<String>,
    /// Device-class tuning
    #[serde(default)]
    pub tuning: DeviceTuning,
    /// Resources for the daemon and its init steps
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Scheduler name
    #[serde(default)]
    pub scheduler_name: Option<String>,
}

impl DaemonProperties {
    /// Daemon name used in logs and errors (e.g. "osd.3")
    pub fn daemon_name(&self) -> String {
        format!("osd.{}", self.id)
    }

    /// True when a data claim is attached
    pub fn on_pvc(&self) -> bool {
        self.data_claim.is_some()
    }

    /// Mode string for the volume tool. An unrecorded mode predates raw
    /// preparation and means `lvm`.
    pub fn volume_tool_mode(&self) -> &'static str {
        match self.cv_mode.as_str() {
            "raw" => "raw",
            _ => "lvm",
        }
    }

    /// Reject property combinations no topology can describe
    pub fn validate(&self, kms: Option<&KmsConfig>) -> Result<()> {
        let daemon = self.daemon_name();

        if self.uuid.trim().is_empty() {
            return Err(Error::validation_for_field(&daemon, "uuid", "uuid is empty"));
        }

        if !matches!(self.cv_mode.as_str(), "" | "lvm" | "raw") {
            return Err(Error::validation_for_field(
                &daemon,
                "cvMode",
                format!("unknown activation mode '{}'", self.cv_mode),
            ));
        }

        let claims = [
            ("dataClaim", &self.data_claim),
            ("metadataClaim", &self.metadata_claim),
            ("walClaim", &self.wal_claim),
        ];
        let mut seen = BTreeSet::new();
        for (field, claim) in claims {
            let Some(claim) = claim else { continue };
            if claim.trim().is_empty() || claim.contains('/') {
                return Err(Error::validation_for_field(
                    &daemon,
                    field,
                    format!("invalid claim name '{}'", claim),
                ));
            }
            if !seen.insert(claim.as_str()) {
                return Err(Error::validation_for_field(
                    &daemon,
                    field,
                    format!("claim '{}' is attached more than once", claim),
                ));
            }
        }

        if !self.on_pvc() {
            for (field, claim) in &claims[1..] {
                if claim.is_some() {
                    return Err(Error::validation_for_field(
                        &daemon,
                        *field,
                        "requires a data claim",
                    ));
                }
            }
            if self.block_path.trim().is_empty() {
                return Err(Error::validation_for_field(
                    &daemon,
                    "blockPath",
                    "host device daemons need a block path",
                ));
            }
        }

        if self.on_pvc() && self.encrypted {
            if let Some(kms) = kms {
                validate_kms(&daemon, kms)?;
            }
        }

        Ok(())
    }
}

fn validate_kms(daemon: &str, kms: &KmsConfig) -> Result<()> {
    let provider = kms.provider_name();
    if provider != "vault" {
        return Err(Error::validation_for_field(
            daemon,
            "kms.KMS_PROVIDER",
            format!("unsupported key-management provider '{}'", provider),
        ));
    }
    let auth = kms.auth_method_name();
    if auth != "token" {
        return Err(Error::validation_for_field(
            daemon,
            "kms.VAULT_AUTH_METHOD",
            format!("unsupported key-management auth method '{}'", auth),
        ));
    }
    if kms.token_secret_name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::validation_for_field(
            daemon,
            "kms.tokenSecretName",
            "token auth needs a token secret",
        ));
    }
    if kms.param(VAULT_ADDR_KEY).is_none() {
        return Err(Error::validation_for_field(
            daemon,
            "kms.VAULT_ADDR",
            "key-management address is not set",
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn cluster() -> ClusterContext {
        ClusterContext {
            namespace: "storage".to_string(),
            fsid: "5e3c1b5a-0000-4d9b-8f6e-cafe00000000".to_string(),
            ceph_image: "quay.io/ceph/ceph:v19".to_string(),
            operator_image: "ghcr.io/cairn/cairn:v0.1.0".to_string(),
            config_dir: default_config_dir(),
            data_dir_host_path: None,
            host_network: false,
            host_pid: false,
            ipv6: false,
            osd_priority_class_name: None,
            kms: None,
        }
    }

    pub(crate) fn pvc_props(id: u32) -> DaemonProperties {
        DaemonProperties {
            id,
            uuid: "a6b4c2e0-1111-4f3a-9d5e-000000000001".to_string(),
            crush_hostname: "node-a".to_string(),
            location: "root=default host=set1-data-0".to_string(),
            block_path: "/mnt/set1-data-0".to_string(),
            cv_mode: "raw".to_string(),
            data_claim: Some("set1-data-0".to_string()),
            pvc_size: Some("10Gi".to_string()),
            device_set: Some("set1".to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn vault_kms() -> KmsConfig {
        let mut details = BTreeMap::new();
        details.insert("KMS_PROVIDER".to_string(), "vault".to_string());
        details.insert("VAULT_ADDR".to_string(), "https://vault.example:8200".to_string());
        details.insert("VAULT_BACKEND_PATH".to_string(), "cairn".to_string());
        details.insert("VAULT_BACKEND".to_string(), "v2".to_string());
        KmsConfig {
            connection_details: details,
            token_secret_name: Some("vault-token".to_string()),
        }
    }

    #[test]
    fn test_valid_pvc_daemon() {
        assert!(pvc_props(0).validate(None).is_ok());
    }

    #[test]
    fn test_metadata_claim_requires_data_claim() {
        let props = DaemonProperties {
            data_claim: None,
            metadata_claim: Some("set1-meta-0".to_string()),
            ..pvc_props(1)
        };
        let err = props.validate(None).unwrap_err();
        match err {
            Error::Validation { field, daemon, .. } => {
                assert_eq!(field.as_deref(), Some("metadataClaim"));
                assert_eq!(daemon, "osd.1");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_mode_and_duplicate_claims() {
        let props = DaemonProperties {
            cv_mode: "zfs".to_string(),
            ..pvc_props(2)
        };
        assert!(props.validate(None).is_err());

        let props = DaemonProperties {
            wal_claim: Some("set1-data-0".to_string()),
            ..pvc_props(2)
        };
        assert!(props.validate(None).is_err());
    }

    #[test]
    fn test_host_device_needs_block_path() {
        let props = DaemonProperties {
            data_claim: None,
            block_path: String::new(),
            ..pvc_props(3)
        };
        assert!(props.validate(None).is_err());
    }

    /// Story: only Vault with token auth can back encrypted PVC daemons
    #[test]
    fn story_kms_provider_and_auth_are_checked() {
        let props = DaemonProperties {
            encrypted: true,
            ..pvc_props(4)
        };
        assert!(props.validate(Some(&vault_kms())).is_ok());

        let mut kmip = vault_kms();
        kmip.connection_details
            .insert("KMS_PROVIDER".to_string(), "kmip".to_string());
        assert!(props.validate(Some(&kmip)).is_err());

        let mut k8s_auth = vault_kms();
        k8s_auth
            .connection_details
            .insert("VAULT_AUTH_METHOD".to_string(), "kubernetes".to_string());
        assert!(props.validate(Some(&k8s_auth)).is_err());

        // Unencrypted daemons never touch the service
        let plain = pvc_props(5);
        assert!(plain.validate(Some(&kmip)).is_ok());
    }

    #[test]
    fn test_deserializes_from_yaml() {
        let yaml = r#"
id: 7
uuid: 0f5e
crushHostname: node-b
cvMode: lvm
dataClaim: set2-data-1
metadataClaim: set2-meta-1
encrypted: true
tuning: fast
resources:
  limits:
    memory: 4Gi
"#;
        let props: DaemonProperties = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(props.id, 7);
        assert_eq!(props.tuning, DeviceTuning::Fast);
        assert_eq!(props.metadata_claim.as_deref(), Some("set2-meta-1"));
        assert_eq!(props.resources.memory_limit_bytes(), Some(4 << 30));
        assert!(!props.portable);
    }
}
