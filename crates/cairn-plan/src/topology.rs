//! Storage topology classification
//!
//! Collapses raw daemon properties into the closed set of layouts the
//! pipeline builder branches on.

use std::fmt;

use crate::properties::{DaemonProperties, KmsConfig};

/// Where the daemon's disk comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// A host block device
    LocalDevice,
    /// A block-mode persistent volume claim
    PersistentVolume,
}

/// How the daemon is brought up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationMode {
    /// Daemon launched directly: raw claims and every host device
    Direct,
    /// Logical-volume prepared claim, daemon launched through the activation helper
    VolumeManager,
}

/// Key-management provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KmsProvider {
    /// HashiCorp Vault
    Vault,
    /// Anything else, kept by name
    Other(String),
}

impl fmt::Display for KmsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KmsProvider::Vault => write!(f, "vault"),
            KmsProvider::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Key-management authentication mode
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KmsAuth {
    /// Static token read from a secret
    Token,
    /// Anything else, kept by name
    Other(String),
}

/// Where the disk encryption key comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySource {
    /// No key flow runs
    None,
    /// A pre-provisioned secret projected into the pod
    LocalFile,
    /// A key-encryption key fetched from a remote service
    RemoteKms {
        /// Provider
        provider: KmsProvider,
        /// Authentication mode
        auth: KmsAuth,
    },
}

/// Immutable classification of one daemon's disk layout.
///
/// Constructed only through the builder methods, which keep separate
/// metadata/WAL volumes under `PersistentVolume` and a key source only on
/// encrypted topologies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageTopology {
    provisioning: ProvisioningMode,
    activation: ActivationMode,
    separate_metadata: bool,
    separate_wal: bool,
    encrypted: bool,
    key_source: KeySource,
}

impl StorageTopology {
    /// Host device topology. Host devices always launch directly.
    pub fn local_device() -> Self {
        Self {
            provisioning: ProvisioningMode::LocalDevice,
            activation: ActivationMode::Direct,
            separate_metadata: false,
            separate_wal: false,
            encrypted: false,
            key_source: KeySource::None,
        }
    }

    /// Persistent volume topology
    pub fn persistent_volume(activation: ActivationMode) -> Self {
        Self {
            provisioning: ProvisioningMode::PersistentVolume,
            activation,
            ..Self::local_device()
        }
    }

    /// Add a separate metadata volume. Ignored for host devices, which
    /// carry no separate claims.
    pub fn with_separate_metadata(mut self) -> Self {
        self.separate_metadata = self.provisioning == ProvisioningMode::PersistentVolume;
        self
    }

    /// Add a separate WAL volume. Ignored for host devices.
    pub fn with_separate_wal(mut self) -> Self {
        self.separate_wal = self.provisioning == ProvisioningMode::PersistentVolume;
        self
    }

    /// Mark the disk encrypted, with the given key source
    pub fn with_encryption(mut self, key_source: KeySource) -> Self {
        self.encrypted = true;
        self.key_source = key_source;
        self
    }

    /// Provisioning mode
    pub fn provisioning(&self) -> ProvisioningMode {
        self.provisioning
    }

    /// Activation mode
    pub fn activation(&self) -> ActivationMode {
        self.activation
    }

    /// True for persistent volume topologies
    pub fn on_pvc(&self) -> bool {
        self.provisioning == ProvisioningMode::PersistentVolume
    }

    /// Separate metadata volume attached
    pub fn has_separate_metadata_volume(&self) -> bool {
        self.separate_metadata
    }

    /// Separate WAL volume attached
    pub fn has_separate_wal_volume(&self) -> bool {
        self.separate_wal
    }

    /// Disk is encrypted
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Key source
    pub fn key_source(&self) -> &KeySource {
        &self.key_source
    }

    /// Device-open steps coordinate through the host IPC namespace
    pub fn needs_host_ipc(&self) -> bool {
        self.encrypted || self.provisioning == ProvisioningMode::LocalDevice
    }
}

/// Classify daemon properties. Total: properties that passed
/// [`DaemonProperties::validate`] always map to a topology.
pub fn classify(props: &DaemonProperties, kms: Option<&KmsConfig>) -> StorageTopology {
    // Host devices are activated by the volume tool in the activate step,
    // whatever their mode; only claims use the helper launch.
    let mut topology = if props.on_pvc() {
        let activation = match props.volume_tool_mode() {
            "lvm" => ActivationMode::VolumeManager,
            _ => ActivationMode::Direct,
        };
        StorageTopology::persistent_volume(activation)
    } else {
        StorageTopology::local_device()
    };
    if props.metadata_claim.is_some() {
        topology = topology.with_separate_metadata();
    }
    if props.wal_claim.is_some() {
        topology = topology.with_separate_wal();
    }

    if props.encrypted {
        let key_source = match kms {
            None => KeySource::LocalFile,
            Some(kms) => KeySource::RemoteKms {
                provider: match kms.provider_name().as_str() {
                    "vault" => KmsProvider::Vault,
                    other => KmsProvider::Other(other.to_string()),
                },
                auth: match kms.auth_method_name().as_str() {
                    "token" => KmsAuth::Token,
                    other => KmsAuth::Other(other.to_string()),
                },
            },
        };
        topology = topology.with_encryption(key_source);
    }

    topology
}
