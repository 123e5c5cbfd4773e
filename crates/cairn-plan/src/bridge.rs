//! Shared mount points between init steps
//!
//! A bridge is keyed by the claim (or host device) it carries data for, never
//! by the step that uses it. Every step touching the same claim gets the same
//! volume at the same path.

use std::collections::BTreeMap;

use cairn_common::kube_utils::{deterministic_hash, sanitize_dns_label};

use crate::k8s::{Volume, VolumeMount};

/// Mount path for bridges other than the primary one
pub const BRIDGE_ROOT: &str = "/bridges";

const BRIDGE_SUFFIX: &str = "-bridge";
/// Prefix when nothing of the identity survives sanitizing
const FALLBACK_PREFIX: &str = "bridge";
const MAX_VOLUME_NAME: usize = 63;

/// Identity of the storage a bridge carries
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClaimIdentity {
    /// A persistent volume claim, by name
    Claim(String),
    /// A host block device, by path
    Device(String),
}

impl ClaimIdentity {
    /// Stable name: the claim name, or the device path with `/` flattened
    pub fn stable_name(&self) -> String {
        match self {
            ClaimIdentity::Claim(name) => name.clone(),
            ClaimIdentity::Device(path) => path.replace('/', "_"),
        }
    }
}

/// A shared mount between steps
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountBridge {
    /// Pod volume name
    pub volume_name: String,
    /// Path inside every container that mounts it
    pub mount_path: String,
    /// Host directory backing it
    pub host_path: String,
}

impl MountBridge {
    /// Container mount for this bridge
    pub fn mount(&self) -> VolumeMount {
        VolumeMount::new(&self.volume_name, &self.mount_path)
    }

    /// Pod volume for this bridge
    pub fn volume(&self) -> Volume {
        Volume::from_host_path(&self.volume_name, &self.host_path, Some("DirectoryOrCreate"))
    }

    /// Path of a file inside the bridge
    pub fn path_of(&self, file: &str) -> String {
        format!("{}/{}", self.mount_path, file)
    }
}

/// Hands out bridges for one plan build
pub struct BridgeResolver {
    primary: ClaimIdentity,
    data_dir: String,
    host_root: String,
    bridges: BTreeMap<ClaimIdentity, MountBridge>,
}

impl BridgeResolver {
    /// Create a resolver whose primary identity bridges at `data_dir`.
    /// Host directories live under `<config_dir>/<namespace>`.
    pub fn new(
        primary: ClaimIdentity,
        data_dir: impl Into<String>,
        config_dir: &str,
        namespace: &str,
    ) -> Self {
        Self {
            primary,
            data_dir: data_dir.into(),
            host_root: format!("{}/{}", config_dir.trim_end_matches('/'), namespace),
            bridges: BTreeMap::new(),
        }
    }

    /// Bridge for an identity; repeated calls return the identical bridge
    pub fn bridge_for(&mut self, identity: &ClaimIdentity) -> MountBridge {
        if let Some(bridge) = self.bridges.get(identity) {
            return bridge.clone();
        }
        let stable = identity.stable_name();
        let mount_path = if *identity == self.primary {
            self.data_dir.clone()
        } else {
            format!("{}/{}", BRIDGE_ROOT, stable)
        };
        let bridge = MountBridge {
            volume_name: bridge_volume_name(&stable),
            mount_path,
            host_path: format!("{}/{}", self.host_root, stable),
        };
        self.bridges.insert(identity.clone(), bridge.clone());
        bridge
    }

    /// Bridge for the primary identity
    pub fn primary_bridge(&mut self) -> MountBridge {
        let primary = self.primary.clone();
        self.bridge_for(&primary)
    }

    /// Volumes for exactly the bridges handed out so far
    pub fn volumes(&self) -> Vec<Volume> {
        self.bridges.values().map(MountBridge::volume).collect()
    }
}

fn bridge_volume_name(stable: &str) -> String {
    let base = sanitize_dns_label(stable);
    let name = format!("{}{}", base, BRIDGE_SUFFIX);
    if !base.is_empty() && name.len() <= MAX_VOLUME_NAME && base == stable {
        return name;
    }
    // Sanitizing or truncating can merge distinct identities; the hash keeps them apart
    let hash = deterministic_hash(stable);
    let keep = MAX_VOLUME_NAME - BRIDGE_SUFFIX.len() - hash.len() - 1;
    let prefix = match base[..base.len().min(keep)].trim_end_matches('-') {
        "" => FALLBACK_PREFIX,
        prefix => prefix,
    };
    format!("{}-{}{}", prefix, hash, BRIDGE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> BridgeResolver {
        BridgeResolver::new(
            ClaimIdentity::Claim("set1-data-0".to_string()),
            "/var/lib/ceph/osd/ceph-0",
            "/var/lib/cairn/",
            "storage",
        )
    }

    /// Story: every step asking for the data claim gets the same bridge
    #[test]
    fn story_bridges_are_memoized_per_identity() {
        let mut resolver = resolver();
        let data = ClaimIdentity::Claim("set1-data-0".to_string());

        let first = resolver.bridge_for(&data);
        let second = resolver.bridge_for(&data);
        assert_eq!(first, second);
        assert_eq!(first.volume_name, "set1-data-0-bridge");
        assert_eq!(first.mount_path, "/var/lib/ceph/osd/ceph-0");
        assert_eq!(first.host_path, "/var/lib/cairn/storage/set1-data-0");
        assert_eq!(first.path_of("block"), "/var/lib/ceph/osd/ceph-0/block");

        assert_eq!(resolver.volumes().len(), 1);
    }

    #[test]
    fn test_secondary_identity_bridges_elsewhere() {
        let mut resolver = resolver();
        let meta = resolver.bridge_for(&ClaimIdentity::Claim("set1-meta-0".to_string()));
        assert_eq!(meta.mount_path, "/bridges/set1-meta-0");
        assert_eq!(meta.volume_name, "set1-meta-0-bridge");
        assert_ne!(meta, resolver.primary_bridge());
        assert_eq!(resolver.volumes().len(), 2);
    }

    #[test]
    fn test_device_identity_is_flattened() {
        let mut resolver = BridgeResolver::new(
            ClaimIdentity::Device("/dev/sdb".to_string()),
            "/var/lib/ceph/osd/ceph-4",
            "/var/lib/cairn",
            "storage",
        );
        let bridge = resolver.primary_bridge();
        assert_eq!(bridge.host_path, "/var/lib/cairn/storage/_dev_sdb");
        assert!(bridge.volume_name.starts_with("dev-sdb-"));
        assert!(bridge.volume_name.ends_with("-bridge"));

        let volume = bridge.volume();
        let host = volume.host_path.unwrap();
        assert_eq!(host.type_.as_deref(), Some("DirectoryOrCreate"));
    }

    #[test]
    fn test_long_names_are_hashed_and_bounded() {
        let long = "x".repeat(80);
        let a = bridge_volume_name(&long);
        let b = bridge_volume_name(&format!("{}y", long));
        assert!(a.len() <= MAX_VOLUME_NAME);
        assert_ne!(a, b);
        assert_eq!(a, bridge_volume_name(&long));
    }

    #[test]
    fn test_identity_with_no_usable_characters_gets_valid_name() {
        let root = bridge_volume_name(&ClaimIdentity::Device("/".to_string()).stable_name());
        let empty = bridge_volume_name("");
        for name in [&root, &empty] {
            assert!(name.starts_with("bridge-"), "{name}");
            assert!(name.ends_with(BRIDGE_SUFFIX));
            assert!(name.len() <= MAX_VOLUME_NAME);
        }
        assert_ne!(root, empty);
    }

    #[test]
    fn test_no_volumes_before_any_bridge() {
        assert!(resolver().volumes().is_empty());
    }
}
