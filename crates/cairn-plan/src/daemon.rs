//! Volumes, environment and flags shared by every storage daemon pod

use crate::k8s::{EnvVar, ResourceRequirements, Volume, VolumeMount};
use crate::properties::ClusterContext;
use crate::step::PipelineStep;

/// ConfigMap holding the operator-rendered config override
pub const CONFIG_OVERRIDE_VOLUME: &str = "cairn-config-override";
/// Where daemons read their config
pub const ETC_CEPH_DIR: &str = "/etc/ceph";
/// Log volume
pub const LOG_VOLUME: &str = "cairn-ceph-log";
/// Log directory inside containers
pub const LOG_DIR: &str = "/var/log/ceph";
/// Crash volume
pub const CRASH_VOLUME: &str = "cairn-ceph-crash";
/// Crash dump directory inside containers
pub const CRASH_DIR: &str = "/var/lib/ceph/crash";
/// Host udev database
pub const UDEV_VOLUME: &str = "run-udev";
/// Host device-mapper nodes
pub const DEV_MAPPER_VOLUME: &str = "dev-mapper";
/// Device-mapper node directory
pub const DEV_MAPPER_DIR: &str = "/dev/mapper";
/// Host /dev
pub const DEVICES_VOLUME: &str = "devices";
/// Secret carrying cluster connection info
pub const CONFIG_SECRET: &str = "cairn-ceph-config";

const MON_HOST_ENV: &str = "CAIRN_CEPH_MON_HOST";

/// Volumes of a pod, deduplicated by name in insertion order
#[derive(Clone, Debug, Default)]
pub struct VolumeSet {
    volumes: Vec<Volume>,
}

impl VolumeSet {
    /// Add a volume unless one with the same name is present
    pub fn add(&mut self, volume: Volume) {
        if !self.contains(&volume.name) {
            self.volumes.push(volume);
        }
    }

    /// Add several volumes
    pub fn extend(&mut self, volumes: impl IntoIterator<Item = Volume>) {
        for volume in volumes {
            self.add(volume);
        }
    }

    /// True when a volume with this name is present
    pub fn contains(&self, name: &str) -> bool {
        self.volumes.iter().any(|v| v.name == name)
    }

    /// The volumes
    pub fn into_vec(self) -> Vec<Volume> {
        self.volumes
    }
}

/// Log and crash volumes: host directories under the data dir host path
/// when one is configured, emptyDirs otherwise
pub fn log_and_crash_volumes(cluster: &ClusterContext) -> Vec<Volume> {
    match &cluster.data_dir_host_path {
        Some(root) => {
            let root = format!("{}/{}", root.trim_end_matches('/'), cluster.namespace);
            vec![
                Volume::from_host_path(LOG_VOLUME, format!("{}/log", root), None),
                Volume::from_host_path(CRASH_VOLUME, format!("{}/crash", root), None),
            ]
        }
        None => vec![
            Volume::from_empty_dir(LOG_VOLUME, None),
            Volume::from_empty_dir(CRASH_VOLUME, None),
        ],
    }
}

/// Mounts for the log and crash volumes
pub fn log_and_crash_mounts() -> Vec<VolumeMount> {
    vec![
        VolumeMount::new(LOG_VOLUME, LOG_DIR),
        VolumeMount::new(CRASH_VOLUME, CRASH_DIR),
    ]
}

/// Config override volume
pub fn config_override_volume() -> Volume {
    Volume::from_config_map(CONFIG_OVERRIDE_VOLUME, CONFIG_OVERRIDE_VOLUME)
}

/// Read-only config override mount
pub fn config_override_mount() -> VolumeMount {
    VolumeMount::read_only(CONFIG_OVERRIDE_VOLUME, ETC_CEPH_DIR)
}

/// Host udev volume and mount; the daemon reports device metadata from it
pub fn udev() -> (Volume, VolumeMount) {
    (
        Volume::from_host_path(UDEV_VOLUME, "/run/udev", None),
        VolumeMount::new(UDEV_VOLUME, "/run/udev"),
    )
}

/// Host device-mapper volume and mount
pub fn device_mapper() -> (Volume, VolumeMount) {
    (
        Volume::from_host_path(DEV_MAPPER_VOLUME, DEV_MAPPER_DIR, Some("Directory")),
        VolumeMount::new(DEV_MAPPER_VOLUME, DEV_MAPPER_DIR),
    )
}

/// Host /dev volume and mount
pub fn host_devices() -> (Volume, VolumeMount) {
    (
        Volume::from_host_path(DEVICES_VOLUME, "/dev", None),
        VolumeMount::new(DEVICES_VOLUME, "/dev"),
    )
}

/// Environment every daemon needs to reach the monitors
pub fn cluster_env(cluster: &ClusterContext) -> Vec<EnvVar> {
    vec![
        EnvVar::literal("CAIRN_CLUSTER_FSID", &cluster.fsid),
        EnvVar::from_secret(MON_HOST_ENV, CONFIG_SECRET, "mon_host"),
        EnvVar::literal("CEPH_ARGS", format!("-m $({})", MON_HOST_ENV)),
    ]
}

/// Daemon logging goes to stderr only
pub fn logging_flags() -> Vec<String> {
    [
        "--log-to-stderr=true",
        "--err-to-stderr=true",
        "--mon-cluster-log-to-stderr=true",
        "--log-stderr-prefix=debug ",
        "--default-log-to-file=false",
        "--default-mon-cluster-log-to-file=false",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Network flags that depend on the cluster address family
pub fn network_flags(cluster: &ClusterContext) -> Vec<String> {
    if cluster.ipv6 {
        vec!["--ms-bind-ipv6=true".to_string()]
    } else {
        Vec::new()
    }
}

/// Recursive ownership fix for daemon directories. Always the last init
/// step, so the daemon never starts on files an earlier step created as
/// another user.
pub fn chown_step(
    image: &str,
    dirs: &[&str],
    mounts: Vec<VolumeMount>,
    resources: &ResourceRequirements,
) -> PipelineStep {
    let mut args = vec![
        "--verbose".to_string(),
        "--recursive".to_string(),
        "ceph:ceph".to_string(),
    ];
    args.extend(dirs.iter().map(|d| d.to_string()));
    PipelineStep::new("chown-container-data-dir", image)
        .with_command(["chown"])
        .with_args(args)
        .with_mounts(mounts)
        .with_resources(resources)
        .privileged()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::tests::cluster;

    #[test]
    fn test_log_volumes_follow_host_path_setting() {
        let mut cluster = cluster();
        let volumes = log_and_crash_volumes(&cluster);
        assert!(volumes.iter().all(|v| v.empty_dir.is_some()));

        cluster.data_dir_host_path = Some("/var/lib/cairn/".to_string());
        let volumes = log_and_crash_volumes(&cluster);
        let log = volumes[0].host_path.as_ref().unwrap();
        assert_eq!(log.path, "/var/lib/cairn/storage/log");
    }

    #[test]
    fn test_volume_set_dedupes() {
        let mut set = VolumeSet::default();
        set.add(udev().0);
        set.add(udev().0);
        set.extend([device_mapper().0, udev().0]);
        let names: Vec<_> = set.into_vec().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["run-udev", "dev-mapper"]);
    }

    #[test]
    fn test_ipv6_flag() {
        let mut cluster = cluster();
        assert!(network_flags(&cluster).is_empty());
        cluster.ipv6 = true;
        assert_eq!(network_flags(&cluster), vec!["--ms-bind-ipv6=true"]);
    }

    #[test]
    fn test_cluster_env_reads_mon_host_from_secret() {
        let env = cluster_env(&cluster());
        let mon = env.iter().find(|e| e.name == "CAIRN_CEPH_MON_HOST").unwrap();
        let selector = mon.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(selector.name, CONFIG_SECRET);
        assert_eq!(
            env.iter().find(|e| e.name == "CEPH_ARGS").unwrap().value.as_deref(),
            Some("-m $(CAIRN_CEPH_MON_HOST)")
        );
    }
}
