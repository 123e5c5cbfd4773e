//! Plan for the singleton rbd-mirror daemon

use std::collections::BTreeMap;

use cairn_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::daemon::{
    chown_step, cluster_env, config_override_mount, config_override_volume,
    log_and_crash_mounts, log_and_crash_volumes, logging_flags, network_flags, CRASH_DIR,
    LOG_DIR,
};
use crate::k8s::{parse_quantity_bytes, ResourceRequirements, Volume, VolumeMount};
use crate::plan::{DaemonClass, ExecutionPlan, PodSettings};
use crate::properties::ClusterContext;
use crate::step::PipelineStep;

/// Smallest memory limit or request the daemon runs with
pub const RBD_MIRROR_MIN_MEMORY: &str = "512Mi";

const KEYRING_DIR: &str = "/etc/ceph/keyring-store";
const KEYRING_VOLUME: &str = "cairn-rbd-mirror-keyring";

/// Desired rbd-mirror settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSpec {
    /// Resources for the daemon
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Priority class
    #[serde(default)]
    pub priority_class_name: Option<String>,
}

/// Reject a memory limit or request below `minimum`. Unset values pass.
pub fn check_pod_memory(daemon: &str, resources: &ResourceRequirements, minimum: &str) -> Result<()> {
    let min_bytes = parse_quantity_bytes(minimum)
        .ok_or_else(|| Error::internal_with_context(daemon, format!("bad memory quantity '{}'", minimum)))?;

    let checks = [
        ("resources.limits.memory", resources.memory_limit_bytes()),
        ("resources.requests.memory", resources.memory_request_bytes()),
    ];
    for (field, value) in checks {
        if let Some(bytes) = value {
            if bytes < min_bytes {
                return Err(Error::validation_for_field(
                    daemon,
                    field,
                    format!("{} bytes is below the {} minimum", bytes, minimum),
                ));
            }
        }
    }
    Ok(())
}

/// Keyring secret name of a mirror instance
pub fn keyring_secret_name(ordinal: u32) -> String {
    format!("{}-keyring", DaemonClass::RbdMirror.resource_name(ordinal))
}

/// Plan for the canonical mirror instance (ordinal 0, named `a`)
pub fn mirror_plan(cluster: &ClusterContext, spec: &MirrorSpec) -> Result<ExecutionPlan> {
    let class = DaemonClass::RbdMirror;
    let ordinal = 0;
    let entity = class.credential_entity(ordinal);
    check_pod_memory(&entity, &spec.resources, RBD_MIRROR_MIN_MEMORY)?;

    let mut mounts = vec![config_override_mount()];
    mounts.extend(log_and_crash_mounts());
    mounts.push(VolumeMount::read_only(KEYRING_VOLUME, KEYRING_DIR));

    let mut args = vec![
        "--foreground".to_string(),
        "-n".to_string(),
        entity.clone(),
        format!("--keyring={}/keyring", KEYRING_DIR),
    ];
    args.extend(logging_flags());
    args.extend(network_flags(cluster));

    let daemon = PipelineStep::new("rbd-mirror", &cluster.ceph_image)
        .with_command(["rbd-mirror"])
        .with_args(args)
        .with_env(cluster_env(cluster))
        .with_mounts(mounts)
        .with_resources(&spec.resources)
        .with_working_dir(LOG_DIR);

    let chown = chown_step(
        &cluster.ceph_image,
        &[LOG_DIR, CRASH_DIR],
        log_and_crash_mounts(),
        &spec.resources,
    );

    let mut volumes = log_and_crash_volumes(cluster);
    volumes.push(config_override_volume());
    volumes.push(Volume::from_secret(KEYRING_VOLUME, keyring_secret_name(ordinal)));

    let plan = ExecutionPlan {
        class,
        ordinal,
        namespace: cluster.namespace.clone(),
        steps: vec![chown],
        daemon,
        volumes,
        pod: PodSettings {
            host_network: cluster.host_network,
            priority_class_name: spec.priority_class_name.clone(),
            ..Default::default()
        },
        extra_labels: BTreeMap::new(),
    };
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ResourceQuantity;
    use crate::properties::tests::cluster;

    fn memory(limit: Option<&str>, request: Option<&str>) -> ResourceRequirements {
        let quantity = |m: Option<&str>| {
            m.map(|m| ResourceQuantity {
                cpu: None,
                memory: Some(m.to_string()),
            })
        };
        ResourceRequirements {
            limits: quantity(limit),
            requests: quantity(request),
        }
    }

    #[test]
    fn test_memory_floor() {
        assert!(check_pod_memory("client.rbd-mirror.a", &ResourceRequirements::default(), "512Mi").is_ok());
        assert!(check_pod_memory("client.rbd-mirror.a", &memory(Some("1Gi"), Some("512Mi")), "512Mi").is_ok());

        let err = check_pod_memory("client.rbd-mirror.a", &memory(Some("256Mi"), None), "512Mi").unwrap_err();
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("resources.limits.memory"))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(check_pod_memory("client.rbd-mirror.a", &memory(None, Some("100Mi")), "512Mi").is_err());
    }

    /// Story: the canonical mirror is instance `a` with its own keyring
    #[test]
    fn story_canonical_mirror_plan() {
        let plan = mirror_plan(&cluster(), &MirrorSpec::default()).unwrap();
        assert_eq!(plan.name(), "cairn-rbd-mirror-a");
        assert_eq!(plan.selector().get("rbd-mirror").map(String::as_str), Some("a"));
        assert_eq!(plan.step_names(), vec!["chown-container-data-dir"]);
        assert_eq!(
            &plan.daemon.args[..4],
            &[
                "--foreground",
                "-n",
                "client.rbd-mirror.a",
                "--keyring=/etc/ceph/keyring-store/keyring"
            ]
        );
        let keyring = plan
            .volumes
            .iter()
            .find(|v| v.name == KEYRING_VOLUME)
            .and_then(|v| v.secret.as_ref())
            .unwrap();
        assert_eq!(keyring.secret_name, "cairn-rbd-mirror-a-keyring");
        assert!(plan.to_deployment().is_ok());
    }
}
