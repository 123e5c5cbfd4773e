//! Container pipeline synthesis for OSD daemons
//!
//! Steps are emitted in a fixed phase order:
//!
//! 1. `config-init` and 2. `copy-bins` for volume-manager activation
//! 3. device-to-bridge copies of each claim
//! 4. key retrieval, device opens and mapped-device copies when encrypted
//! 5. activation and bluefs expansion
//! 6. `chown-container-data-dir`, always last
//!
//! followed by the terminal `osd` container.

use std::collections::BTreeMap;

use cairn_common::{Error, Result};
use tracing::{debug, instrument};

use crate::bridge::{BridgeResolver, ClaimIdentity, MountBridge};
use crate::daemon::{
    chown_step, cluster_env, config_override_mount, config_override_volume, device_mapper,
    host_devices, log_and_crash_mounts, log_and_crash_volumes, logging_flags, network_flags,
    udev, VolumeSet, CRASH_DIR, DEV_MAPPER_DIR, LOG_DIR,
};
use crate::k8s::{EnvVar, Volume, VolumeDevice, VolumeMount};
use crate::keyflow::KeyFlow;
use crate::plan::{DaemonClass, ExecutionPlan, PodSettings};
use crate::properties::{ClusterContext, DaemonProperties, DeviceTuning};
use crate::scripts::{ACTIVATE_OSD, BLOCK_DEV_MAPPER};
use crate::step::PipelineStep;
use crate::topology::{classify, ActivationMode, StorageTopology};

/// Prefix of the per-OSD data directory
pub const OSD_DATA_DIR_PREFIX: &str = "/var/lib/ceph/osd/ceph-";
/// Volume the helper binaries are staged into
pub const BINARIES_VOLUME: &str = "cairn-binaries";
/// Mount path of the staged binaries
pub const BINARIES_DIR: &str = "/cairn";
/// Volume holding the config rendered by `config-init`
pub const RENDERED_CONFIG_VOLUME: &str = "cairn-config";
/// Mount path of the rendered config
pub const RENDERED_CONFIG_DIR: &str = "/var/lib/cairn/config";

/// Label carrying the data claim of a PVC-backed daemon
pub const LABEL_PVC: &str = "cairn.io/pvc";
/// Label carrying the device set of a PVC-backed daemon
pub const LABEL_DEVICE_SET: &str = "cairn.io/device-set";
const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

const FAST_TUNING: &[&str] = &[
    "--osd-op-num-threads-per-shard=2",
    "--osd-op-num-shards=8",
    "--osd-recovery-sleep=0",
    "--osd-snap-trim-sleep=0",
    "--osd-delete-sleep=0",
    "--bluestore-min-alloc-size=4096",
    "--bluestore-prefer-deferred-size=0",
    "--bluestore-compression-min-blob-size=8912",
    "--bluestore-compression-max-blob-size=65536",
    "--bluestore-max-blob-size=65536",
    "--bluestore-cache-size=3221225472",
    "--bluestore-throttle-cost-per-io=4000",
    "--bluestore-deferred-batch-ops=16",
];

const SLOW_TUNING: &[&str] = &[
    "--osd-recovery-sleep=0.1",
    "--osd-snap-trim-sleep=2",
    "--osd-delete-sleep=2",
];

/// Data directory of an OSD
pub fn osd_data_dir(id: u32) -> String {
    format!("{}{}", OSD_DATA_DIR_PREFIX, id)
}

/// One of the bluestore devices a daemon may carry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeviceKind {
    Block,
    Metadata,
    Wal,
}

impl DeviceKind {
    fn file(&self) -> &'static str {
        match self {
            DeviceKind::Block => "block",
            DeviceKind::Metadata => "block.db",
            DeviceKind::Wal => "block.wal",
        }
    }

    fn staging_file(&self) -> String {
        format!("{}-tmp", self.file())
    }

    fn dm_name(&self, claim: &str) -> String {
        let suffix = match self {
            DeviceKind::Block => "block",
            DeviceKind::Metadata => "db",
            DeviceKind::Wal => "wal",
        };
        format!("{}-{}-dmcrypt", claim, suffix)
    }

    fn step_name(&self, base: &str) -> String {
        match self {
            DeviceKind::Block => base.to_string(),
            DeviceKind::Metadata => format!("{}-metadata", base),
            DeviceKind::Wal => format!("{}-wal", base),
        }
    }
}

/// A claim and the bluestore device it backs
struct AttachedClaim {
    kind: DeviceKind,
    claim: String,
}

impl AttachedClaim {
    fn device_path(&self) -> String {
        format!("/{}", self.claim)
    }
}

/// Builds the execution plan of one OSD
pub struct ContainerPipelineBuilder<'a> {
    cluster: &'a ClusterContext,
    props: &'a DaemonProperties,
}

impl<'a> ContainerPipelineBuilder<'a> {
    /// Create a builder for one daemon
    pub fn new(cluster: &'a ClusterContext, props: &'a DaemonProperties) -> Self {
        Self { cluster, props }
    }

    /// Validate the properties, classify them and build the plan
    pub fn build(&self) -> Result<ExecutionPlan> {
        self.props.validate(self.cluster.kms.as_ref())?;
        let topology = classify(self.props, self.cluster.kms.as_ref());
        build_plan(self.cluster, &topology, self.props)
    }
}

/// Build the plan for an already classified topology. The properties carry
/// the daemon identity and its resources.
#[instrument(skip_all, fields(daemon = %props.daemon_name()))]
pub fn build_plan(
    cluster: &ClusterContext,
    topology: &StorageTopology,
    props: &DaemonProperties,
) -> Result<ExecutionPlan> {
    let daemon = props.daemon_name();
    let claims = attached_claims(topology, props)?;
    let data_dir = osd_data_dir(props.id);

    let primary = match claims.first() {
        Some(data) => ClaimIdentity::Claim(data.claim.clone()),
        None => ClaimIdentity::Device(props.block_path.clone()),
    };
    let resolver = BridgeResolver::new(primary, &data_dir, &cluster.config_dir, &cluster.namespace);

    let mut pipeline = Pipeline {
        cluster,
        topology,
        props,
        daemon,
        data_dir,
        resolver,
        steps: Vec::new(),
        volumes: VolumeSet::default(),
    };

    pipeline.volume_manager_setup();
    pipeline.copy_claims(&claims)?;
    if topology.on_pvc() && topology.encrypted() {
        pipeline.open_encrypted(&claims)?;
    }
    pipeline.activate()?;

    let daemon_mounts = pipeline.daemon_mounts();
    let chown = chown_step(
        &cluster.ceph_image,
        &[LOG_DIR, CRASH_DIR, pipeline.data_dir.as_str()],
        daemon_mounts.clone(),
        &props.resources,
    );
    pipeline.steps.push(chown);
    let container = pipeline.daemon_container(daemon_mounts);

    let plan = pipeline.finish(container, &claims);
    plan.validate()?;
    debug!(steps = ?plan.step_names(), "built execution plan");
    Ok(plan)
}

/// Claims in device order (data, metadata, WAL). Empty for host devices.
fn attached_claims(topology: &StorageTopology, props: &DaemonProperties) -> Result<Vec<AttachedClaim>> {
    if !topology.on_pvc() {
        return Ok(Vec::new());
    }
    let daemon = props.daemon_name();
    let required = |claim: &Option<String>, what: &str| {
        claim
            .clone()
            .ok_or_else(|| Error::plan_build(&daemon, format!("missing required {} claim", what)))
    };

    let mut claims = vec![AttachedClaim {
        kind: DeviceKind::Block,
        claim: required(&props.data_claim, "data")?,
    }];
    if topology.has_separate_metadata_volume() {
        claims.push(AttachedClaim {
            kind: DeviceKind::Metadata,
            claim: required(&props.metadata_claim, "metadata")?,
        });
    }
    if topology.has_separate_wal_volume() {
        claims.push(AttachedClaim {
            kind: DeviceKind::Wal,
            claim: required(&props.wal_claim, "wal")?,
        });
    }
    Ok(claims)
}

struct Pipeline<'a> {
    cluster: &'a ClusterContext,
    topology: &'a StorageTopology,
    props: &'a DaemonProperties,
    daemon: String,
    data_dir: String,
    resolver: BridgeResolver,
    steps: Vec<PipelineStep>,
    volumes: VolumeSet,
}

impl Pipeline<'_> {
    fn uses_volume_manager(&self) -> bool {
        self.topology.activation() == ActivationMode::VolumeManager
    }

    fn rendered_config_mount() -> VolumeMount {
        VolumeMount::new(RENDERED_CONFIG_VOLUME, RENDERED_CONFIG_DIR)
    }

    fn binaries_mount() -> VolumeMount {
        VolumeMount::new(BINARIES_VOLUME, BINARIES_DIR)
    }

    fn identity_env(&self) -> Vec<EnvVar> {
        vec![
            EnvVar::literal("CAIRN_OSD_ID", self.props.id.to_string()),
            EnvVar::literal("CAIRN_OSD_UUID", &self.props.uuid),
        ]
    }

    fn volume_manager_setup(&mut self) {
        if !self.uses_volume_manager() {
            return;
        }
        let image = &self.cluster.operator_image;

        let mut env = self.identity_env();
        env.push(EnvVar::literal("CAIRN_CONFIG_DIR", RENDERED_CONFIG_DIR));
        env.extend(cluster_env(self.cluster));
        let config_init = PipelineStep::new("config-init", image)
            .with_args(["ceph", "osd", "init"])
            .with_env(env)
            .with_mount(config_override_mount())
            .with_mount(Self::rendered_config_mount())
            .with_mounts(log_and_crash_mounts())
            .with_resources(&self.props.resources);

        let copy_bins = PipelineStep::new("copy-bins", image)
            .with_args(["copy-binaries", "--copy-to-dir", BINARIES_DIR])
            .with_mount(Self::binaries_mount())
            .with_resources(&self.props.resources);

        self.steps.push(config_init);
        self.steps.push(copy_bins);
        self.volumes.add(Volume::from_empty_dir(RENDERED_CONFIG_VOLUME, None));
        self.volumes.add(Volume::from_empty_dir(BINARIES_VOLUME, None));
    }

    fn copy_step(&self, name: &str, source: &str, dest: &str, bridge: &MountBridge) -> Result<PipelineStep> {
        let command = BLOCK_DEV_MAPPER
            .render(&[("PVC_SOURCE", source), ("PVC_DEST", dest)])
            .map_err(|e| Error::plan_build(&self.daemon, e.to_string()))?;
        Ok(PipelineStep::new(name, &self.cluster.ceph_image)
            .with_command(command)
            .with_mount(bridge.mount())
            .with_resources(&self.props.resources))
    }

    fn copy_claims(&mut self, claims: &[AttachedClaim]) -> Result<()> {
        if claims.is_empty() {
            return Ok(());
        }
        let bridge = self.resolver.primary_bridge();
        for attached in claims {
            let file = if self.topology.encrypted() {
                attached.kind.staging_file()
            } else {
                attached.kind.file().to_string()
            };
            let step = self
                .copy_step(
                    &attached.kind.step_name("blkdevmapper"),
                    &attached.device_path(),
                    &bridge.path_of(&file),
                    &bridge,
                )?
                .with_device(VolumeDevice::new(&attached.claim, attached.device_path()));
            self.steps.push(step);
            self.volumes.add(Volume::from_pvc(&attached.claim, &attached.claim));
        }
        Ok(())
    }

    fn open_encrypted(&mut self, claims: &[AttachedClaim]) -> Result<()> {
        let data_claim = &claims[0].claim;
        let bridge = self.resolver.primary_bridge();
        let (dm_volume, dm_mount) = device_mapper();

        let mut flow = KeyFlow::new(
            &self.daemon,
            data_claim,
            self.topology.key_source(),
            self.cluster.kms.as_ref(),
            &self.cluster.ceph_image,
            &self.props.resources,
            claims.len(),
        );
        self.steps.push(flow.request()?);

        for attached in claims {
            let step = flow.open(
                &attached.kind.step_name("encryption-open"),
                &bridge.path_of(&attached.kind.staging_file()),
                &attached.kind.dm_name(&attached.claim),
                &bridge,
            )?;
            self.steps.push(step);
        }
        flow.finish()?;

        for attached in claims {
            let mapped = format!("{}/{}", DEV_MAPPER_DIR, attached.kind.dm_name(&attached.claim));
            let step = self
                .copy_step(
                    &format!("{}-encryption", attached.kind.step_name("blkdevmapper")),
                    &mapped,
                    &bridge.path_of(attached.kind.file()),
                    &bridge,
                )?
                .with_mount(dm_mount.clone())
                .privileged();
            self.steps.push(step);
        }

        let data_dm = DeviceKind::Block.dm_name(data_claim);
        self.steps.push(
            PipelineStep::new("encrypted-block-status", &self.cluster.ceph_image)
                .with_command(["cryptsetup"])
                .with_args(["--verbose", "status", data_dm.as_str()])
                .with_mount(bridge.mount())
                .with_mount(dm_mount)
                .with_resources(&self.props.resources)
                .privileged(),
        );

        self.volumes.add(dm_volume);
        self.volumes.extend(flow.volumes());
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        if self.topology.on_pvc() {
            self.activate_pvc();
            Ok(())
        } else {
            self.activate_local_device()
        }
    }

    fn activate_pvc(&mut self) {
        let bridge = self.resolver.primary_bridge();
        let image = &self.cluster.ceph_image;
        let resources = &self.props.resources;

        if self.topology.encrypted() {
            if let Some(claim) = &self.props.data_claim {
                let data_dm = DeviceKind::Block.dm_name(claim);
                self.steps.push(
                    PipelineStep::new("expand-encrypted-bluefs", image)
                        .with_command(["cryptsetup"])
                        .with_args(["--verbose", "resize", data_dm.as_str()])
                        .with_mount(bridge.mount())
                        .with_mount(device_mapper().1)
                        .with_resources(resources)
                        .privileged(),
                );
            }
        }

        let block = bridge.path_of(DeviceKind::Block.file());
        self.steps.push(
            PipelineStep::new("activate", image)
                .with_command(["ceph-bluestore-tool"])
                .with_args([
                    "prime-osd-dir",
                    "--dev",
                    block.as_str(),
                    "--path",
                    self.data_dir.as_str(),
                    "--no-mon-config",
                ])
                .with_mount(bridge.mount())
                .with_resources(resources)
                .privileged(),
        );
        self.steps.push(
            PipelineStep::new("expand-bluefs", image)
                .with_command(["ceph-bluestore-tool"])
                .with_args(["bluefs-bdev-expand", "--path", self.data_dir.as_str()])
                .with_mount(bridge.mount())
                .with_resources(resources)
                .privileged(),
        );
    }

    fn activate_local_device(&mut self) -> Result<()> {
        let bridge = self.resolver.primary_bridge();
        let (devices_volume, devices_mount) = host_devices();
        let id = self.props.id.to_string();
        let command = ACTIVATE_OSD
            .render(&[
                ("OSD_ID", id.as_str()),
                ("OSD_UUID", self.props.uuid.as_str()),
                ("CV_MODE", self.props.volume_tool_mode()),
                ("DEVICE", self.props.block_path.as_str()),
                ("METADATA_DEVICE", self.props.metadata_device.as_deref().unwrap_or_default()),
                ("WAL_DEVICE", self.props.wal_device.as_deref().unwrap_or_default()),
            ])
            .map_err(|e| Error::plan_build(&self.daemon, e.to_string()))?;

        self.steps.push(
            PipelineStep::new("activate", &self.cluster.ceph_image)
                .with_command(command)
                .with_env(cluster_env(self.cluster))
                .with_mount(bridge.mount())
                .with_mount(devices_mount)
                .with_mount(config_override_mount())
                .with_resources(&self.props.resources)
                .privileged(),
        );
        self.volumes.add(devices_volume);
        Ok(())
    }

    fn daemon_mounts(&mut self) -> Vec<VolumeMount> {
        let mut mounts = vec![config_override_mount()];
        mounts.extend(log_and_crash_mounts());
        mounts.push(udev().1);
        if self.topology.encrypted() {
            mounts.push(device_mapper().1);
        }
        if !self.topology.on_pvc() {
            mounts.push(host_devices().1);
        }
        if self.uses_volume_manager() {
            mounts.push(Self::binaries_mount());
            mounts.push(Self::rendered_config_mount());
        }
        mounts.push(self.resolver.primary_bridge().mount());
        mounts
    }

    fn daemon_args(&self) -> Vec<String> {
        let props = self.props;
        let mut args = vec![
            "--foreground".to_string(),
            "--id".to_string(),
            props.id.to_string(),
            "--fsid".to_string(),
            self.cluster.fsid.clone(),
            "--setuser".to_string(),
            "ceph".to_string(),
            "--setgroup".to_string(),
            "ceph".to_string(),
            format!("--crush-location={}", props.location),
        ];
        if self.topology.on_pvc() {
            let tuning: &[&str] = match props.tuning {
                DeviceTuning::Fast => FAST_TUNING,
                DeviceTuning::Slow => SLOW_TUNING,
                DeviceTuning::None => &[],
            };
            args.extend(tuning.iter().map(|f| f.to_string()));
        }
        args.extend(logging_flags());
        args.extend(network_flags(self.cluster));
        args
    }

    fn daemon_env(&self) -> Vec<EnvVar> {
        let props = self.props;
        let mut env = cluster_env(self.cluster);
        env.extend(self.identity_env());
        env.push(EnvVar::literal("CAIRN_BLOCK_PATH", &props.block_path));
        env.push(EnvVar::literal(
            "CAIRN_CV_MODE",
            self.props.volume_tool_mode(),
        ));
        env.push(EnvVar::literal("TINI_SUBREAPER", ""));
        if self.topology.on_pvc() {
            env.push(EnvVar::literal("CAIRN_PVC_BACKED_OSD", "true"));
            if let Some(size) = &props.pvc_size {
                env.push(EnvVar::literal("CAIRN_OSD_PVC_SIZE", size));
            }
            if props.portable {
                if let Some(affinity) = &props.topology_affinity {
                    env.push(EnvVar::literal("CAIRN_TOPOLOGY_AFFINITY", affinity));
                }
            }
            if self.uses_volume_manager() {
                env.push(EnvVar::literal("CAIRN_LV_BACKED_PV", props.lv_backed_pv.to_string()));
            }
        }
        if self.uses_volume_manager() {
            env.push(EnvVar::literal("CAIRN_CONFIG_DIR", RENDERED_CONFIG_DIR));
        }
        env
    }

    fn daemon_container(&self, mounts: Vec<VolumeMount>) -> PipelineStep {
        let image = &self.cluster.ceph_image;
        let args = self.daemon_args();
        let step = if self.uses_volume_manager() {
            let mut launcher = vec![
                "--".to_string(),
                format!("{}/cairn", BINARIES_DIR),
                "osd".to_string(),
                "start".to_string(),
                "--".to_string(),
            ];
            launcher.extend(args);
            PipelineStep::new("osd", image)
                .with_command([format!("{}/tini", BINARIES_DIR)])
                .with_args(launcher)
        } else {
            PipelineStep::new("osd", image)
                .with_command(["ceph-osd"])
                .with_args(args)
        };
        step.with_env(self.daemon_env())
            .with_mounts(mounts)
            .with_resources(&self.props.resources)
            .with_working_dir(LOG_DIR)
            .privileged()
    }

    fn finish(mut self, daemon: PipelineStep, claims: &[AttachedClaim]) -> ExecutionPlan {
        let props = self.props;

        self.volumes.extend(log_and_crash_volumes(self.cluster));
        self.volumes.add(config_override_volume());
        self.volumes.add(udev().0);
        if self.topology.encrypted() {
            self.volumes.add(device_mapper().0);
        }
        self.volumes.extend(self.resolver.volumes());

        let mut node_selector = BTreeMap::new();
        if !props.portable {
            node_selector.insert(LABEL_HOSTNAME.to_string(), props.crush_hostname.clone());
        }

        let mut extra_labels = BTreeMap::new();
        if let Some(data) = claims.first() {
            extra_labels.insert(LABEL_PVC.to_string(), data.claim.clone());
            if let Some(set) = &props.device_set {
                extra_labels.insert(LABEL_DEVICE_SET.to_string(), set.clone());
            }
        }

        ExecutionPlan {
            class: DaemonClass::Osd,
            ordinal: props.id,
            namespace: self.cluster.namespace.clone(),
            steps: self.steps,
            daemon,
            volumes: self.volumes.into_vec(),
            pod: PodSettings {
                host_network: self.cluster.host_network,
                host_pid: self.cluster.host_pid,
                host_ipc: self.topology.needs_host_ipc(),
                priority_class_name: self.cluster.osd_priority_class_name.clone(),
                scheduler_name: props.scheduler_name.clone(),
                node_selector,
            },
            extra_labels,
        }
    }
}
