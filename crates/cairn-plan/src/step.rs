//! One init container of an execution plan

use crate::k8s::{
    Container, EnvVar, ResourceRequirements, SecurityContext, VolumeDevice, VolumeMount,
};

/// A pipeline step. Built once per plan; the builder never mutates a step
/// after appending it.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineStep {
    /// Container name, unique within the plan
    pub name: String,
    /// Image
    pub image: String,
    /// Command (entrypoint override)
    pub command: Vec<String>,
    /// Args
    pub args: Vec<String>,
    /// Environment
    pub env: Vec<EnvVar>,
    /// Mounts, in order
    pub volume_mounts: Vec<VolumeMount>,
    /// Raw block devices
    pub volume_devices: Vec<VolumeDevice>,
    /// Run privileged as root
    pub privileged: bool,
    /// Resources
    pub resources: ResourceRequirements,
    /// Working directory
    pub working_dir: Option<String>,
}

impl PipelineStep {
    /// Create an empty step
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            volume_mounts: Vec::new(),
            volume_devices: Vec::new(),
            privileged: false,
            resources: ResourceRequirements::default(),
            working_dir: None,
        }
    }

    /// Set the command
    pub fn with_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the args
    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append environment variables
    pub fn with_env(mut self, env: impl IntoIterator<Item = EnvVar>) -> Self {
        self.env.extend(env);
        self
    }

    /// Append a mount
    pub fn with_mount(mut self, mount: VolumeMount) -> Self {
        self.volume_mounts.push(mount);
        self
    }

    /// Append mounts
    pub fn with_mounts(mut self, mounts: impl IntoIterator<Item = VolumeMount>) -> Self {
        self.volume_mounts.extend(mounts);
        self
    }

    /// Append a raw device
    pub fn with_device(mut self, device: VolumeDevice) -> Self {
        self.volume_devices.push(device);
        self
    }

    /// Run privileged
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Set resources
    pub fn with_resources(mut self, resources: &ResourceRequirements) -> Self {
        self.resources = resources.clone();
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Mount path of a volume in this step, if mounted
    pub fn mount_path_of(&self, volume: &str) -> Option<&str> {
        self.volume_mounts
            .iter()
            .find(|m| m.name == volume)
            .map(|m| m.mount_path.as_str())
    }

    /// Convert to a container
    pub fn to_container(&self) -> Container {
        Container {
            name: self.name.clone(),
            image: self.image.clone(),
            image_pull_policy: None,
            command: (!self.command.is_empty()).then(|| self.command.clone()),
            args: (!self.args.is_empty()).then(|| self.args.clone()),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            resources: (!self.resources.is_empty()).then(|| self.resources.clone()),
            volume_mounts: self.volume_mounts.clone(),
            volume_devices: self.volume_devices.clone(),
            security_context: Some(if self.privileged {
                SecurityContext::privileged()
            } else {
                SecurityContext::unprivileged()
            }),
        }
    }
}
