//! Execution plan synthesis for storage daemons
//!
//! Classifies an OSD's disk layout and compiles it into an ordered init
//! container pipeline plus the daemon container, wrapped in a Deployment.
//!
//! # Usage
//!
//! ```rust,ignore
//! let plan = ContainerPipelineBuilder::new(&cluster, &props).build()?;
//! let deployment = plan.to_deployment()?;
//! ```

#![deny(missing_docs)]

pub mod bridge;
pub mod daemon;
pub mod k8s;
pub mod keyflow;
pub mod mirror;
pub mod pipeline;
pub mod plan;
pub mod properties;
pub mod scripts;
pub mod step;
pub mod topology;

pub use bridge::{BridgeResolver, ClaimIdentity, MountBridge};
pub use keyflow::{KeyFlow, KeyState};
pub use mirror::{check_pod_memory, mirror_plan, MirrorSpec};
pub use pipeline::{build_plan, ContainerPipelineBuilder};
pub use plan::{DaemonClass, ExecutionPlan, PodSettings};
pub use properties::{ClusterContext, DaemonProperties, DeviceTuning, KmsConfig};
pub use step::PipelineStep;
pub use topology::{classify, ActivationMode, KeySource, ProvisioningMode, StorageTopology};
