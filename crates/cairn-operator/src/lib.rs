//! Deployment reconciliation for cairn storage daemons
//!
//! Converges the Deployments compiled by `cairn-plan` onto a cluster: one
//! identity at a time, updating in place when possible and recreating when
//! the API server refuses an update. Singleton classes are garbage-collected
//! down to their canonical instance afterwards.

#![deny(missing_docs)]

pub mod cleanup;
pub mod client;
pub mod config;
pub mod locks;
pub mod mirror;
pub mod reconciler;

pub use cleanup::{remove_extra_instances, CephAuthStore, CleanupReport, CleanupWarning, CredentialStore};
pub use client::{DeleteMode, DeploymentClient, KubeDeploymentClient, LiveDeployment};
pub use config::{Cli, ClusterManifest, Command, ConfigError, ManifestArgs};
pub use locks::IdentityLocks;
pub use mirror::MirrorReconciler;
pub use reconciler::{
    DeploymentReconciler, DeploymentRecord, ReconcileOutcome, ReconcileReport, ReconcileState,
};
