//! Common types for cairn: errors, Kubernetes helpers and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key identifying the tool that manages a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on every resource cairn creates
pub const LABEL_MANAGED_BY_CAIRN: &str = "cairn";

/// Label key for the daemon application (e.g. "cairn-osd")
pub const LABEL_APP: &str = "app";

/// Label key carrying the owning cluster namespace
pub const LABEL_CLUSTER: &str = "cairn.io/cluster";

/// Annotation holding the content hash of the last-applied deployment spec
pub const ANNOTATION_SPEC_HASH: &str = "cairn.io/spec-hash";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "cairn-operator";
