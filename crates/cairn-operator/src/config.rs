//! Command line and cluster manifest
//!
//! Flags fall back to environment variables so the binary runs unchanged as
//! a Job in-cluster. Cluster context and the daemon list come from a YAML
//! manifest; flags override the manifest's namespace and images.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cairn_plan::{ClusterContext, DaemonProperties, MirrorSpec};

/// Errors loading the cluster manifest
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Manifest could not be read
    #[error("failed to read manifest {path}: {source}")]
    Read {
        /// Manifest path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// Manifest is not valid YAML for a cluster
    #[error("invalid manifest {path}: {source}")]
    Parse {
        /// Manifest path
        path: PathBuf,
        /// Underlying parse error
        source: serde_yaml::Error,
    },
    /// Manifest parsed but is unusable
    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// cairn - storage daemon planner and reconciler
#[derive(Parser, Debug)]
#[command(name = "cairn", version, about, long_about = None)]
pub struct Cli {
    /// Emit JSON log lines
    #[arg(long, env = "CAIRN_LOG_JSON", global = true)]
    pub log_json: bool,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the planned Deployments as YAML without touching the cluster
    Plan(ManifestArgs),
    /// Converge the cluster's Deployments to the planned ones
    Reconcile {
        /// Manifest selection
        #[command(flatten)]
        manifest: ManifestArgs,

        /// Path to kubeconfig (in-cluster config when unset)
        #[arg(long, env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,

        /// Ceph config file passed to `ceph auth` when removing credentials
        #[arg(long, env = "CAIRN_CEPH_CONF")]
        ceph_conf: Option<PathBuf>,
    },
}

/// Where the manifest lives and what to override in it
#[derive(Args, Debug, Clone)]
pub struct ManifestArgs {
    /// Path to the cluster manifest
    #[arg(short = 'f', long = "manifest", env = "CAIRN_MANIFEST")]
    pub manifest: PathBuf,

    /// Override the cluster namespace
    #[arg(long, env = "CAIRN_NAMESPACE")]
    pub namespace: Option<String>,

    /// Override the Ceph image
    #[arg(long, env = "CAIRN_CEPH_IMAGE")]
    pub ceph_image: Option<String>,

    /// Override the operator image (supplies tini and the helper binaries)
    #[arg(long, env = "CAIRN_OPERATOR_IMAGE")]
    pub operator_image: Option<String>,
}

impl ManifestArgs {
    /// Load the manifest and apply the overrides
    pub fn load(&self) -> Result<ClusterManifest, ConfigError> {
        let mut manifest = ClusterManifest::from_file(&self.manifest)?;
        if let Some(namespace) = &self.namespace {
            manifest.cluster.namespace = namespace.clone();
        }
        if let Some(image) = &self.ceph_image {
            manifest.cluster.ceph_image = image.clone();
        }
        if let Some(image) = &self.operator_image {
            manifest.cluster.operator_image = image.clone();
        }
        manifest.check()?;
        Ok(manifest)
    }
}

/// Cluster-wide context plus the daemons to run
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManifest {
    /// Cluster-wide context
    pub cluster: ClusterContext,
    /// OSDs, one entry per prepared disk
    #[serde(default)]
    pub osds: Vec<DaemonProperties>,
    /// rbd-mirror, when enabled
    #[serde(default)]
    pub rbd_mirror: Option<MirrorSpec>,
}

impl ClusterManifest {
    /// Read and parse a manifest file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.cluster.namespace.is_empty() {
            return Err(ConfigError::Invalid("cluster namespace is empty".to_string()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for osd in &self.osds {
            if !seen.insert(osd.id) {
                return Err(ConfigError::Invalid(format!("osd {} listed twice", osd.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"
cluster:
  namespace: storage
  fsid: 5e3c1b5a-0000-4d9b-8f6e-cafe00000000
  cephImage: quay.io/ceph/ceph:v19
  operatorImage: ghcr.io/cairn/cairn:v0.1.0
osds:
  - id: 0
    uuid: a6b4c2e0-1111-4f3a-9d5e-000000000001
    crushHostname: node-a
    cvMode: raw
    dataClaim: set1-data-0
  - id: 1
    uuid: a6b4c2e0-1111-4f3a-9d5e-000000000002
    crushHostname: node-b
    cvMode: raw
    dataClaim: set1-data-1
rbdMirror:
  resources:
    limits:
      memory: 1Gi
"#;

    fn write_manifest(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn args(path: &Path) -> ManifestArgs {
        ManifestArgs {
            manifest: path.to_path_buf(),
            namespace: None,
            ceph_image: None,
            operator_image: None,
        }
    }

    #[test]
    fn test_load_manifest() {
        let file = write_manifest(MANIFEST);
        let manifest = args(file.path()).load().unwrap();

        assert_eq!(manifest.cluster.namespace, "storage");
        assert_eq!(manifest.osds.len(), 2);
        assert_eq!(manifest.osds[1].crush_hostname, "node-b");
        assert!(manifest.rbd_mirror.is_some());
    }

    #[test]
    fn test_flags_override_manifest() {
        let file = write_manifest(MANIFEST);
        let mut args = args(file.path());
        args.namespace = Some("rook".to_string());
        args.ceph_image = Some("quay.io/ceph/ceph:v19.2.1".to_string());

        let manifest = args.load().unwrap();
        assert_eq!(manifest.cluster.namespace, "rook");
        assert_eq!(manifest.cluster.ceph_image, "quay.io/ceph/ceph:v19.2.1");
        assert_eq!(manifest.cluster.operator_image, "ghcr.io/cairn/cairn:v0.1.0");
    }

    #[test]
    fn test_duplicate_osd_is_rejected() {
        let duplicated = MANIFEST.replace("id: 1", "id: 0");
        let file = write_manifest(&duplicated);
        let err = args(file.path()).load().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let err = args(Path::new("/nonexistent/cairn.yaml")).load().unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let file = write_manifest("cluster: [not, a, map]");
        let err = args(file.path()).load().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_cli_parses_reconcile() {
        let cli = Cli::try_parse_from([
            "cairn",
            "--log-json",
            "reconcile",
            "-f",
            "/etc/cairn/cluster.yaml",
            "--namespace",
            "storage",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Reconcile { manifest, .. } => {
                assert_eq!(manifest.manifest, PathBuf::from("/etc/cairn/cluster.yaml"));
                assert_eq!(manifest.namespace.as_deref(), Some("storage"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
