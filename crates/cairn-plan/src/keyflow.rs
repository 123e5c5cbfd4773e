//! Encryption key lifecycle across init steps
//!
//! The key moves `NoKey → KeyRequested → KeyObtained → KeyConsumed`. The
//! retrieval step writes it into a memory-backed emptyDir, each open step
//! reads it, and the last open step deletes it. Any failing step deletes it
//! too.

use cairn_common::{Error, Result};
use tracing::debug;

use crate::bridge::MountBridge;
use crate::daemon::{device_mapper, DEV_MAPPER_DIR};
use crate::k8s::{EnvVar, ResourceRequirements, Volume, VolumeMount};
use crate::properties::KmsConfig;
use crate::scripts::{KMS_VAULT_GET_KEK_TOKEN, OPEN_ENCRYPTED_BLOCK, STAGE_LOCAL_KEY};
use crate::step::PipelineStep;
use crate::topology::{KeySource, KmsAuth, KmsProvider};

/// Private volume holding the unwrapped key
pub const ENCRYPTION_KEY_VOLUME: &str = "osd-encryption-key";
/// Directory of the key inside containers
pub const ENCRYPTION_KEY_DIR: &str = "/etc/ceph/osd-encryption";
/// Key file name
pub const ENCRYPTION_KEY_FILE: &str = "luks_key";

/// Volume projecting a pre-provisioned key secret
pub const ENCRYPTION_SECRET_VOLUME: &str = "osd-encryption-secret";
const ENCRYPTION_SECRET_DIR: &str = "/etc/cairn/osd-encryption-secret";
const ENCRYPTION_SECRET_KEY: &str = "dmcrypt-key";

/// Root of the Vault TLS material mounts
pub const VAULT_TLS_DIR: &str = "/etc/vault";
const VAULT_TOKEN_ENV: &str = "VAULT_TOKEN";
const VAULT_TOKEN_KEY: &str = "token";

/// Connection details that point at TLS secrets, with where they land:
/// (env var, volume name, secret key, sub dir, file)
const VAULT_TLS_MATERIAL: &[(&str, &str, &str, &str, &str)] = &[
    ("VAULT_CACERT", "vault-ca-cert", "cert", "ca", "vault.ca"),
    ("VAULT_CLIENT_CERT", "vault-client-cert", "cert", "client-cert", "vault.crt"),
    ("VAULT_CLIENT_KEY", "vault-client-key", "key", "client-key", "vault.key"),
];

/// Connection details that configure cairn itself and never reach the step
const KMS_INTERNAL_DETAILS: &[&str] = &["KMS_PROVIDER", "VAULT_AUTH_METHOD"];

/// Name of the key for a claim: the secret name for local keys and the
/// key-encryption key name in a remote store
pub fn encryption_key_name(claim: &str) -> String {
    format!("cairn-osd-encryption-key-{}", claim)
}

/// Path of the unwrapped key inside containers
pub fn encryption_key_path() -> String {
    format!("{}/{}", ENCRYPTION_KEY_DIR, ENCRYPTION_KEY_FILE)
}

/// Where the key is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    /// No retrieval step emitted
    NoKey,
    /// Retrieval step emitted
    KeyRequested,
    /// A step after retrieval reads the key
    KeyObtained,
    /// The last open step purges the key
    KeyConsumed,
}

/// Key flow for one daemon's plan
pub struct KeyFlow<'a> {
    daemon: String,
    claim: String,
    source: KeySource,
    kms: Option<&'a KmsConfig>,
    image: String,
    resources: ResourceRequirements,
    state: KeyState,
    opens_remaining: usize,
}

impl<'a> KeyFlow<'a> {
    /// Create a flow that expects exactly `opens` open steps
    pub fn new(
        daemon: impl Into<String>,
        claim: impl Into<String>,
        source: &KeySource,
        kms: Option<&'a KmsConfig>,
        image: impl Into<String>,
        resources: &ResourceRequirements,
        opens: usize,
    ) -> Self {
        Self {
            daemon: daemon.into(),
            claim: claim.into(),
            source: source.clone(),
            kms,
            image: image.into(),
            resources: resources.clone(),
            state: KeyState::NoKey,
            opens_remaining: opens,
        }
    }

    /// Current state
    pub fn state(&self) -> KeyState {
        self.state
    }

    fn key_mount() -> VolumeMount {
        VolumeMount::new(ENCRYPTION_KEY_VOLUME, ENCRYPTION_KEY_DIR)
    }

    fn transition(&mut self, to: KeyState) {
        debug!(daemon = %self.daemon, from = ?self.state, to = ?to, "key flow transition");
        self.state = to;
    }

    /// Emit the retrieval step for the key source
    pub fn request(&mut self) -> Result<PipelineStep> {
        if self.state != KeyState::NoKey {
            return Err(Error::plan_build(
                &self.daemon,
                format!("key requested twice (state {:?})", self.state),
            ));
        }
        if self.opens_remaining == 0 {
            return Err(Error::plan_build(&self.daemon, "key requested with no open step to consume it"));
        }

        let step = match &self.source {
            KeySource::None => {
                return Err(Error::plan_build(
                    &self.daemon,
                    "encrypted topology has no key source",
                ))
            }
            KeySource::LocalFile => self.stage_local_key()?,
            KeySource::RemoteKms {
                provider: KmsProvider::Vault,
                auth: KmsAuth::Token,
            } => self.vault_get_kek()?,
            KeySource::RemoteKms { provider, auth } => {
                return Err(Error::key_retrieval(
                    &self.daemon,
                    provider.to_string(),
                    format!("no key retrieval for auth mode {:?}", auth),
                ))
            }
        };

        self.transition(KeyState::KeyRequested);
        Ok(step)
    }

    fn stage_local_key(&self) -> Result<PipelineStep> {
        let source = format!("{}/{}", ENCRYPTION_SECRET_DIR, ENCRYPTION_SECRET_KEY);
        let command = STAGE_LOCAL_KEY
            .render(&[("KEY_SOURCE", source.as_str()), ("KEY_PATH", encryption_key_path().as_str())])
            .map_err(|e| Error::plan_build(&self.daemon, e.to_string()))?;
        Ok(PipelineStep::new("encryption-stage-key", &self.image)
            .with_command(command)
            .with_mount(Self::key_mount())
            .with_mount(VolumeMount::read_only(
                ENCRYPTION_SECRET_VOLUME,
                ENCRYPTION_SECRET_DIR,
            ))
            .with_resources(&self.resources))
    }

    fn vault_get_kek(&self) -> Result<PipelineStep> {
        let kms = self.kms.ok_or_else(|| {
            Error::key_retrieval(&self.daemon, "vault", "key-management service is not configured")
        })?;
        let token_secret = kms
            .token_secret_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::key_retrieval(&self.daemon, "vault", "token secret is not set"))?;

        let mut env = Vec::new();
        let mut mounts = vec![Self::key_mount()];
        for (key, value) in &kms.connection_details {
            if KMS_INTERNAL_DETAILS.contains(&key.as_str()) || value.is_empty() {
                continue;
            }
            match VAULT_TLS_MATERIAL.iter().find(|(var, ..)| *var == key.as_str()) {
                Some((var, volume, _, dir, file)) => {
                    let dir = format!("{}/{}", VAULT_TLS_DIR, dir);
                    env.push(EnvVar::literal(*var, format!("{}/{}", dir, file)));
                    mounts.push(VolumeMount::read_only(*volume, dir));
                }
                None => env.push(EnvVar::literal(key, value)),
            }
        }
        env.push(EnvVar::from_secret(VAULT_TOKEN_ENV, token_secret, VAULT_TOKEN_KEY));

        KMS_VAULT_GET_KEK_TOKEN
            .check_env(&env)
            .map_err(|e| Error::key_retrieval(&self.daemon, "vault", e.to_string()))?;
        let command = KMS_VAULT_GET_KEK_TOKEN
            .render(&[
                ("KEK_NAME", encryption_key_name(&self.claim).as_str()),
                ("KEY_PATH", encryption_key_path().as_str()),
            ])
            .map_err(|e| Error::plan_build(&self.daemon, e.to_string()))?;

        Ok(PipelineStep::new("encryption-kms-get-kek", &self.image)
            .with_command(command)
            .with_env(env)
            .with_mounts(mounts)
            .with_resources(&self.resources))
    }

    /// Emit a step opening `block_path` (inside `bridge`) as `/dev/mapper/<dm_name>`.
    /// The last declared open purges the key on success.
    pub fn open(
        &mut self,
        name: &str,
        block_path: &str,
        dm_name: &str,
        bridge: &MountBridge,
    ) -> Result<PipelineStep> {
        match self.state {
            KeyState::KeyRequested => self.transition(KeyState::KeyObtained),
            KeyState::KeyObtained => {}
            KeyState::NoKey | KeyState::KeyConsumed => {
                return Err(Error::plan_build(
                    &self.daemon,
                    format!("{} cannot open a device in key state {:?}", name, self.state),
                ))
            }
        }

        let last = self.opens_remaining == 1;
        let dm_path = format!("{}/{}", DEV_MAPPER_DIR, dm_name);
        let command = OPEN_ENCRYPTED_BLOCK
            .render(&[
                ("KEY_FILE_PATH", encryption_key_path().as_str()),
                ("BLOCK_PATH", block_path),
                ("DM_NAME", dm_name),
                ("DM_PATH", dm_path.as_str()),
                ("PURGE_KEY", if last { "true" } else { "false" }),
            ])
            .map_err(|e| Error::plan_build(&self.daemon, e.to_string()))?;

        self.opens_remaining -= 1;
        if last {
            self.transition(KeyState::KeyConsumed);
        }

        Ok(PipelineStep::new(name, &self.image)
            .with_command(command)
            .with_mount(bridge.mount())
            .with_mount(device_mapper().1)
            .with_mount(Self::key_mount())
            .with_resources(&self.resources)
            .privileged())
    }

    /// Fail unless every declared open step was emitted
    pub fn finish(&self) -> Result<()> {
        if self.state != KeyState::KeyConsumed {
            return Err(Error::plan_build(
                &self.daemon,
                format!(
                    "key flow ended in state {:?} with {} open step(s) outstanding",
                    self.state, self.opens_remaining
                ),
            ));
        }
        Ok(())
    }

    /// Volumes the emitted steps mount
    pub fn volumes(&self) -> Vec<Volume> {
        let mut volumes = vec![Volume::from_empty_dir(ENCRYPTION_KEY_VOLUME, Some("Memory"))];
        match &self.source {
            KeySource::LocalFile => volumes.push(Volume::from_secret_key(
                ENCRYPTION_SECRET_VOLUME,
                encryption_key_name(&self.claim),
                ENCRYPTION_SECRET_KEY,
                ENCRYPTION_SECRET_KEY,
            )),
            KeySource::RemoteKms { .. } => {
                if let Some(kms) = self.kms {
                    for (var, volume, key, _, file) in VAULT_TLS_MATERIAL {
                        if let Some(secret) = kms.param(var) {
                            volumes.push(Volume::from_secret_key(*volume, secret, *key, *file));
                        }
                    }
                }
            }
            KeySource::None => {}
        }
        volumes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::tests::vault_kms;

    fn bridge() -> MountBridge {
        MountBridge {
            volume_name: "set1-data-0-bridge".to_string(),
            mount_path: "/var/lib/ceph/osd/ceph-0".to_string(),
            host_path: "/var/lib/cairn/storage/set1-data-0".to_string(),
        }
    }

    fn vault_source() -> KeySource {
        KeySource::RemoteKms {
            provider: KmsProvider::Vault,
            auth: KmsAuth::Token,
        }
    }

    /// Story: two opens share one key; only the second purges it
    #[test]
    fn story_key_is_consumed_by_last_open() {
        let kms = vault_kms();
        let mut flow = KeyFlow::new(
            "osd.0",
            "set1-data-0",
            &vault_source(),
            Some(&kms),
            "ceph:v19",
            &ResourceRequirements::default(),
            2,
        );
        assert_eq!(flow.state(), KeyState::NoKey);

        let fetch = flow.request().unwrap();
        assert_eq!(fetch.name, "encryption-kms-get-kek");
        assert_eq!(flow.state(), KeyState::KeyRequested);

        let block = flow
            .open("encryption-open", "/var/lib/ceph/osd/ceph-0/block-tmp", "set1-data-0-block-dmcrypt", &bridge())
            .unwrap();
        assert_eq!(flow.state(), KeyState::KeyObtained);
        assert!(block.command[2].contains("PURGE_KEY=false\n"));
        assert!(flow.finish().is_err());

        let meta = flow
            .open("encryption-open-metadata", "/var/lib/ceph/osd/ceph-0/block.db-tmp", "set1-meta-0-db-dmcrypt", &bridge())
            .unwrap();
        assert!(meta.command[2].contains("PURGE_KEY=true\n"));
        assert!(meta.command[2].contains("DM_PATH=/dev/mapper/set1-meta-0-db-dmcrypt\n"));
        assert!(meta.privileged);
        assert_eq!(flow.state(), KeyState::KeyConsumed);
        assert!(flow.finish().is_ok());

        // Nothing left to read the key
        let err = flow
            .open("encryption-open-wal", "/x", "y", &bridge())
            .unwrap_err();
        assert!(matches!(err, Error::PlanBuild { .. }));
    }

    #[test]
    fn test_open_before_request_is_rejected() {
        let mut flow = KeyFlow::new(
            "osd.1",
            "set1-data-1",
            &KeySource::LocalFile,
            None,
            "ceph:v19",
            &ResourceRequirements::default(),
            1,
        );
        let err = flow.open("encryption-open", "/b", "d", &bridge()).unwrap_err();
        assert!(matches!(err, Error::PlanBuild { .. }));
        flow.request().unwrap();
        assert!(matches!(flow.request().unwrap_err(), Error::PlanBuild { .. }));
    }

    #[test]
    fn test_vault_step_environment_and_tls() {
        let mut kms = vault_kms();
        kms.connection_details
            .insert("VAULT_CACERT".to_string(), "vault-ca".to_string());
        kms.connection_details
            .insert("VAULT_NAMESPACE".to_string(), "team-a".to_string());
        let mut flow = KeyFlow::new(
            "osd.2",
            "set1-data-2",
            &vault_source(),
            Some(&kms),
            "ceph:v19",
            &ResourceRequirements::default(),
            1,
        );
        let step = flow.request().unwrap();

        let env = |name: &str| step.env.iter().find(|e| e.name == name).cloned();
        assert!(env("KMS_PROVIDER").is_none());
        assert_eq!(env("VAULT_NAMESPACE").unwrap().value.as_deref(), Some("team-a"));
        assert_eq!(
            env("VAULT_CACERT").unwrap().value.as_deref(),
            Some("/etc/vault/ca/vault.ca")
        );
        let token = env("VAULT_TOKEN").unwrap().value_from.unwrap().secret_key_ref.unwrap();
        assert_eq!(token.name, "vault-token");
        assert_eq!(step.mount_path_of("vault-ca-cert"), Some("/etc/vault/ca"));
        assert_eq!(step.mount_path_of(ENCRYPTION_KEY_VOLUME), Some(ENCRYPTION_KEY_DIR));
        assert!(step.command[2].contains("KEK_NAME=cairn-osd-encryption-key-set1-data-2\n"));
        assert!(!step.privileged);

        let volumes = flow.volumes();
        let key = volumes.iter().find(|v| v.name == ENCRYPTION_KEY_VOLUME).unwrap();
        assert_eq!(key.empty_dir.as_ref().unwrap().medium.as_deref(), Some("Memory"));
        assert!(volumes.iter().any(|v| v.name == "vault-ca-cert"));
    }

    #[test]
    fn test_local_key_projects_claim_secret() {
        let mut flow = KeyFlow::new(
            "osd.3",
            "set1-data-3",
            &KeySource::LocalFile,
            None,
            "ceph:v19",
            &ResourceRequirements::default(),
            1,
        );
        let step = flow.request().unwrap();
        assert_eq!(step.name, "encryption-stage-key");
        let volumes = flow.volumes();
        let secret = volumes
            .iter()
            .find(|v| v.name == ENCRYPTION_SECRET_VOLUME)
            .and_then(|v| v.secret.as_ref())
            .unwrap();
        assert_eq!(secret.secret_name, "cairn-osd-encryption-key-set1-data-3");
    }

    #[test]
    fn test_unsupported_remote_auth_is_a_key_retrieval_error() {
        let kms = vault_kms();
        let source = KeySource::RemoteKms {
            provider: KmsProvider::Vault,
            auth: KmsAuth::Other("kubernetes".to_string()),
        };
        let mut flow = KeyFlow::new(
            "osd.4",
            "set1-data-4",
            &source,
            Some(&kms),
            "ceph:v19",
            &ResourceRequirements::default(),
            1,
        );
        let err = flow.request().unwrap_err();
        assert!(matches!(err, Error::KeyRetrieval { .. }));
        assert_eq!(flow.state(), KeyState::NoKey);
    }
}
