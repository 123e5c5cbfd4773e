//! Shell contracts run by init steps
//!
//! Each contract is a fixed bash program plus the exact set of parameters it
//! reads. Parameters are injected as shell-quoted assignments ahead of the
//! body, so values never need escaping by callers.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::k8s::EnvVar;

/// Errors rendering a contract
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    /// A declared parameter was not supplied
    #[error("contract {contract} is missing parameter {param}")]
    MissingParam {
        /// Contract name
        contract: &'static str,
        /// Parameter name
        param: &'static str,
    },
    /// A parameter the contract does not declare was supplied
    #[error("contract {contract} does not take parameter {param}")]
    UnexpectedParam {
        /// Contract name
        contract: &'static str,
        /// Parameter name
        param: String,
    },
    /// The step environment lacks a variable the contract reads
    #[error("contract {contract} needs environment variable {var}")]
    MissingEnv {
        /// Contract name
        contract: &'static str,
        /// Variable name
        var: &'static str,
    },
}

/// A named, parameterized bash program
#[derive(Debug)]
pub struct ShellContract {
    /// Contract name
    pub name: &'static str,
    /// Parameters, assigned before the body runs
    pub params: &'static [&'static str],
    /// Environment variables the body reads
    pub required_env: &'static [&'static str],
    body: &'static str,
}

impl ShellContract {
    /// Render into a container command. Every declared parameter must be
    /// supplied and nothing else may be.
    pub fn render(&self, args: &[(&str, &str)]) -> Result<Vec<String>, ContractError> {
        let supplied: BTreeMap<&str, &str> = args.iter().copied().collect();
        if let Some(extra) = supplied.keys().find(|k| !self.params.contains(*k)) {
            return Err(ContractError::UnexpectedParam {
                contract: self.name,
                param: extra.to_string(),
            });
        }

        let mut script = String::new();
        for &param in self.params {
            let value = supplied.get(param).ok_or(ContractError::MissingParam {
                contract: self.name,
                param,
            })?;
            script.push_str(param);
            script.push('=');
            script.push_str(&shell_words::quote(value));
            script.push('\n');
        }
        script.push_str(self.body);

        Ok(vec!["/bin/bash".to_string(), "-c".to_string(), script])
    }

    /// Check the step environment provides what the body reads
    pub fn check_env(&self, env: &[EnvVar]) -> Result<(), ContractError> {
        for &var in self.required_env {
            if !env.iter().any(|e| e.name == var) {
                return Err(ContractError::MissingEnv {
                    contract: self.name,
                    var,
                });
            }
        }
        Ok(())
    }
}

/// Copy a block device node into a bridge.
///
/// A destination with the source's major/minor is left alone. A destination
/// with different numbers is a stale node from a previous attachment and is
/// replaced.
pub const BLOCK_DEV_MAPPER: ShellContract = ShellContract {
    name: "block-dev-mapper",
    params: &["PVC_SOURCE", "PVC_DEST"],
    required_env: &[],
    body: r#"set -xe

CP_ARGS=(--archive --dereference --verbose)

if [ -b "$PVC_DEST" ]; then
	PVC_SOURCE_MAJ_MIN=$(stat --format '%t%T' "$PVC_SOURCE")
	PVC_DEST_MAJ_MIN=$(stat --format '%t%T' "$PVC_DEST")
	if [[ "$PVC_SOURCE_MAJ_MIN" == "$PVC_DEST_MAJ_MIN" ]]; then
		CP_ARGS+=(--no-clobber)
	else
		echo "source major/minor changed from $PVC_DEST_MAJ_MIN to $PVC_SOURCE_MAJ_MIN"
		CP_ARGS+=(--remove-destination)
	fi
fi

cp "${CP_ARGS[@]}" "$PVC_SOURCE" "$PVC_DEST"
"#,
};

/// Open a LUKS device, or reopen it when its backing device vanished.
///
/// The key file is removed on failure, and on success when `PURGE_KEY` is
/// "true".
pub const OPEN_ENCRYPTED_BLOCK: ShellContract = ShellContract {
    name: "open-encrypted-block",
    params: &["KEY_FILE_PATH", "BLOCK_PATH", "DM_NAME", "DM_PATH", "PURGE_KEY"],
    required_env: &[],
    body: r#"set -xe

on_exit() {
	status=$?
	if [ "$status" -ne 0 ] || [ "$PURGE_KEY" = "true" ]; then
		rm -f "$KEY_FILE_PATH"
	fi
	exit "$status"
}
trap on_exit EXIT

dmsetup version

open_encrypted_block() {
	echo "opening encrypted device $BLOCK_PATH at $DM_PATH"
	cryptsetup luksOpen --verbose --disable-keyring --allow-discards --key-file "$KEY_FILE_PATH" "$BLOCK_PATH" "$DM_NAME"
}

if [ -b "$DM_PATH" ]; then
	echo "encrypted device $BLOCK_PATH already opened at $DM_PATH"
	for field in $(dmsetup table "$DM_NAME"); do
		if [[ "$field" =~ ^[0-9]+\:[0-9]+ ]]; then
			backing="/sys/dev/block/$field"
			if [ ! -d "$backing" ]; then
				echo "backing device $backing of $DM_NAME disappeared, removing stale mapping"
				dmsetup remove --force "$DM_NAME"
				open_encrypted_block
			fi
		fi
	done
else
	open_encrypted_block
fi
"#,
};

/// Fetch a key-encryption key from Vault with token auth.
///
/// The response payload and the partial key are always removed; the key
/// file survives only a fully successful run.
pub const KMS_VAULT_GET_KEK_TOKEN: ShellContract = ShellContract {
    name: "kms-vault-get-kek-token",
    params: &["KEK_NAME", "KEY_PATH"],
    required_env: &["VAULT_ADDR", "VAULT_BACKEND_PATH", "VAULT_TOKEN"],
    // Never trace: the token is on the curl command line
    body: r#"set -e
umask 077

CURL_PAYLOAD=$(mktemp)
KEY_TMP="$KEY_PATH.partial"

on_exit() {
	status=$?
	rm -f "$CURL_PAYLOAD" "$KEY_TMP"
	if [ "$status" -ne 0 ]; then
		rm -f "$KEY_PATH"
	fi
	exit "$status"
}
trap on_exit EXIT

ARGS=(--silent --show-error --request GET --header "X-Vault-Token: ${VAULT_TOKEN}")
PYTHON_DATA_PARSE="['data']"

if [ -n "$VAULT_NAMESPACE" ]; then
	ARGS+=(--header "X-Vault-Namespace: ${VAULT_NAMESPACE}")
fi
if [[ "$VAULT_SKIP_VERIFY" == "true" ]]; then
	ARGS+=(--insecure)
fi
if [ -n "$VAULT_CACERT" ]; then
	ARGS+=(--cacert "${VAULT_CACERT}")
fi
if [ -n "$VAULT_CLIENT_CERT" ]; then
	ARGS+=(--cert "${VAULT_CLIENT_CERT}")
fi
if [ -n "$VAULT_CLIENT_KEY" ]; then
	ARGS+=(--key "${VAULT_CLIENT_KEY}")
fi
if [ -n "$VAULT_TLS_SERVER_NAME" ]; then
	ARGS+=(--connect-to ::"${VAULT_TLS_SERVER_NAME}":)
fi

if [[ "$VAULT_BACKEND" == "v2" ]]; then
	PYTHON_DATA_PARSE="['data']['data']"
	VAULT_BACKEND_PATH="$VAULT_BACKEND_PATH/data"
fi

curl "${ARGS[@]}" "$VAULT_ADDR"/v1/"$VAULT_BACKEND_PATH"/"$KEK_NAME" > "$CURL_PAYLOAD"

if python3 -c "import sys, json; sys.exit(0 if json.load(sys.stdin).get('errors') else 1)" 2> /dev/null < "$CURL_PAYLOAD"; then
	echo "key-management service returned errors for $KEK_NAME" >&2
	exit 1
fi

python3 -c "import sys, json; print(json.load(sys.stdin)${PYTHON_DATA_PARSE}[\"$KEK_NAME\"], end='')" < "$CURL_PAYLOAD" > "$KEY_TMP"

if [ ! -s "$KEY_TMP" ]; then
	echo "empty key returned for $KEK_NAME" >&2
	exit 1
fi
mv -f "$KEY_TMP" "$KEY_PATH"
"#,
};

/// Stage a pre-provisioned key into the private key directory
pub const STAGE_LOCAL_KEY: ShellContract = ShellContract {
    name: "stage-local-key",
    params: &["KEY_SOURCE", "KEY_PATH"],
    required_env: &[],
    body: r#"set -e
umask 077

KEY_TMP="$KEY_PATH.partial"

on_exit() {
	status=$?
	rm -f "$KEY_TMP"
	if [ "$status" -ne 0 ]; then
		rm -f "$KEY_PATH"
	fi
	exit "$status"
}
trap on_exit EXIT

if [ ! -s "$KEY_SOURCE" ]; then
	echo "encryption key $KEY_SOURCE is missing or empty" >&2
	exit 1
fi
cp "$KEY_SOURCE" "$KEY_TMP"
mv -f "$KEY_TMP" "$KEY_PATH"
"#,
};

/// Activate a host-device daemon with the volume tool
pub const ACTIVATE_OSD: ShellContract = ShellContract {
    name: "activate-osd",
    params: &[
        "OSD_ID",
        "OSD_UUID",
        "CV_MODE",
        "DEVICE",
        "METADATA_DEVICE",
        "WAL_DEVICE",
    ],
    required_env: &[],
    body: r#"set -ex

OSD_DATA_DIR=/var/lib/ceph/osd/ceph-"$OSD_ID"

if [[ "$CV_MODE" == "lvm" ]]; then
	TMP_DIR=$(mktemp -d)

	ceph-volume "$CV_MODE" activate --no-systemd --bluestore "$OSD_ID" "$OSD_UUID"

	# the activation tmpfs disappears with this container, keep its content
	cp --verbose --no-dereference "$OSD_DATA_DIR"/* "$TMP_DIR"/
	umount "$OSD_DATA_DIR"
	cp --verbose --no-dereference "$TMP_DIR"/* "$OSD_DATA_DIR"
	chown --verbose --recursive ceph:ceph "$OSD_DATA_DIR"
	rm --recursive --force "$TMP_DIR"
else
	ARGS=(--device "$DEVICE" --no-systemd --no-tmpfs)
	if [ -n "$METADATA_DEVICE" ]; then
		ARGS+=(--block.db "$METADATA_DEVICE")
	fi
	if [ -n "$WAL_DEVICE" ]; then
		ARGS+=(--block.wal "$WAL_DEVICE")
	fi
	ceph-volume "$CV_MODE" activate "${ARGS[@]}"
fi
"#,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::{Path, PathBuf};
    use std::process::{Command, Output};

    fn script(rendered: &[String]) -> &str {
        assert_eq!(rendered[0], "/bin/bash");
        assert_eq!(rendered[1], "-c");
        &rendered[2]
    }

    #[test]
    fn test_render_prepends_quoted_assignments() {
        let rendered = BLOCK_DEV_MAPPER
            .render(&[("PVC_SOURCE", "/set1-data-0"), ("PVC_DEST", "/var/lib/ceph osd/block")])
            .unwrap();
        let script = script(&rendered);
        assert!(script.starts_with("PVC_SOURCE=/set1-data-0\nPVC_DEST='/var/lib/ceph osd/block'\n"));
        assert!(script.contains("set -xe"));
    }

    #[test]
    fn test_render_rejects_wrong_parameter_sets() {
        assert_eq!(
            BLOCK_DEV_MAPPER.render(&[("PVC_SOURCE", "/a")]),
            Err(ContractError::MissingParam {
                contract: "block-dev-mapper",
                param: "PVC_DEST",
            })
        );
        let err = BLOCK_DEV_MAPPER
            .render(&[("PVC_SOURCE", "/a"), ("PVC_DEST", "/b"), ("EXTRA", "x")])
            .unwrap_err();
        assert!(matches!(err, ContractError::UnexpectedParam { .. }));
    }

    #[test]
    fn test_open_is_reentrant_and_purges_key_on_failure() {
        let body = OPEN_ENCRYPTED_BLOCK.body;
        assert!(body.contains("if [ -b \"$DM_PATH\" ]"));
        assert!(body.contains("/sys/dev/block/$field"));
        assert!(body.contains("dmsetup remove --force \"$DM_NAME\""));
        assert!(body.contains("[ \"$status\" -ne 0 ] || [ \"$PURGE_KEY\" = \"true\" ]"));
        assert!(body.contains("trap on_exit EXIT"));
        assert!(body.contains("--disable-keyring --allow-discards"));
    }

    #[test]
    fn test_vault_script_is_never_traced() {
        let body = KMS_VAULT_GET_KEK_TOKEN.body;
        assert!(!body.contains("set -x"));
        assert!(body.contains("--connect-to ::\"${VAULT_TLS_SERVER_NAME}\":"));
    }

    #[test]
    fn test_vault_contract_checks_env() {
        let env = vec![
            EnvVar::literal("VAULT_ADDR", "https://vault:8200"),
            EnvVar::literal("VAULT_BACKEND_PATH", "cairn"),
        ];
        assert_eq!(
            KMS_VAULT_GET_KEK_TOKEN.check_env(&env),
            Err(ContractError::MissingEnv {
                contract: "kms-vault-get-kek-token",
                var: "VAULT_TOKEN",
            })
        );
        let mut env = env;
        env.push(EnvVar::from_secret("VAULT_TOKEN", "vault-token", "token"));
        assert!(KMS_VAULT_GET_KEK_TOKEN.check_env(&env).is_ok());
    }

    #[test]
    fn test_activate_osd_branches_on_mode() {
        let rendered = ACTIVATE_OSD
            .render(&[
                ("OSD_ID", "4"),
                ("OSD_UUID", "abc"),
                ("CV_MODE", "raw"),
                ("DEVICE", "/dev/sdb"),
                ("METADATA_DEVICE", ""),
                ("WAL_DEVICE", ""),
            ])
            .unwrap();
        let script = script(&rendered);
        assert!(script.contains("METADATA_DEVICE=''\n"));
        assert!(script.contains("ceph-volume \"$CV_MODE\" activate \"${ARGS[@]}\""));
        assert!(script.contains("umount \"$OSD_DATA_DIR\""));
    }

    fn run(contract: &ShellContract, params: &[(&str, &str)], env: &[(&str, String)]) -> Output {
        let rendered = contract.render(params).unwrap();
        let mut cmd = Command::new(&rendered[0]);
        cmd.args(&rendered[1..]);
        for var in [
            "VAULT_NAMESPACE",
            "VAULT_SKIP_VERIFY",
            "VAULT_CACERT",
            "VAULT_CLIENT_CERT",
            "VAULT_CLIENT_KEY",
            "VAULT_TLS_SERVER_NAME",
        ] {
            cmd.env_remove(var);
        }
        cmd.envs(env.iter().map(|(k, v)| (*k, v.as_str())));
        cmd.output().unwrap()
    }

    const KEK: &str = "cairn-osd-encryption-key-set1-data-0";

    /// Answers every request with `$STUB_DIR/response` and exits `$STUB_EXIT`
    const CURL_STUB: &str = r#"#!/bin/bash
for last; do :; done
printf '%s' "$last" > "$STUB_DIR/url"
cat "$STUB_DIR/response"
exit "$STUB_EXIT"
"#;

    /// A scratch root with a fake curl ahead of the real one on PATH
    struct VaultStub {
        root: tempfile::TempDir,
    }

    /// Exit code, key present, partial key present
    type FetchResult = (Option<i32>, bool, bool);

    impl VaultStub {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let bin = root.path().join("bin");
            fs::create_dir(&bin).unwrap();
            let curl = bin.join("curl");
            fs::write(&curl, CURL_STUB).unwrap();
            fs::set_permissions(&curl, fs::Permissions::from_mode(0o755)).unwrap();
            fs::create_dir(root.path().join("keys")).unwrap();
            Self { root }
        }

        fn key_path(&self) -> PathBuf {
            self.root.path().join("keys").join("luks_key")
        }

        fn requested_url(&self) -> String {
            fs::read_to_string(self.root.path().join("url")).unwrap()
        }

        /// Run the fetch over a stale key left by an earlier attempt
        fn fetch(&self, response: &str, curl_exit: i32) -> FetchResult {
            let dir = self.root.path();
            fs::write(dir.join("response"), response).unwrap();
            let key = self.key_path();
            fs::write(&key, "stale").unwrap();

            let path = format!(
                "{}:{}",
                dir.join("bin").display(),
                std::env::var("PATH").unwrap_or_default()
            );
            let output = run(
                &KMS_VAULT_GET_KEK_TOKEN,
                &[("KEK_NAME", KEK), ("KEY_PATH", key.to_str().unwrap())],
                &[
                    ("PATH", path),
                    ("STUB_DIR", dir.display().to_string()),
                    ("STUB_EXIT", curl_exit.to_string()),
                    ("VAULT_ADDR", "https://vault.example:8200".to_string()),
                    ("VAULT_BACKEND_PATH", "cairn".to_string()),
                    ("VAULT_BACKEND", "v2".to_string()),
                    ("VAULT_TOKEN", "s.cairn-test".to_string()),
                ],
            );
            let partial = PathBuf::from(format!("{}.partial", key.display()));
            (output.status.code(), key.exists(), partial.exists())
        }
    }

    /// Story: the key reaches its final path only when the service returns a
    /// non-empty value; every failure purges the stale key and leaves no
    /// partial file
    #[test]
    fn story_vault_fetch_outcomes() {
        let stub = VaultStub::new();

        let ok = format!(r#"{{"data":{{"data":{{"{KEK}":"c2VjcmV0LWtleQ=="}}}}}}"#);
        assert_eq!(stub.fetch(&ok, 0), (Some(0), true, false));
        assert_eq!(fs::read_to_string(stub.key_path()).unwrap(), "c2VjcmV0LWtleQ==");
        assert_eq!(
            stub.requested_url(),
            format!("https://vault.example:8200/v1/cairn/data/{KEK}")
        );
        let mode = fs::metadata(stub.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);

        let failures = [
            ("errors", r#"{"errors":["permission denied"]}"#.to_string()),
            ("missing key", r#"{"data":{"data":{}}}"#.to_string()),
            ("empty key", format!(r#"{{"data":{{"data":{{"{KEK}":""}}}}}}"#)),
            ("v1 shape under v2", format!(r#"{{"data":{{"{KEK}":"c2VjcmV0"}}}}"#)),
        ];
        for (case, response) in failures {
            assert_eq!(stub.fetch(&response, 0), (Some(1), false, false), "{case}");
        }

        assert_eq!(stub.fetch("", 7), (Some(7), false, false));
    }

    fn is_root() -> bool {
        Command::new("id")
            .arg("-u")
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
            .unwrap_or(false)
    }

    fn mknod(path: &Path, major: u32, minor: u32) {
        let status = Command::new("mknod")
            .arg(path)
            .args(["b", &major.to_string(), &minor.to_string()])
            .status()
            .unwrap();
        assert!(status.success());
    }

    fn copy_node(source: &Path, dest: &Path) -> Output {
        run(
            &BLOCK_DEV_MAPPER,
            &[
                ("PVC_SOURCE", source.to_str().unwrap()),
                ("PVC_DEST", dest.to_str().unwrap()),
            ],
            &[],
        )
    }

    /// Story: re-running the copy over the same device keeps the node, a
    /// device re-attached with new numbers replaces it, and a missing node
    /// is created
    #[test]
    fn story_copy_contract_on_device_nodes() {
        if !is_root() {
            eprintln!("skipping: creating device nodes needs root");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("set1-data-0");
        mknod(&source, 7, 3);
        let source_rdev = fs::metadata(&source).unwrap().rdev();

        let same = dir.path().join("same");
        mknod(&same, 7, 3);
        let inode = fs::metadata(&same).unwrap().ino();
        assert!(copy_node(&source, &same).status.success());
        assert_eq!(fs::metadata(&same).unwrap().ino(), inode);

        let changed = dir.path().join("changed");
        mknod(&changed, 7, 9);
        let output = copy_node(&source, &changed);
        assert!(output.status.success());
        assert_eq!(fs::metadata(&changed).unwrap().rdev(), source_rdev);
        assert!(String::from_utf8_lossy(&output.stdout).contains("major/minor changed"));

        let absent = dir.path().join("absent");
        assert!(copy_node(&source, &absent).status.success());
        assert_eq!(fs::metadata(&absent).unwrap().rdev(), source_rdev);
    }
}
