//! End-to-end plan for an encrypted, lvm-prepared OSD on a PVC with a
//! separate metadata claim and a Vault-held key

use cairn_plan::{ActivationMode, ClusterContext, ContainerPipelineBuilder, DaemonProperties};

const CLUSTER: &str = r#"
namespace: storage
fsid: 5e3c1b5a-0000-4d9b-8f6e-cafe00000000
cephImage: quay.io/ceph/ceph:v19
operatorImage: ghcr.io/cairn/cairn:v0.1.0
hostNetwork: true
kms:
  connectionDetails:
    KMS_PROVIDER: vault
    VAULT_ADDR: https://vault.example:8200
    VAULT_BACKEND_PATH: cairn
    VAULT_BACKEND: v2
  tokenSecretName: vault-token
"#;

const OSD: &str = r#"
id: 0
uuid: a6b4c2e0-1111-4f3a-9d5e-000000000001
crushHostname: node-a
location: root=default host=set1-data-0
cvMode: lvm
dataClaim: set1-data-0
metadataClaim: set1-meta-0
pvcSize: 10Gi
deviceSet: set1
encrypted: true
"#;

fn is_ordered_subsequence(expected: &[&str], actual: &[&str]) -> bool {
    let mut actual = actual.iter();
    expected.iter().all(|e| actual.any(|a| a == e))
}

/// Story: the operator plans an encrypted OSD whose metadata lives on its
/// own claim; the steps run in the order the devices need
#[test]
fn story_encrypted_metadata_osd_over_remote_kms() {
    let cluster: ClusterContext = serde_yaml::from_str(CLUSTER).unwrap();
    let props: DaemonProperties = serde_yaml::from_str(OSD).unwrap();

    let topology = cairn_plan::classify(&props, cluster.kms.as_ref());
    assert_eq!(topology.activation(), ActivationMode::VolumeManager);
    assert!(topology.on_pvc());
    assert!(topology.has_separate_metadata_volume());

    let plan = ContainerPipelineBuilder::new(&cluster, &props).build().unwrap();
    let names = plan.step_names();

    let expected = [
        "blkdevmapper",
        "blkdevmapper-metadata",
        "encryption-kms-get-kek",
        "encryption-open",
        "encryption-open-metadata",
        "blkdevmapper-encryption",
        "blkdevmapper-metadata-encryption",
        "encrypted-block-status",
        "expand-encrypted-bluefs",
        "activate",
        "expand-bluefs",
        "chown-container-data-dir",
    ];
    assert!(
        is_ordered_subsequence(&expected, &names),
        "unexpected order: {names:?}"
    );
    assert_eq!(&names[..2], &["config-init", "copy-bins"]);
    assert_eq!(names.last(), Some(&"chown-container-data-dir"));
    assert_eq!(plan.daemon.command, vec!["/cairn/tini"]);

    let deployment = plan.to_deployment().unwrap();
    assert_eq!(deployment.metadata.name, "cairn-osd-0");
    let pod = &deployment.spec.template.spec;
    assert_eq!(pod.host_ipc, Some(true));
    assert_eq!(pod.dns_policy.as_deref(), Some("ClusterFirstWithHostNet"));
    assert_eq!(pod.init_containers.len(), names.len());
    assert_eq!(
        pod.init_containers
            .iter()
            .find(|c| c.name == "encryption-open")
            .and_then(|c| c.security_context.as_ref())
            .and_then(|s| s.privileged),
        Some(true)
    );

    // Rebuilding yields the same content hash
    let again = ContainerPipelineBuilder::new(&cluster, &props).build().unwrap();
    assert_eq!(plan.spec_hash().unwrap(), again.spec_hash().unwrap());
}
