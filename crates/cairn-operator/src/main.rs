//! cairn - plan and converge storage daemon Deployments

use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use tracing::{error, info};

use cairn_common::kube_utils::create_client;
use cairn_common::telemetry::{init_telemetry, TelemetryConfig};
use cairn_operator::{
    CephAuthStore, Cli, ClusterManifest, Command, DeploymentReconciler, KubeDeploymentClient,
    MirrorReconciler,
};
use cairn_plan::{mirror_plan, ContainerPipelineBuilder, DaemonProperties, ExecutionPlan};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "cairn".to_string(),
        json: cli.log_json,
    })?;

    match cli.command {
        Command::Plan(args) => {
            let manifest = args.load()?;
            print_plans(&manifest)
        }
        Command::Reconcile {
            manifest,
            kubeconfig,
            ceph_conf,
        } => {
            let manifest = manifest.load()?;
            let client = create_client(kubeconfig.as_deref()).await?;
            let auth_args = ceph_conf
                .map(|conf| vec!["--conf".to_string(), conf.display().to_string()])
                .unwrap_or_default();
            let reconciler = Arc::new(DeploymentReconciler::new(
                Arc::new(KubeDeploymentClient::new(client)),
                Arc::new(CephAuthStore::new(auth_args)),
            ));
            reconcile_all(&manifest, reconciler).await
        }
    }
}

fn osd_plan(manifest: &ClusterManifest, props: &DaemonProperties) -> cairn_common::Result<ExecutionPlan> {
    ContainerPipelineBuilder::new(&manifest.cluster, props).build()
}

/// Print every planned Deployment as a YAML stream
fn print_plans(manifest: &ClusterManifest) -> anyhow::Result<()> {
    let mut plans = manifest
        .osds
        .iter()
        .map(|props| osd_plan(manifest, props))
        .collect::<cairn_common::Result<Vec<_>>>()?;
    if let Some(spec) = &manifest.rbd_mirror {
        plans.push(mirror_plan(&manifest.cluster, spec)?);
    }

    for plan in plans {
        let yaml = serde_yaml::to_string(&plan.to_deployment()?)
            .map_err(|e| anyhow::anyhow!("failed to serialize {}: {}", plan.name(), e))?;
        println!("---\n{}", yaml.trim_end());
    }
    Ok(())
}

/// Converge every OSD concurrently, then the rbd-mirror
async fn reconcile_all(
    manifest: &ClusterManifest,
    reconciler: Arc<DeploymentReconciler>,
) -> anyhow::Result<()> {
    let results = join_all(manifest.osds.iter().map(|props| {
        let reconciler = reconciler.clone();
        async move {
            let plan = osd_plan(manifest, props)?;
            reconciler.reconcile(&plan).await
        }
    }))
    .await;

    let mut failed = 0;
    for (props, result) in manifest.osds.iter().zip(results) {
        match result {
            Ok(report) => info!(deployment = %report.name, outcome = ?report.outcome, "osd reconciled"),
            Err(e) => {
                failed += 1;
                error!(osd = props.id, retryable = e.is_retryable(), error = %e, "osd reconcile failed");
            }
        }
    }

    if let Some(spec) = &manifest.rbd_mirror {
        if let Err(e) = MirrorReconciler::new(reconciler)
            .start(&manifest.cluster, spec)
            .await
        {
            failed += 1;
            error!(retryable = e.is_retryable(), error = %e, "rbd-mirror reconcile failed");
        }
    }

    if failed > 0 {
        anyhow::bail!("{} daemon(s) failed to reconcile", failed);
    }
    info!(osds = manifest.osds.len(), "reconcile complete");
    Ok(())
}
