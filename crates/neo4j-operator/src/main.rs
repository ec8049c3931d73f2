//! Neo4j Operator - reconciles Neo4j Enterprise clusters on Kubernetes

use std::sync::Arc;

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};

use neo4j_cluster::controller::Context;
use neo4j_cluster::HealthRefresher;
use neo4j_common::crd::Neo4jEnterpriseCluster;
use neo4j_common::kube_utils::FIELD_MANAGER;
use neo4j_common::telemetry::{init_telemetry, TelemetryConfig};
use neo4j_operator::config::{Cli, Commands, OperatorConfig};
use neo4j_operator::controller_runner::build_cluster_controller;

const CRD_NAME: &str = "neo4jenterpriseclusters.neo4j.neo4j.com";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Neo4jEnterpriseCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    cli.config.validate()?;

    let _telemetry = init_telemetry(TelemetryConfig {
        json_logs: !cli.config.text_logs,
        ..TelemetryConfig::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Ensure the Neo4jEnterpriseCluster CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the running version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Neo4jEnterpriseCluster CRD...");
    crds.patch(
        CRD_NAME,
        &params,
        &Patch::Apply(&Neo4jEnterpriseCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Neo4jEnterpriseCluster CRD: {}", e))?;

    tracing::info!("Neo4jEnterpriseCluster CRD installed/updated");
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!("Neo4j operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let settings = config.settings();
    let refresh_interval = settings.health_refresh_interval;
    let ctx = Arc::new(
        Context::builder(client.clone())
            .settings(settings)
            .watch_namespace(config.watch_namespace.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );

    let refresher = HealthRefresher::new(ctx.clone(), refresh_interval);
    refresher.start();

    tracing::info!("Starting Neo4j controllers...");
    build_cluster_controller(
        client,
        ctx,
        config.watch_namespace.as_deref(),
        config.concurrency,
    )
    .await;

    refresher.stop().await;
    tracing::info!("Neo4j operator shutting down");
    Ok(())
}
