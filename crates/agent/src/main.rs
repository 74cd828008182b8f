//! OOM notifier agent
//!
//! Watches pods, nodes and events of a Kubernetes cluster and reports
//! OOM-killed containers and lifecycle changes to a webhook.

use agent_lib::{
    cluster::{ConnectMode, KubeClusterClient},
    health::HealthRegistry,
    observability::StructuredLogger,
    DedupCache, NotifierConfig, Orchestrator, OrchestratorConfig, WebhookNotifier,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where cluster credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ApiMode {
    /// Service account of the pod the agent runs in
    Internal,
    /// Kubeconfig file
    External,
}

#[derive(Debug, Parser)]
#[command(name = "oom-agent", version, about = "Reports OOM-killed containers to a webhook")]
struct Cli {
    /// Cluster access mode
    #[arg(long, value_enum, default_value_t = ApiMode::Internal)]
    api: ApiMode,

    /// Kubeconfig used with `--api external`
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

impl Cli {
    fn connect_mode(&self) -> ConnectMode {
        match self.api {
            ApiMode::Internal => ConnectMode::InCluster,
            ApiMode::External => ConnectMode::Kubeconfig(self.kubeconfig.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "OOM notifier failed");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::AgentConfig::load().context("failed to load configuration")?;
    let destination = config.destination()?;

    let logger = StructuredLogger::new(&config.instance_name);
    let connect_mode = cli.connect_mode();
    logger.log_startup(AGENT_VERSION, &format!("{:?}", cli.api).to_lowercase());

    let client = KubeClusterClient::connect(&connect_mode)
        .await
        .context("failed to connect to the cluster")?;

    let cache = Arc::new(DedupCache::new(config.cache_location()));
    let notifier = WebhookNotifier::new(&NotifierConfig::default())
        .context("failed to build webhook client")?;

    let health_registry = HealthRegistry::new();
    let orchestrator = Orchestrator::new(
        Arc::new(client),
        cache,
        Arc::new(notifier),
        OrchestratorConfig {
            scan_scope: config.scan_scope(),
            ..OrchestratorConfig::new(destination)
        },
        health_registry.clone(),
        logger.clone(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let app_state = Arc::new(api::AppState::new(health_registry));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, cancel.clone()));

    let result = orchestrator.run(cancel.clone()).await;

    cancel.cancel();
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    result.context("orchestrator stopped with an error")?;
    logger.log_shutdown("signal received");
    info!("Shutdown complete");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM detected"),
                    _ = tokio::signal::ctrl_c() => info!("SIGINT detected"),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT detected");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("SIGINT detected");
    }

    token.cancel();
}
