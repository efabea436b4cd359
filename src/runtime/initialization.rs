//! # Initialization
//!
//! Controller initialization logic including tracing, rustls setup, metrics,
//! server startup, and Kubernetes client setup.

use crate::config::ControllerConfig;
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::crd::Stack;
use crate::observability;
use anyhow::{Context, Result};
use kube::{api::Api, Client};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    /// Stacks in the watched namespace, or all namespaces
    pub stacks: Api<Stack>,
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.is_ready())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Install the tracing subscriber, filtered by `RUST_LOG` (default `stack_controller=info`)
pub fn init_tracing() {
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stack_controller=info".into()),
        )
        .try_init()
    {
        eprintln!("Tracing subscriber already initialized: {e}");
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler setup
pub async fn initialize(config: ControllerConfig) -> Result<InitializationResult> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting Stack Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(
        namespace = %config.controller_namespace,
        watch_namespace = ?config.watch_namespace,
        max_concurrent_reconciles = config.max_concurrent_reconciles,
        automation_binary = %config.automation_binary,
        "Controller configuration"
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());
    let server_port = config.metrics_port;
    let server_state_clone = server_state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(
        &server_state,
        &server_handle,
        Duration::from_secs(config.server_startup_timeout_secs),
        Duration::from_millis(config.server_poll_interval_ms),
    )
    .await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let stacks: Api<Stack> = match config.watch_namespace.as_deref() {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    which::which(&config.automation_binary).with_context(|| {
        format!(
            "automation engine '{}' not found on PATH",
            config.automation_binary
        )
    })?;

    let reconciler = Arc::new(
        Reconciler::for_cluster(client.clone(), config.clone())
            .context("Failed to create reconciler")?,
    );

    info!("Controller initialized, starting watch loop...");
    Ok(InitializationResult {
        client,
        stacks,
        reconciler,
        server_state,
        config,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &ServerState,
    server_handle: &tokio::task::JoinHandle<()>,
    startup_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let start_time = Instant::now();
    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.is_ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
