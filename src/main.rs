//! # Stack Controller
//!
//! Kubernetes controller for `Stack` resources.
//!
//! Settings are read from the environment (see [`ControllerConfig`]); the
//! flags below override the matching variables.

use anyhow::Result;
use clap::Parser;
use stack_controller::config::ControllerConfig;
use stack_controller::runtime::{init_tracing, initialize, run_watch_loop};
use tracing::info;

/// Reconciles Stack resources with an infrastructure-as-code automation engine
#[derive(Debug, Parser)]
#[command(name = "stack-controller", version, about, long_about = None)]
struct Args {
    /// Watch a single namespace instead of the whole cluster
    #[arg(long, value_name = "NAMESPACE")]
    watch_namespace: Option<String>,

    /// Maximum number of Stacks reconciled concurrently
    #[arg(long, value_name = "N")]
    max_concurrent_reconciles: Option<usize>,

    /// Port for /metrics, /healthz and /readyz
    #[arg(long, value_name = "PORT")]
    metrics_port: Option<u16>,

    /// Automation engine executable
    #[arg(long, value_name = "PATH")]
    automation_binary: Option<String>,
}

impl Args {
    fn apply(self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(namespace) = self.watch_namespace {
            config.watch_namespace = Some(namespace);
        }
        if let Some(n) = self.max_concurrent_reconciles {
            config.max_concurrent_reconciles = n;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(binary) = self.automation_binary {
            config.automation_binary = binary;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = args.apply(ControllerConfig::from_env());
    let init = initialize(config).await?;

    run_watch_loop(init.stacks, init.reconciler, init.server_state, init.config).await?;
    info!("Stack Controller exited");
    Ok(())
}
