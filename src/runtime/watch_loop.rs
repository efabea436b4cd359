//! # Watch Loop
//!
//! Controller watch loop that monitors Stack resources and triggers
//! reconciliation when changes are detected.

use crate::config::ControllerConfig;
use crate::constants::{WATCH_BACKOFF_MAX_MS, WATCH_BACKOFF_START_MS};
use crate::controller::reconciler::{reconcile, Reconciler};
use crate::controller::server::ServerState;
use crate::crd::Stack;
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use futures::StreamExt;
use kube::api::Api;
use kube_runtime::{controller, watcher, Controller};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Run the controller watch loop until shutdown
///
/// The kube-runtime controller guarantees at most one in-flight pass per
/// Stack; `max_concurrent_reconciles` bounds passes across Stacks. The watch
/// is restarted whenever its stream ends, until a shutdown signal clears
/// readiness.
pub async fn run_watch_loop(
    stacks: Api<Stack>,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    config: ControllerConfig,
) -> Result<(), anyhow::Error> {
    let backoff_ms = Arc::new(AtomicU64::new(WATCH_BACKOFF_START_MS));
    let concurrency = u16::try_from(config.max_concurrent_reconciles).unwrap_or(u16::MAX);

    let shutdown_state = server_state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, initiating graceful shutdown...");
            shutdown_state.set_ready(false);
            info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
        }
    });

    loop {
        if !server_state.is_ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let watch_span = tracing::span!(
            tracing::Level::INFO,
            "controller.watch",
            operation = "watch_loop",
            concurrency
        );
        info!(parent: &watch_span, "Starting controller watch loop...");

        let stream_backoff = backoff_ms.clone();
        let restart_delay = config.watch_restart_delay();
        Controller::new(stacks.clone(), watcher::Config::default().any_semantic())
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile, handle_reconciliation_error, reconciler.clone())
            .filter_map(move |event| {
                let backoff = stream_backoff.clone();
                async move {
                    match &event {
                        Ok((object, _)) => {
                            backoff.store(WATCH_BACKOFF_START_MS, Ordering::Relaxed);
                            debug!(stack = %object.name, "watch.event.success");
                            Some(event)
                        }
                        Err(e) => {
                            let error = format!("{e:?}");
                            handle_watch_stream_error(
                                &error,
                                &backoff,
                                WATCH_BACKOFF_MAX_MS,
                                restart_delay,
                            )
                            .await
                            .map(|()| event)
                        }
                    }
                }
            })
            .for_each(|_| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if !server_state.is_ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        warn!(
            delay_secs = restart_delay.as_secs(),
            "Controller watch stream ended, restarting"
        );
        tokio::time::sleep(restart_delay).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}
