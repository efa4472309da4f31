//! Background initialization of backend records.
//!
//! A single worker drains the registry's init queue. Transient failures are
//! retried with a one second backoff up to the configured attempt budget;
//! configuration refusals go straight to ERRORED. Backend types flagged
//! `can_load_fast` bypass the queue entirely and run
//! [`initialize_record`] inline on the adding task.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::record::{BackendRecord, BackendStatus};
use crate::backend::registry::BackendRegistry;
use crate::config::INIT_RETRY_BACKOFF;
use crate::error::InitError;

pub struct InitWorker;

impl InitWorker {
    /// Spawn the queue-draining task. It exits when the registry's shutdown
    /// token fires.
    pub(crate) fn spawn(registry: Arc<BackendRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if registry.shutdown_token().is_cancelled() {
                    break;
                }
                match registry.pop_init() {
                    Some(id) => {
                        if let Some(record) = registry.record(id) {
                            initialize_record(&registry, &record).await;
                        }
                    }
                    // Poll with a small timeout so re-enqueued retries make
                    // progress even if a signal is missed.
                    None => registry.wait_init_signal(Duration::from_secs(1)).await,
                }
            }
        })
    }
}

/// Bring one backend up, publishing status transitions as it goes.
pub(crate) async fn initialize_record(registry: &BackendRegistry, record: &Arc<BackendRecord>) {
    if !record.enabled() {
        record.set_status(BackendStatus::Disabled);
        registry.wake_scheduler();
        return;
    }

    record.set_status(BackendStatus::Loading);
    registry.wake_scheduler();
    let attempt = record.bump_init_attempts();
    info!(backend = record.id, attempt, "initializing backend");

    match record.driver().init().await {
        Ok(handshake) => {
            record.set_features(handshake.features);
            record.set_model_catalog(handshake.models);
            record.set_max_usages(record.driver().max_usages());
            record.set_last_error(None);
            record.touch();
            record.set_status(BackendStatus::Running);
            info!(backend = record.id, "backend is running");
            registry.recompute_loaded_models();
        }
        Err(InitError::Refused(reason)) => {
            error!(backend = record.id, %reason, "backend configuration refused");
            record.set_last_error(Some(reason));
            record.set_status(BackendStatus::Errored);
            registry.wake_scheduler();
        }
        Err(err) => {
            let root = err.root_cause();
            if err.is_connection_refused() {
                warn!(
                    backend = record.id,
                    "connection refused; the worker process may still be starting"
                );
            }
            let max_attempts = registry.config().max_backend_init_attempts;
            if attempt < max_attempts {
                warn!(
                    backend = record.id,
                    attempt, max_attempts, error = %root, "backend init failed, will retry"
                );
                record.set_status(BackendStatus::Waiting);
                tokio::time::sleep(INIT_RETRY_BACKOFF).await;
                registry.enqueue_init(record.id);
            } else {
                error!(
                    backend = record.id,
                    attempts = attempt, error = %root, "backend init failed permanently"
                );
                record.set_last_error(Some(root));
                record.set_status(BackendStatus::Errored);
                registry.wake_scheduler();
            }
        }
    }
}
