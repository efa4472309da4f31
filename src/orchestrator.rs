//! Top-level wiring: registry + init worker + scheduler, plus the
//! intake-facing acquisition and generation entry points.

use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::backend::{BackendRegistry, InitWorker};
use crate::config::OrchestratorConfig;
use crate::driver::{BackendType, GenerationEvent, GenerationInput};
use crate::error::{GenerateError, OrchestratorError};
use crate::scheduler::{AcquireOptions, BackendAccess, RequestFilter, Scheduler};
use crate::session::SessionCounters;

/// The assembled orchestrator core.
///
/// Owns the background tasks; [`shutdown`](Self::shutdown) tears everything
/// down idempotently, signalling every open request on the way out.
pub struct Orchestrator {
    registry: Arc<BackendRegistry>,
    scheduler: Arc<Scheduler>,
    init_worker: StdMutex<Option<JoinHandle<()>>>,
    scheduler_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Restore persisted backends and start the init worker and scheduler.
    pub async fn start(
        config: OrchestratorConfig,
        types: Vec<BackendType>,
    ) -> anyhow::Result<Self> {
        let registry = BackendRegistry::new(config, types);
        registry.load().await?;
        let init_worker = InitWorker::spawn(registry.clone());
        let scheduler = Scheduler::new(registry.clone());
        let scheduler_task = scheduler.clone().run_task();
        info!("orchestrator started");
        Ok(Self {
            registry,
            scheduler,
            init_worker: StdMutex::new(Some(init_worker)),
            scheduler_task: StdMutex::new(Some(scheduler_task)),
        })
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Acquire a usage slot on a backend able to serve the request. See
    /// [`Scheduler::get_next_backend`].
    pub async fn get_next_backend(
        &self,
        opts: AcquireOptions,
    ) -> Result<Option<BackendAccess>, OrchestratorError> {
        self.scheduler.get_next_backend(opts).await
    }

    /// Acquire a backend and run one streaming generation on it, honoring
    /// the one-shot redirect budget.
    ///
    /// Returns `Ok(true)` when the generation completed, `Ok(false)` when it
    /// was cancelled. The usage slot is released on every path.
    pub async fn run_generation(
        &self,
        opts: AcquireOptions,
        input: &GenerationInput,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<bool, OrchestratorError> {
        let AcquireOptions {
            max_wait,
            desired_model,
            filter,
            session,
            notify_will_load,
            cancel,
        } = opts;

        let generation_cancel = cancel
            .clone()
            .or_else(|| session.as_ref().map(|s| s.cancel_token()))
            .unwrap_or_default();

        let mut filter = filter;
        let mut notify_will_load = notify_will_load;
        let mut redirected = false;
        loop {
            let attempt = AcquireOptions {
                max_wait,
                desired_model: desired_model.clone(),
                filter: filter.clone(),
                session: session.clone(),
                notify_will_load: notify_will_load.take(),
                cancel: cancel.clone(),
            };
            let Some(access) = self.get_next_backend(attempt).await? else {
                return Ok(false);
            };

            let _live_claim = session.as_ref().map(|s| {
                s.claim(SessionCounters {
                    live: 1,
                    ..Default::default()
                })
            });
            let backend_id = access.backend_id();
            let batch_id = Uuid::new_v4();
            let result = access
                .generate_live(input, batch_id, events.clone(), generation_cancel.clone())
                .await;
            access.release();

            match result {
                Ok(()) => return Ok(true),
                Err(GenerateError::PleaseRedirect) if !redirected => {
                    redirected = true;
                    info!(
                        backend = backend_id,
                        "backend redirected the request; retrying on another backend"
                    );
                    let exclude = RequestFilter::exclude_backend(backend_id);
                    filter = Some(match filter {
                        Some(f) => f.and(exclude),
                        None => exclude,
                    });
                }
                Err(err) => return Err(OrchestratorError::Generation(err)),
            }
        }
    }

    /// Tear everything down. Safe to call more than once; open requests are
    /// signalled with cancellation, backends are drained and shut down.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        let scheduler_task = self
            .scheduler_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = scheduler_task {
            let _ = task.await;
        }
        let init_worker = self
            .init_worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = init_worker {
            let _ = task.await;
        }
    }
}
