//! The dispatch core: a single coordinator task that matches open requests
//! to eligible backends and, when nothing matches, commits at most one
//! backend per pass to an expensive model swap.
//!
//! Everyone else (intake, registry, access handles) posts work by mutating
//! shared records and firing the scheduler's wake signal; only the
//! coordinator makes scheduling decisions.

pub mod access;
pub mod pressure;

pub use access::BackendAccess;
pub use pressure::PressureEntry;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendId, BackendRecord, BackendRegistry, BackendStatus};
use crate::config::{MODEL_LOAD_POLL, PRESSURE_DEFER_WINDOW, SCHEDULER_TICK};
use crate::error::OrchestratorError;
use crate::session::{Session, SessionClaim, SessionCounters};

/// Predicate deciding whether a backend can serve a request.
#[derive(Clone)]
pub struct RequestFilter(Arc<dyn Fn(&BackendRecord) -> bool + Send + Sync>);

impl RequestFilter {
    pub fn new(f: impl Fn(&BackendRecord) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, record: &BackendRecord) -> bool {
        (self.0)(record)
    }

    /// Require every listed feature to be supported.
    pub fn requires_features(features: &[&str]) -> Self {
        let wanted: Vec<String> = features.iter().map(|s| s.to_string()).collect();
        Self::new(move |record| wanted.iter().all(|f| record.supports_feature(f)))
    }

    pub fn exclude_backend(id: BackendId) -> Self {
        Self::new(move |record| record.id != id)
    }

    pub fn and(self, other: RequestFilter) -> Self {
        Self::new(move |record| self.matches(record) && other.matches(record))
    }
}

impl std::fmt::Debug for RequestFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequestFilter")
    }
}

/// Parameters of one `get_next_backend` call.
#[derive(Default)]
pub struct AcquireOptions {
    /// Cap on the wait. Clamped to the configured per-request timeout.
    pub max_wait: Option<Duration>,
    /// Model the generation needs resident; `None` takes any backend.
    pub desired_model: Option<String>,
    pub filter: Option<RequestFilter>,
    pub session: Option<Arc<Session>>,
    /// Fired once if the scheduler commits a model load on this request's
    /// behalf, so intake can tell the user a slow swap started.
    pub notify_will_load: Option<Box<dyn FnOnce() + Send>>,
    /// Explicit cancellation. Falls back to the session token, then to a
    /// token that never fires. Registry shutdown always cancels.
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            desired_model: Some(model.into()),
            ..Default::default()
        }
    }

    pub fn any_backend() -> Self {
        Self::default()
    }
}

enum RequestOutcome {
    Acquired(BackendAccess),
    Failed(OrchestratorError),
    Cancelled,
}

/// One queued acquisition, alive from intake until its completion signal.
struct OpenRequest {
    id: u64,
    desired_model: Option<String>,
    filter: Option<RequestFilter>,
    session: Option<Arc<Session>>,
    notify_will_load: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
    cancel: CancellationToken,
    deadline: tokio::time::Instant,
    pressure: StdMutex<Option<Arc<PressureEntry>>>,
    outcome: StdMutex<Option<RequestOutcome>>,
    done: Notify,
}

impl OpenRequest {
    fn pressure_entry(&self) -> Option<Arc<PressureEntry>> {
        self.pressure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub struct Scheduler {
    registry: Arc<BackendRegistry>,
    requests: DashMap<u64, Arc<OpenRequest>>,
    pressure: DashMap<String, Arc<PressureEntry>>,
    wake: Arc<Notify>,
    /// Global counter naming requests for logging.
    request_counter: AtomicU64,
    last_progress: StdMutex<Instant>,
}

impl Scheduler {
    pub fn new(registry: Arc<BackendRegistry>) -> Arc<Self> {
        let wake = registry.scheduler_wake();
        Arc::new(Self {
            registry,
            requests: DashMap::new(),
            pressure: DashMap::new(),
            wake,
            request_counter: AtomicU64::new(0),
            last_progress: StdMutex::new(Instant::now()),
        })
    }

    /// Spawn the coordinator loop. Exits once the registry's shutdown token
    /// fires, after signalling every open request.
    pub(crate) fn run_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.registry.shutdown_token().is_cancelled() {
                    break;
                }
                self.tick().await;
                tokio::select! {
                    _ = self.registry.shutdown_token().cancelled() => break,
                    _ = tokio::time::timeout(SCHEDULER_TICK, self.wake.notified()) => {}
                }
            }
            self.drain_on_shutdown();
            debug!("scheduler loop exited");
        })
    }

    pub fn open_request_count(&self) -> usize {
        self.requests.len()
    }

    /// Pressure entry for a model, if any requests are waiting on it.
    pub fn pressure_for(&self, model: &str) -> Option<Arc<PressureEntry>> {
        self.pressure.get(model).map(|e| e.value().clone())
    }

    fn open_requests_ordered(&self) -> Vec<Arc<OpenRequest>> {
        let mut open: Vec<_> = self.requests.iter().map(|r| r.value().clone()).collect();
        open.sort_by_key(|r| r.id);
        open
    }

    async fn tick(&self) {
        // Cancellations first: cancelled requests complete with no result
        // and no failure.
        for req in self.open_requests_ordered() {
            if req.cancel.is_cancelled() {
                debug!(request = req.id, "request cancelled");
                self.complete(&req, RequestOutcome::Cancelled);
            }
        }

        for req in self.open_requests_ordered() {
            self.try_find(&req).await;
        }

        self.check_stagnation();
    }

    /// One matching attempt for one request, per the dispatch order:
    /// running-and-unreserved, filter, availability, model residency, then
    /// pressure registration.
    async fn try_find(&self, req: &Arc<OpenRequest>) {
        if req
            .outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
        {
            return;
        }
        let records = self.registry.all_records();
        let possible: Vec<Arc<BackendRecord>> = records
            .iter()
            .filter(|r| r.enabled() && !r.reserved() && r.status() == BackendStatus::Running)
            .cloned()
            .collect();

        if possible.is_empty() {
            let any_pending = records
                .iter()
                .any(|r| matches!(r.status(), BackendStatus::Loading | BackendStatus::Waiting));
            if !any_pending {
                self.complete(
                    req,
                    RequestOutcome::Failed(OrchestratorError::NoBackendsAvailable),
                );
            }
            return;
        }

        let eligible: Vec<Arc<BackendRecord>> = match &req.filter {
            Some(filter) => possible
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
            None => possible,
        };
        if eligible.is_empty() {
            self.complete(
                req,
                RequestOutcome::Failed(OrchestratorError::NoMatchingBackend),
            );
            return;
        }

        let mut available: Vec<Arc<BackendRecord>> =
            eligible.iter().filter(|r| !r.in_use()).cloned().collect();
        available.sort_by_key(|r| r.usages());

        match &req.desired_model {
            None => {
                if let Some(first) = available.first() {
                    if let Some(access) = BackendAccess::acquire(first, &self.wake) {
                        debug!(request = req.id, backend = first.id, "claimed backend");
                        self.complete(req, RequestOutcome::Acquired(access));
                        return;
                    }
                }
            }
            Some(model) => {
                for record in &available {
                    if record.current_model().as_deref() == Some(model.as_str()) {
                        if let Some(access) = BackendAccess::acquire(record, &self.wake) {
                            debug!(
                                request = req.id,
                                backend = record.id,
                                model = %model,
                                "claimed backend with model resident"
                            );
                            self.complete(req, RequestOutcome::Acquired(access));
                            return;
                        }
                    }
                }
                // Some eligible backend holds the model but is busy: wait
                // for it to free instead of pressing for another load.
                let resident = eligible
                    .iter()
                    .any(|r| r.current_model().as_deref() == Some(model.as_str()));
                if resident {
                    self.release_pressure(req);
                } else {
                    let entry = self
                        .pressure
                        .entry(model.clone())
                        .or_insert_with(|| Arc::new(PressureEntry::new(model.clone())))
                        .value()
                        .clone();
                    if entry.register(req.id, req.session.as_ref()) {
                        *req.pressure.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(entry.clone());
                        debug!(request = req.id, model = %model, count = entry.count(),
                               "registered model pressure");
                    }
                }
            }
        }

        if !available.is_empty() {
            self.load_highest_pressure(&available).await;
        }

        if let Some(entry) = req.pressure_entry() {
            if entry.is_loading() {
                let hook = req
                    .notify_will_load
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                if let Some(hook) = hook {
                    hook();
                }
            }
        }
    }

    /// The model-swap decision: pick the highest-scored pressure entry a
    /// free loader can serve, commit one backend to it, and launch the load
    /// outside the tick.
    async fn load_highest_pressure(&self, available: &[Arc<BackendRecord>]) {
        let loaders: Vec<Arc<BackendRecord>> = available
            .iter()
            .filter(|r| r.can_load_models())
            .cloned()
            .collect();
        if loaders.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut entries: Vec<Arc<PressureEntry>> = self
            .pressure
            .iter()
            .filter(|e| !e.is_loading())
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.score(now)));

        let compatibility = |entry: &Arc<PressureEntry>| -> (bool, bool) {
            let mut any = false;
            let mut all = true;
            let mut seen = false;
            for rid in entry.request_ids() {
                let Some(req) = self.requests.get(&rid).map(|r| r.value().clone()) else {
                    continue;
                };
                seen = true;
                let ok = match &req.filter {
                    Some(filter) => loaders.iter().any(|l| filter.matches(l)),
                    None => true,
                };
                any |= ok;
                all &= ok;
            }
            (seen && any, seen && all)
        };

        let serveable: Vec<Arc<PressureEntry>> = entries
            .iter()
            .filter(|e| compatibility(e).0)
            .cloned()
            .collect();
        let fully_serveable: Vec<Arc<PressureEntry>> = serveable
            .iter()
            .filter(|e| compatibility(e).1)
            .cloned()
            .collect();
        let ranked = if fully_serveable.is_empty() {
            serveable
        } else {
            fully_serveable
        };
        let Some(entry) = ranked.into_iter().next() else {
            return;
        };

        let _guard = entry.locker.lock().await;
        if entry.is_loading() {
            return;
        }
        // Fresh pressure with several free loaders: hold off, a matching
        // backend may release naturally.
        if loaders.len() > 1 && entry.first_request_time.elapsed() < PRESSURE_DEFER_WINDOW {
            return;
        }
        // A load is only worth it if some waiting request has no eligible
        // backend with the model resident. Requests whose model is resident
        // on a busy backend queue behind it instead of forcing a second
        // copy of the model onto the pool.
        if !self.entry_needs_load(&entry) {
            return;
        }

        let bad = entry.bad_backends();
        let candidates: Vec<Arc<BackendRecord>> = loaders
            .iter()
            .filter(|r| !bad.contains(&r.id))
            .cloned()
            .collect();
        if candidates.is_empty() {
            warn!(model = %entry.model, "every capable backend failed this model");
            for rid in entry.request_ids() {
                if let Some(req) = self.requests.get(&rid).map(|r| r.value().clone()) {
                    self.complete(
                        &req,
                        RequestOutcome::Failed(OrchestratorError::AllBackendsFailedModel {
                            model: entry.model.clone(),
                        }),
                    );
                }
            }
            self.pressure.remove(&entry.model);
            return;
        }

        let needing_load: Vec<Arc<BackendRecord>> = candidates
            .into_iter()
            .filter(|r| r.current_model().as_deref() != Some(entry.model.as_str()))
            .collect();
        if needing_load.is_empty() {
            // Resident on every eligible loader already; nothing to do.
            return;
        }

        let idle: Vec<Arc<BackendRecord>> = needing_load
            .iter()
            .filter(|r| r.usages() == 0)
            .cloned()
            .collect();
        let pool = if idle.is_empty() { needing_load } else { idle };
        let Some(chosen) = pool.into_iter().min_by_key(|r| r.time_last_release()) else {
            return;
        };

        entry.set_loading(true);
        chosen.set_reserve_model_load(true);
        let claims: Vec<SessionClaim> = entry
            .sessions()
            .iter()
            .map(|s| s.claim(SessionCounters::loading_models(1)))
            .collect();
        info!(backend = chosen.id, model = %entry.model, "committing backend to model load");
        spawn_model_load(self.registry.clone(), entry.clone(), chosen, claims);
    }

    /// True when at least one request registered on the entry cannot be
    /// served by any eligible backend that already has the model resident.
    fn entry_needs_load(&self, entry: &Arc<PressureEntry>) -> bool {
        let records = self.registry.all_records();
        entry.request_ids().iter().any(|rid| {
            let Some(req) = self.requests.get(rid).map(|r| r.value().clone()) else {
                return false;
            };
            !records.iter().any(|r| {
                r.enabled()
                    && !r.reserved()
                    && r.status() == BackendStatus::Running
                    && r.current_model().as_deref() == Some(entry.model.as_str())
                    && req.filter.as_ref().map_or(true, |f| f.matches(r))
            })
        })
    }

    fn complete(&self, req: &Arc<OpenRequest>, outcome: RequestOutcome) {
        {
            let mut slot = req.outcome.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        self.requests.remove(&req.id);
        *self
            .last_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
        req.done.notify_one();
    }

    fn release_pressure(&self, req: &Arc<OpenRequest>) {
        let entry = req
            .pressure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(entry) = entry {
            let remaining = entry.release(req.id);
            if remaining == 0 {
                self.pressure
                    .remove_if(&entry.model, |_, e| Arc::ptr_eq(e, &entry) && e.count() == 0);
            }
        }
    }

    fn check_stagnation(&self) {
        if self.requests.is_empty() {
            *self
                .last_progress
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Instant::now();
            return;
        }
        let stalled = self
            .last_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            > self.registry.config().max_timeout();
        if !stalled {
            return;
        }

        let now = tokio::time::Instant::now();
        let targets: Vec<Arc<OpenRequest>> = match self.registry.config().stall_action {
            crate::config::StallAction::FailAll => self.open_requests_ordered(),
            crate::config::StallAction::FailExpired => self
                .open_requests_ordered()
                .into_iter()
                .filter(|r| r.deadline <= now)
                .collect(),
        };
        if targets.is_empty() {
            return;
        }
        warn!(
            count = targets.len(),
            "no request progress within the stagnation deadline; failing stalled requests"
        );
        for req in targets {
            let model = req.desired_model.clone();
            let holders = model
                .as_deref()
                .map(|m| self.registry.holders_of(m))
                .unwrap_or(0);
            self.complete(
                &req,
                RequestOutcome::Failed(OrchestratorError::Timeout { model, holders }),
            );
        }
    }

    fn drain_on_shutdown(&self) {
        let open = self.open_requests_ordered();
        if !open.is_empty() {
            info!(count = open.len(), "cancelling open requests for shutdown");
        }
        for req in open {
            self.complete(&req, RequestOutcome::Cancelled);
        }
    }

    /// Queue a request and wait for the scheduler to satisfy it.
    ///
    /// Returns `Ok(Some(access))` with a reserved usage slot, `Ok(None)` on
    /// cancellation, and an error on failure or timeout. Any pressure the
    /// request registered is released on every exit path.
    pub async fn get_next_backend(
        &self,
        opts: AcquireOptions,
    ) -> Result<Option<BackendAccess>, OrchestratorError> {
        if self.registry.is_shutting_down() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let AcquireOptions {
            max_wait,
            desired_model,
            filter,
            session,
            notify_will_load,
            cancel,
        } = opts;

        let cancel = cancel
            .map(|t| t.child_token())
            .or_else(|| session.as_ref().map(|s| s.cancel_token().child_token()))
            .unwrap_or_default();
        let _wait_claim = session
            .as_ref()
            .map(|s| s.claim(SessionCounters::waiting_backends(1)));

        let per_request = self.registry.config().per_request_timeout();
        let wait = max_wait.unwrap_or(per_request).min(per_request);
        let deadline = tokio::time::Instant::now() + wait;

        let id = self.request_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let req = Arc::new(OpenRequest {
            id,
            desired_model: desired_model.clone(),
            filter,
            session,
            notify_will_load: StdMutex::new(notify_will_load),
            cancel: cancel.clone(),
            deadline,
            pressure: StdMutex::new(None),
            outcome: StdMutex::new(None),
            done: Notify::new(),
        });
        self.requests.insert(id, req.clone());
        debug!(request = id, model = ?desired_model, "queued backend request");
        self.wake.notify_one();

        let result = loop {
            tokio::select! {
                _ = req.done.notified() => {}
                _ = cancel.cancelled() => {}
                _ = self.registry.shutdown_token().cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let mut slot = req.outcome.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(outcome) = slot.take() {
                break match outcome {
                    RequestOutcome::Acquired(access) => Ok(Some(access)),
                    RequestOutcome::Failed(err) => Err(err),
                    RequestOutcome::Cancelled => Ok(None),
                };
            }
            if cancel.is_cancelled() || self.registry.shutdown_token().is_cancelled() {
                // Block a late completion from leaking a claimed slot.
                *slot = Some(RequestOutcome::Cancelled);
                break Ok(None);
            }
            if tokio::time::Instant::now() >= deadline {
                *slot = Some(RequestOutcome::Cancelled);
                let holders = desired_model
                    .as_deref()
                    .map(|m| self.registry.holders_of(m))
                    .unwrap_or(0);
                break Err(OrchestratorError::Timeout {
                    model: desired_model.clone(),
                    holders,
                });
            }
        };

        self.requests.remove(&id);
        self.release_pressure(&req);
        self.wake.notify_one();
        result
    }
}

/// The committed load itself, run outside the scheduler tick: wait for the
/// chosen backend to drain, swap the model, then publish the outcome.
fn spawn_model_load(
    registry: Arc<BackendRegistry>,
    entry: Arc<PressureEntry>,
    chosen: Arc<BackendRecord>,
    claims: Vec<SessionClaim>,
) {
    tokio::spawn(async move {
        let wait_start = Instant::now();
        let mut slow_logged = false;
        while chosen.usages() > 0 {
            if !slow_logged && wait_start.elapsed() > Duration::from_secs(1) {
                debug!(
                    backend = chosen.id,
                    model = %entry.model,
                    "model load still waiting for in-flight generations"
                );
                slow_logged = true;
            }
            tokio::time::sleep(MODEL_LOAD_POLL).await;
        }

        // Give the worker a chance to drop cached weights before the swap.
        if let Err(err) = chosen.driver().free_memory().await {
            debug!(backend = chosen.id, error = %err, "pre-load free_memory failed");
        }

        info!(backend = chosen.id, model = %entry.model, "loading model");
        let loaded = match chosen.driver().load_model(&entry.model).await {
            Ok(ok) => ok,
            Err(err) => {
                warn!(backend = chosen.id, model = %entry.model, error = %err, "model load errored");
                false
            }
        };
        if loaded {
            chosen.set_current_model(Some(entry.model.clone()));
        }

        {
            let _guard = entry.locker.lock().await;
            chosen.set_reserve_model_load(false);
            entry.set_loading(false);
            if chosen.current_model().as_deref() != Some(entry.model.as_str()) {
                entry.add_bad_backend(chosen.id);
                warn!(
                    backend = chosen.id,
                    model = %entry.model,
                    "backend did not end up with the model; excluded from further attempts"
                );
            }
        }
        drop(claims);
        registry.recompute_loaded_models();
    });
}
