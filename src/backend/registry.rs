//! The registry owning the set of backend records.
//!
//! Assigns ids (non-negative = real and persisted, negative = nonreal and
//! ephemeral), persists configuration as JSON keyed by decimal id, runs the
//! clean-shutdown drain for edits and deletions, and broadcasts a refresh
//! event whenever the derived loaded-models view changes.

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::record::{BackendRecord, BackendStatus};
use crate::backend::BackendId;
use crate::config::{OrchestratorConfig, CLEAN_SHUTDOWN_POLL};
use crate::driver::{BackendSettings, BackendType};
use crate::error::OrchestratorError;

/// Broadcast whenever the loaded-models view is recomputed.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    /// Model names resident on RUNNING backends at recompute time.
    pub loaded_models: BTreeSet<String>,
}

/// Persisted form of one real backend record.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedBackend {
    #[serde(rename = "type")]
    type_id: String,
    title: String,
    enabled: bool,
    settings: BackendSettings,
}

pub struct BackendRegistry {
    config: OrchestratorConfig,
    types: HashMap<String, Arc<BackendType>>,
    records: DashMap<BackendId, Arc<BackendRecord>>,
    next_id: AtomicI64,
    next_nonreal_id: AtomicI64,
    epoch: Instant,
    init_queue: StdMutex<VecDeque<BackendId>>,
    init_signal: Notify,
    scheduler_wake: Arc<Notify>,
    refresh_tx: broadcast::Sender<RefreshEvent>,
    loaded_models: StdRwLock<BTreeSet<String>>,
    save_lock: Mutex<()>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl BackendRegistry {
    pub fn new(config: OrchestratorConfig, types: Vec<BackendType>) -> Arc<Self> {
        let types = types
            .into_iter()
            .map(|t| (t.id.clone(), Arc::new(t)))
            .collect();
        let (refresh_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            config,
            types,
            records: DashMap::new(),
            next_id: AtomicI64::new(0),
            next_nonreal_id: AtomicI64::new(-1),
            epoch: Instant::now(),
            init_queue: StdMutex::new(VecDeque::new()),
            init_signal: Notify::new(),
            scheduler_wake: Arc::new(Notify::new()),
            refresh_tx,
            loaded_models: StdRwLock::new(BTreeSet::new()),
            save_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Token cancelled once when the registry begins shutting down. Request
    /// cancellation tokens are children of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Signal shared with the scheduler loop; fired on any state change the
    /// scheduler should react to.
    pub(crate) fn scheduler_wake(&self) -> Arc<Notify> {
        self.scheduler_wake.clone()
    }

    pub(crate) fn wake_scheduler(&self) {
        self.scheduler_wake.notify_one();
    }

    pub fn backend_types(&self) -> Vec<Arc<BackendType>> {
        self.types.values().cloned().collect()
    }

    pub fn record(&self, id: BackendId) -> Option<Arc<BackendRecord>> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn all_records(&self) -> Vec<Arc<BackendRecord>> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn list(&self) -> Vec<crate::backend::BackendSnapshot> {
        let mut snapshots: Vec<_> = self.records.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Records of the given type that are RUNNING and not reserved.
    pub fn running_backends_of(&self, type_id: &str) -> Vec<Arc<BackendRecord>> {
        self.records
            .iter()
            .filter(|r| {
                r.back_type.id == type_id
                    && r.status() == BackendStatus::Running
                    && !r.reserved()
            })
            .map(|r| r.value().clone())
            .collect()
    }

    /// Union of supported features across non-errored backends.
    pub fn features(&self) -> HashSet<String> {
        let mut features = HashSet::new();
        for record in self.records.iter() {
            if record.status() != BackendStatus::Errored {
                features.extend(record.features());
            }
        }
        features
    }

    /// The derived "some backend has this model resident" view. Never a
    /// source of truth; recomputed after inits, loads and deletions.
    pub fn loaded_models(&self) -> BTreeSet<String> {
        self.loaded_models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subscribe_refresh(&self) -> broadcast::Receiver<RefreshEvent> {
        self.refresh_tx.subscribe()
    }

    pub(crate) fn recompute_loaded_models(&self) {
        let loaded: BTreeSet<String> = self
            .records
            .iter()
            .filter(|r| r.status() == BackendStatus::Running)
            .filter_map(|r| r.current_model())
            .collect();
        *self
            .loaded_models
            .write()
            .unwrap_or_else(|e| e.into_inner()) = loaded.clone();
        // Lagging receivers drop events; the registry never blocks on them.
        let _ = self.refresh_tx.send(RefreshEvent {
            loaded_models: loaded,
        });
        self.wake_scheduler();
    }

    /// Count of backends with `model` currently resident, for timeout
    /// diagnostics.
    pub fn holders_of(&self, model: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.current_model().as_deref() == Some(model))
            .count()
    }

    fn backend_type(&self, type_id: &str) -> Result<Arc<BackendType>, OrchestratorError> {
        self.types
            .get(type_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownBackendType(type_id.to_string()))
    }

    fn create_record(
        &self,
        id: BackendId,
        back_type: Arc<BackendType>,
        title: String,
        settings: BackendSettings,
        enabled: bool,
    ) -> Result<Arc<BackendRecord>, OrchestratorError> {
        back_type
            .validate_settings(&settings)
            .map_err(OrchestratorError::InvalidSettings)?;
        let driver = back_type
            .create_driver(&settings)
            .map_err(OrchestratorError::Other)?;
        let record = Arc::new(BackendRecord::new(
            id, back_type, driver, title, settings, enabled, self.epoch,
        ));
        self.records.insert(id, record.clone());
        Ok(record)
    }

    /// Add a real backend: fresh non-negative id, WAITING status, init
    /// enqueued (or run inline for fast-loading types), configuration saved.
    pub async fn add(
        &self,
        type_id: &str,
        title: impl Into<String>,
        settings: BackendSettings,
        enabled: bool,
    ) -> Result<Arc<BackendRecord>, OrchestratorError> {
        let back_type = self.backend_type(type_id)?;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let record = self.create_record(id, back_type, title.into(), settings, enabled)?;
        info!(backend = id, backend_type = type_id, "added backend");
        self.save().await?;
        self.start_init(&record).await;
        Ok(record)
    }

    /// Add an ephemeral backend: negative id, never persisted.
    pub async fn add_nonreal(
        &self,
        type_id: &str,
        title: impl Into<String>,
        settings: BackendSettings,
        enabled: bool,
    ) -> Result<Arc<BackendRecord>, OrchestratorError> {
        let back_type = self.backend_type(type_id)?;
        let id = self.next_nonreal_id.fetch_sub(1, Ordering::AcqRel);
        let record = self.create_record(id, back_type, title.into(), settings, enabled)?;
        info!(backend = id, backend_type = type_id, "added nonreal backend");
        self.start_init(&record).await;
        Ok(record)
    }

    async fn start_init(&self, record: &Arc<BackendRecord>) {
        if !record.enabled() {
            record.set_status(BackendStatus::Disabled);
            return;
        }
        if record.back_type.can_load_fast {
            crate::backend::init_worker::initialize_record(self, record).await;
        } else {
            self.enqueue_init(record.id);
        }
    }

    pub(crate) fn enqueue_init(&self, id: BackendId) {
        self.init_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(id);
        self.init_signal.notify_one();
    }

    pub(crate) fn pop_init(&self) -> Option<BackendId> {
        self.init_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub(crate) async fn wait_init_signal(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.init_signal.notified()).await;
    }

    /// Reserve the record, wait for in-flight generations to release, then
    /// tear the worker down. The reservation blocks new acquisitions for the
    /// whole drain.
    pub(crate) async fn drain_record(&self, record: &Arc<BackendRecord>) {
        record.set_reserved(true);
        self.wake_scheduler();
        while record.usages() > 0 {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(CLEAN_SHUTDOWN_POLL) => {}
            }
        }
        record.driver().shutdown_now().await;
    }

    /// Shut the backend down cleanly and remove it.
    pub async fn delete_by_id(&self, id: BackendId) -> Result<bool, OrchestratorError> {
        let Some(record) = self.record(id) else {
            return Ok(false);
        };
        info!(backend = id, "deleting backend");
        self.drain_record(&record).await;
        self.records.remove(&id);
        self.recompute_loaded_models();
        if record.is_real() {
            self.save().await?;
        }
        Ok(true)
    }

    /// Shut down cleanly, replace settings (validated first, so a refused
    /// edit leaves the running driver untouched), and re-enqueue init.
    pub async fn edit_by_id(
        &self,
        id: BackendId,
        settings: BackendSettings,
        title: Option<String>,
        enabled: Option<bool>,
    ) -> Result<Arc<BackendRecord>, OrchestratorError> {
        let record = self.record(id).ok_or(OrchestratorError::UnknownBackend(id))?;
        record
            .back_type
            .validate_settings(&settings)
            .map_err(OrchestratorError::InvalidSettings)?;
        let driver = record
            .back_type
            .create_driver(&settings)
            .map_err(OrchestratorError::Other)?;

        info!(backend = id, "editing backend");
        self.drain_record(&record).await;

        record.replace_driver(driver);
        record.set_settings(settings);
        if let Some(title) = title {
            record.set_title(title);
        }
        if let Some(enabled) = enabled {
            record.set_enabled(enabled);
        }
        record.bump_mod_count();
        record.reset_init_attempts();
        record.set_current_model(None);
        record.set_last_error(None);
        record.set_status(if record.enabled() {
            BackendStatus::Waiting
        } else {
            BackendStatus::Disabled
        });
        record.set_reserved(false);
        self.recompute_loaded_models();
        if record.is_real() {
            self.save().await?;
        }
        self.start_init(&record).await;
        Ok(record)
    }

    /// Clean-shutdown and re-init every record, one at a time.
    pub async fn reload_all(&self) -> Result<(), OrchestratorError> {
        let mut records = self.all_records();
        records.sort_by_key(|r| r.id);
        info!(count = records.len(), "reloading all backends");
        for record in records {
            self.drain_record(&record).await;
            record.reset_init_attempts();
            record.set_current_model(None);
            record.set_status(if record.enabled() {
                BackendStatus::Waiting
            } else {
                BackendStatus::Disabled
            });
            record.set_reserved(false);
            self.start_init(&record).await;
        }
        self.recompute_loaded_models();
        Ok(())
    }

    /// Read persisted configuration and enqueue initialization for every
    /// enabled record. On parse failure the file is left in place and the
    /// registry starts empty.
    pub async fn load(&self) -> Result<()> {
        let Some(path) = self.config.registry_path.clone() else {
            return Ok(());
        };
        if !path.exists() {
            debug!(path = %path.display(), "no persisted registry file");
            return Ok(());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading registry file {}", path.display()))?;
        let parsed: BTreeMap<String, PersistedBackend> = match serde_json::from_str(&contents) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), error = %err,
                      "registry file failed to parse; starting empty");
                return Ok(());
            }
        };

        let mut max_id: BackendId = -1;
        for (key, entry) in parsed {
            let id: BackendId = match key.parse() {
                Ok(id) if id >= 0 => id,
                _ => {
                    warn!(key = %key, "skipping registry entry with invalid id");
                    continue;
                }
            };
            let Some(back_type) = self.types.get(&entry.type_id).cloned() else {
                warn!(backend = id, backend_type = %entry.type_id,
                      "skipping registry entry with unknown backend type");
                continue;
            };
            // Reserve the id even when the entry cannot be instantiated, so
            // a later add() never collides with it.
            max_id = max_id.max(id);
            match self.create_record(id, back_type, entry.title, entry.settings, entry.enabled) {
                Ok(record) => {
                    if record.enabled() {
                        self.enqueue_init(id);
                    }
                }
                Err(err) => {
                    warn!(backend = id, error = %err, "skipping unloadable registry entry");
                }
            }
        }
        self.next_id.store(max_id + 1, Ordering::Release);
        info!(count = self.records.len(), "restored backend registry");
        Ok(())
    }

    /// Persist real records only, keyed by decimal id. Writes are serialized
    /// under the save lock.
    pub async fn save(&self) -> Result<(), OrchestratorError> {
        let Some(path) = self.config.registry_path.clone() else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let mut out: BTreeMap<String, PersistedBackend> = BTreeMap::new();
        for record in self.records.iter() {
            if !record.is_real() {
                continue;
            }
            out.insert(
                record.id.to_string(),
                PersistedBackend {
                    type_id: record.back_type.id.clone(),
                    title: record.title(),
                    enabled: record.enabled(),
                    settings: record.settings(),
                },
            );
        }
        let contents = serde_json::to_string_pretty(&out)
            .context("serializing registry")
            .map_err(OrchestratorError::Other)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("writing registry file {}", path.display()))
            .map_err(OrchestratorError::Other)?;
        debug!(path = %path.display(), count = out.len(), "saved backend registry");
        Ok(())
    }

    /// Fan `free_memory` out to idle RUNNING backends.
    pub async fn free_memory(&self) {
        let idle: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.status() == BackendStatus::Running && r.usages() == 0)
            .map(|r| r.value().clone())
            .collect();
        join_all(idle.iter().map(|r| async move {
            if let Err(err) = r.driver().free_memory().await {
                warn!(backend = r.id, error = %err, "free_memory failed");
            }
        }))
        .await;
    }

    /// Begin registry-wide shutdown: refuse new work, cancel outstanding
    /// request tokens, drain and tear down every backend. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("backend registry shutting down");
        for record in self.records.iter() {
            record.set_reserved(true);
        }
        self.shutdown.cancel();
        self.wake_scheduler();
        self.init_signal.notify_one();

        let records = self.all_records();
        join_all(records.iter().map(|record| async move {
            // Bounded grace period: request cancellation is already in
            // flight, so usage slots release quickly or not at all.
            let drain = async {
                while record.usages() > 0 {
                    tokio::time::sleep(CLEAN_SHUTDOWN_POLL).await;
                }
            };
            let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
            record.driver().shutdown_now().await;
        }))
        .await;
        info!("backend registry shut down");
    }
}
