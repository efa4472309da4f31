//! Per-backend mutable state.
//!
//! A [`BackendRecord`] is shared between the registry, the scheduler and any
//! in-flight [`BackendAccess`](crate::scheduler::BackendAccess) handles.
//! Scheduling-relevant state lives in atomics so the scheduler can snapshot
//! the pool without locks; low-frequency fields (title, settings, catalog)
//! sit behind `std::sync::RwLock`.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;

use crate::driver::{BackendDriver, BackendSettings, BackendType, ModelCategory};

/// Signed backend identity. Non-negative ids are real (persisted,
/// user-visible); negative ids are nonreal (ephemeral, never persisted).
pub type BackendId = i64;

/// Lifecycle status of a backend record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BackendStatus {
    Disabled = 0,
    Waiting = 1,
    Loading = 2,
    Idle = 3,
    Running = 4,
    Errored = 5,
}

impl BackendStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BackendStatus::Disabled,
            1 => BackendStatus::Waiting,
            2 => BackendStatus::Loading,
            3 => BackendStatus::Idle,
            5 => BackendStatus::Errored,
            _ => BackendStatus::Running,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Read-only view of a record for admin surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: BackendId,
    pub type_id: String,
    pub title: String,
    pub status: BackendStatus,
    pub enabled: bool,
    pub current_model: Option<String>,
    pub usages: u32,
    pub max_usages: u32,
    pub features: Vec<String>,
    pub init_attempts: u32,
    pub mod_count: u64,
}

pub struct BackendRecord {
    pub id: BackendId,
    pub back_type: Arc<BackendType>,
    driver: RwLock<Arc<dyn BackendDriver>>,
    status: AtomicU8,
    usages: AtomicU32,
    max_usages: AtomicU32,
    reserved: AtomicBool,
    reserve_model_load: AtomicBool,
    enabled: AtomicBool,
    init_attempts: AtomicU32,
    mod_count: AtomicU64,
    /// Milliseconds since the registry epoch; updated on claim and release.
    /// LRU tie-breaking during model-swap selection reads this.
    time_last_release: AtomicU64,
    epoch: Instant,
    current_model: RwLock<Option<String>>,
    title: RwLock<String>,
    settings: RwLock<BackendSettings>,
    features: RwLock<HashSet<String>>,
    model_catalog: RwLock<HashMap<ModelCategory, Vec<String>>>,
    last_error: RwLock<Option<String>>,
}

impl BackendRecord {
    pub(crate) fn new(
        id: BackendId,
        back_type: Arc<BackendType>,
        driver: Arc<dyn BackendDriver>,
        title: String,
        settings: BackendSettings,
        enabled: bool,
        epoch: Instant,
    ) -> Self {
        let initial = if enabled {
            BackendStatus::Waiting
        } else {
            BackendStatus::Disabled
        };
        let max_usages = driver.max_usages().max(1);
        Self {
            id,
            back_type,
            driver: RwLock::new(driver),
            status: AtomicU8::new(initial as u8),
            usages: AtomicU32::new(0),
            max_usages: AtomicU32::new(max_usages),
            reserved: AtomicBool::new(false),
            reserve_model_load: AtomicBool::new(false),
            enabled: AtomicBool::new(enabled),
            init_attempts: AtomicU32::new(0),
            mod_count: AtomicU64::new(0),
            time_last_release: AtomicU64::new(epoch.elapsed().as_millis() as u64),
            epoch,
            current_model: RwLock::new(None),
            title: RwLock::new(title),
            settings: RwLock::new(settings),
            features: RwLock::new(HashSet::new()),
            model_catalog: RwLock::new(HashMap::new()),
            last_error: RwLock::new(None),
        }
    }

    /// True for persisted, user-visible records; false for ephemeral ones.
    pub fn is_real(&self) -> bool {
        self.id >= 0
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: BackendStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn usages(&self) -> u32 {
        self.usages.load(Ordering::Acquire)
    }

    pub fn max_usages(&self) -> u32 {
        self.max_usages.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_usages(&self, max: u32) {
        self.max_usages.store(max.max(1), Ordering::Release);
    }

    pub fn reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    pub(crate) fn set_reserved(&self, reserved: bool) {
        self.reserved.store(reserved, Ordering::Release);
    }

    pub fn reserve_model_load(&self) -> bool {
        self.reserve_model_load.load(Ordering::Acquire)
    }

    pub(crate) fn set_reserve_model_load(&self, reserve: bool) {
        self.reserve_model_load.store(reserve, Ordering::Release);
    }

    pub fn init_attempts(&self) -> u32 {
        self.init_attempts.load(Ordering::Acquire)
    }

    pub(crate) fn bump_init_attempts(&self) -> u32 {
        self.init_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_init_attempts(&self) {
        self.init_attempts.store(0, Ordering::Release);
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    pub(crate) fn bump_mod_count(&self) {
        self.mod_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Milliseconds since the registry epoch at the last claim or release.
    pub fn time_last_release(&self) -> u64 {
        self.time_last_release.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.time_last_release
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }

    pub fn driver(&self) -> Arc<dyn BackendDriver> {
        read(&self.driver).clone()
    }

    pub(crate) fn replace_driver(&self, driver: Arc<dyn BackendDriver>) {
        self.set_max_usages(driver.max_usages());
        *write(&self.driver) = driver;
    }

    pub fn can_load_models(&self) -> bool {
        self.driver().can_load_models()
    }

    pub fn current_model(&self) -> Option<String> {
        read(&self.current_model).clone()
    }

    /// Only the committed model-load task calls this, while
    /// `reserve_model_load` is set and usages are drained to zero.
    pub(crate) fn set_current_model(&self, model: Option<String>) {
        debug_assert!(self.reserve_model_load() || self.usages() == 0);
        *write(&self.current_model) = model;
    }

    pub fn title(&self) -> String {
        read(&self.title).clone()
    }

    pub(crate) fn set_title(&self, title: String) {
        *write(&self.title) = title;
    }

    pub fn settings(&self) -> BackendSettings {
        read(&self.settings).clone()
    }

    pub(crate) fn set_settings(&self, settings: BackendSettings) {
        *write(&self.settings) = settings;
    }

    pub fn features(&self) -> HashSet<String> {
        read(&self.features).clone()
    }

    pub fn supports_feature(&self, feature: &str) -> bool {
        read(&self.features).contains(feature)
    }

    pub(crate) fn set_features(&self, features: HashSet<String>) {
        *write(&self.features) = features;
    }

    pub fn model_catalog(&self) -> HashMap<ModelCategory, Vec<String>> {
        read(&self.model_catalog).clone()
    }

    pub(crate) fn set_model_catalog(&self, catalog: HashMap<ModelCategory, Vec<String>>) {
        *write(&self.model_catalog) = catalog;
    }

    pub fn last_error(&self) -> Option<String> {
        read(&self.last_error).clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        *write(&self.last_error) = error;
    }

    /// A backend is in use when it cannot accept another generation: either
    /// a model load has been committed to it, or every usage slot is taken.
    pub fn in_use(&self) -> bool {
        (self.reserve_model_load() || self.usages() >= self.max_usages())
            && self.status() == BackendStatus::Running
    }

    /// Atomically take one usage slot. Fails when the record is reserved,
    /// committed to a model load, not RUNNING, or already at `max_usages`.
    pub(crate) fn try_acquire_slot(&self) -> bool {
        if self.reserved()
            || self.reserve_model_load()
            || !self.enabled()
            || self.status() != BackendStatus::Running
        {
            return false;
        }
        loop {
            let current = self.usages.load(Ordering::Acquire);
            if current >= self.max_usages() {
                return false;
            }
            if self
                .usages
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // A reservation may have landed between the eligibility check
                // and the increment; back the slot out if so.
                if self.reserved() || self.reserve_model_load() {
                    self.usages.fetch_sub(1, Ordering::AcqRel);
                    return false;
                }
                self.touch();
                return true;
            }
        }
    }

    /// Return one usage slot. The caller signals the scheduler afterwards.
    pub(crate) fn release_slot(&self) {
        let previous = self.usages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "usage slot released twice");
        self.touch();
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let mut features: Vec<String> = self.features().into_iter().collect();
        features.sort();
        BackendSnapshot {
            id: self.id,
            type_id: self.back_type.id.clone(),
            title: self.title(),
            status: self.status(),
            enabled: self.enabled(),
            current_model: self.current_model(),
            usages: self.usages(),
            max_usages: self.max_usages(),
            features,
            init_attempts: self.init_attempts(),
            mod_count: self.mod_count(),
        }
    }
}

impl std::fmt::Debug for BackendRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRecord")
            .field("id", &self.id)
            .field("type", &self.back_type.id)
            .field("status", &self.status())
            .field("usages", &self.usages())
            .field("current_model", &self.current_model())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverHandshake, GenerationEvent, GenerationInput, SettingField};
    use crate::error::{GenerateError, InitError};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct NullDriver {
        max_usages: u32,
    }

    #[async_trait]
    impl BackendDriver for NullDriver {
        async fn init(&self) -> Result<DriverHandshake, InitError> {
            Ok(DriverHandshake::default())
        }

        async fn shutdown_now(&self) {}

        async fn load_model(&self, _model: &str) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn generate_live(
            &self,
            _input: &GenerationInput,
            _batch_id: Uuid,
            _events: mpsc::Sender<GenerationEvent>,
            _cancel: CancellationToken,
        ) -> Result<(), GenerateError> {
            Ok(())
        }

        fn max_usages(&self) -> u32 {
            self.max_usages
        }
    }

    fn record(max_usages: u32) -> BackendRecord {
        let ty = Arc::new(BackendType::new(
            "null",
            "Null",
            Vec::<SettingField>::new(),
            true,
            move |_| Ok(Arc::new(NullDriver { max_usages: 1 }) as Arc<dyn BackendDriver>),
        ));
        BackendRecord::new(
            0,
            ty,
            Arc::new(NullDriver { max_usages }),
            "test".into(),
            BackendSettings::new(),
            true,
            Instant::now(),
        )
    }

    #[test]
    fn usage_slots_bounded_by_max() {
        let rec = record(2);
        rec.set_status(BackendStatus::Running);
        assert!(rec.try_acquire_slot());
        assert!(rec.try_acquire_slot());
        assert!(!rec.try_acquire_slot());
        assert_eq!(rec.usages(), 2);
        rec.release_slot();
        assert!(rec.try_acquire_slot());
    }

    #[test]
    fn reservation_blocks_acquisition() {
        let rec = record(1);
        rec.set_status(BackendStatus::Running);
        rec.set_reserved(true);
        assert!(!rec.try_acquire_slot());
        rec.set_reserved(false);
        assert!(rec.try_acquire_slot());
    }

    #[test]
    fn model_load_reservation_blocks_acquisition() {
        let rec = record(1);
        rec.set_status(BackendStatus::Running);
        rec.set_reserve_model_load(true);
        assert!(!rec.try_acquire_slot());
        assert_eq!(rec.usages(), 0);
        rec.set_reserve_model_load(false);
        assert!(rec.try_acquire_slot());
    }

    #[test]
    fn non_running_status_blocks_acquisition() {
        let rec = record(1);
        for status in [
            BackendStatus::Disabled,
            BackendStatus::Waiting,
            BackendStatus::Loading,
            BackendStatus::Errored,
        ] {
            rec.set_status(status);
            assert!(!rec.try_acquire_slot(), "acquired in {:?}", status);
        }
    }

    #[test]
    fn in_use_tracks_reservation_and_saturation() {
        let rec = record(1);
        rec.set_status(BackendStatus::Running);
        assert!(!rec.in_use());
        assert!(rec.try_acquire_slot());
        assert!(rec.in_use());
        rec.release_slot();
        assert!(!rec.in_use());
        rec.set_reserve_model_load(true);
        assert!(rec.in_use());
    }

    #[test]
    fn nonreal_ids_are_negative() {
        let rec = record(1);
        assert!(rec.is_real());
    }
}
