//! Scoped handle over one reserved usage slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{BackendId, BackendRecord};
use crate::driver::{BackendDriver, GenerationEvent, GenerationInput};
use crate::error::GenerateError;

/// "I hold one usage slot on backend X."
///
/// Acquisition atomically incremented the record's usage count; dropping the
/// handle (or calling [`release`](Self::release)) returns the slot and wakes
/// the scheduler. Release happens exactly once no matter how many exit paths
/// run through it.
pub struct BackendAccess {
    record: Arc<BackendRecord>,
    wake: Arc<Notify>,
    released: AtomicBool,
}

impl BackendAccess {
    /// Try to take a usage slot on `record`. `None` when the record is
    /// reserved, committed to a model load, not RUNNING, or saturated.
    pub(crate) fn acquire(record: &Arc<BackendRecord>, wake: &Arc<Notify>) -> Option<Self> {
        record.try_acquire_slot().then(|| Self {
            record: record.clone(),
            wake: wake.clone(),
            released: AtomicBool::new(false),
        })
    }

    pub fn backend_id(&self) -> BackendId {
        self.record.id
    }

    pub fn record(&self) -> &Arc<BackendRecord> {
        &self.record
    }

    pub fn driver(&self) -> Arc<dyn BackendDriver> {
        self.record.driver()
    }

    /// Run a streaming generation on the held backend.
    pub async fn generate_live(
        &self,
        input: &GenerationInput,
        batch_id: Uuid,
        events: mpsc::Sender<GenerationEvent>,
        cancel: CancellationToken,
    ) -> Result<(), GenerateError> {
        self.driver()
            .generate_live(input, batch_id, events, cancel)
            .await
    }

    /// Return the usage slot. Safe to call more than once; only the first
    /// call has any effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.record.release_slot();
            self.wake.notify_one();
        }
    }
}

impl Drop for BackendAccess {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BackendAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendAccess")
            .field("backend", &self.record.id)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}
