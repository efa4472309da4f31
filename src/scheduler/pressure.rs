//! Aggregated waiting demand per model name.
//!
//! A pressure entry is not a FIFO queue; it is a demand aggregator scored by
//! a heuristic. The scheduler uses the scores to decide which model is worth
//! an expensive swap, and the entry's `bad_backends` set records loaders
//! that already failed this model so retries rotate through the remaining
//! candidates.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::BackendId;
use crate::session::Session;

pub struct PressureEntry {
    pub model: String,
    pub first_request_time: Instant,
    count: AtomicU32,
    is_loading: AtomicBool,
    sessions: StdMutex<Vec<Arc<Session>>>,
    requests: StdMutex<HashSet<u64>>,
    bad_backends: StdMutex<HashSet<BackendId>>,
    /// Held across the model-swap commitment and `bad_backends` mutation.
    /// Never held across the load itself.
    pub(crate) locker: Mutex<()>,
}

impl PressureEntry {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            first_request_time: Instant::now(),
            count: AtomicU32::new(0),
            is_loading: AtomicBool::new(false),
            sessions: StdMutex::new(Vec::new()),
            requests: StdMutex::new(HashSet::new()),
            bad_backends: StdMutex::new(HashSet::new()),
            locker: Mutex::new(()),
        }
    }

    /// Scheduling priority: each waiting request is worth ten points, plus
    /// one point per second of age. Bursts of identical-model requests
    /// therefore amortize one load across the burst, and old demand beats
    /// young demand at equal size.
    pub fn score(&self, now: Instant) -> u64 {
        let age_secs = now
            .saturating_duration_since(self.first_request_time)
            .as_secs();
        self.count.load(Ordering::Acquire) as u64 * 10 + age_secs
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::Acquire)
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.is_loading.store(loading, Ordering::Release);
    }

    /// Attach a request (and its session) to this entry. Idempotent per
    /// request id; the count grows only on first registration.
    pub(crate) fn register(&self, request_id: u64, session: Option<&Arc<Session>>) -> bool {
        let fresh = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id);
        if !fresh {
            return false;
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        if let Some(session) = session {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if !sessions.iter().any(|s| s.id == session.id) {
                sessions.push(session.clone());
            }
        }
        true
    }

    /// Detach a request. Returns the count after the decrement.
    pub(crate) fn release(&self, request_id: u64) -> u32 {
        let removed = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        if removed {
            self.count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
        } else {
            self.count()
        }
    }

    pub fn request_ids(&self) -> Vec<u64> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn bad_backends(&self) -> HashSet<BackendId> {
        self.bad_backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn add_bad_backend(&self, id: BackendId) {
        self.bad_backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }
}

impl std::fmt::Debug for PressureEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureEntry")
            .field("model", &self.model)
            .field("count", &self.count())
            .field("is_loading", &self.is_loading())
            .finish()
    }
}
