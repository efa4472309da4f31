//! Per-connection sessions: status counters and collective interruption.
//!
//! A [`Session`] groups the requests of one client connection. The intake
//! layer reads its four counters verbatim for status reporting; the core
//! drives `waiting_backends` while a request waits and `loading_models`
//! while a committed model load runs on the session's behalf. A
//! [`SessionClaim`] is the scoped resource backing each contribution:
//! whatever it still holds is deducted when it drops.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The four counters exposed to the intake layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Requests parsed but not yet handed to the scheduler.
    pub waiting: u64,
    /// Model loads committed on this session's behalf.
    pub loading_models: u64,
    /// Requests waiting for a backend slot.
    pub waiting_backends: u64,
    /// Generations currently streaming.
    pub live: u64,
}

impl SessionCounters {
    pub fn waiting_backends(n: u64) -> Self {
        Self {
            waiting_backends: n,
            ..Default::default()
        }
    }

    pub fn loading_models(n: u64) -> Self {
        Self {
            loading_models: n,
            ..Default::default()
        }
    }

    fn add(&mut self, other: &SessionCounters) {
        self.waiting += other.waiting;
        self.loading_models += other.loading_models;
        self.waiting_backends += other.waiting_backends;
        self.live += other.live;
    }

    fn sub_saturating(&mut self, other: &SessionCounters) -> SessionCounters {
        let taken = SessionCounters {
            waiting: self.waiting.min(other.waiting),
            loading_models: self.loading_models.min(other.loading_models),
            waiting_backends: self.waiting_backends.min(other.waiting_backends),
            live: self.live.min(other.live),
        };
        self.waiting -= taken.waiting;
        self.loading_models -= taken.loading_models;
        self.waiting_backends -= taken.waiting_backends;
        self.live -= taken.live;
        taken
    }

    fn is_zero(&self) -> bool {
        *self == SessionCounters::default()
    }
}

pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    counters: Arc<Mutex<SessionCounters>>,
    cancel: Mutex<CancellationToken>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            counters: Arc::new(Mutex::new(SessionCounters::default())),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    fn counters_lock(&self) -> MutexGuard<'_, SessionCounters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the session's counters, eventually consistent with
    /// request transitions.
    pub fn counters(&self) -> SessionCounters {
        *self.counters_lock()
    }

    /// The session's current cancellation token. Claims save the token they
    /// were opened under, so an interrupt reaches every outstanding claim.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the cancellation source with a fresh one and fire the old
    /// one. Outstanding work observes cancellation through its saved token.
    pub fn interrupt(&self) {
        let old = {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        old.cancel();
    }

    /// Open a scoped claim contributing `counters` to the session totals.
    pub fn claim(&self, counters: SessionCounters) -> SessionClaim {
        let token = self.cancel_token();
        self.counters_lock().add(&counters);
        SessionClaim {
            session_counters: self.counters.clone(),
            held: Mutex::new(counters),
            token,
        }
    }
}

/// Scoped contribution to a session's counters. Completing deducts;
/// dropping auto-completes whatever remains.
pub struct SessionClaim {
    session_counters: Arc<Mutex<SessionCounters>>,
    held: Mutex<SessionCounters>,
    token: CancellationToken,
}

impl SessionClaim {
    /// The session token captured when the claim was opened.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn session_lock(&self) -> MutexGuard<'_, SessionCounters> {
        self.session_counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Grow the claim (and the session totals) by `counters`.
    pub fn extend(&self, counters: SessionCounters) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(&counters);
        self.session_lock().add(&counters);
    }

    /// Shrink the claim by up to `counters`, never below zero.
    pub fn complete(&self, counters: SessionCounters) {
        let taken = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sub_saturating(&counters);
        if !taken.is_zero() {
            self.session_lock().sub_saturating(&taken);
        }
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        let remaining = *self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !remaining.is_zero() {
            self.session_lock().sub_saturating(&remaining);
        }
    }
}
