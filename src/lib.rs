//! genhive: a front-end orchestrator multiplexing concurrent
//! image-generation requests across a heterogeneous pool of GPU-bound
//! worker backends.
//!
//! A backend holds at most one model resident at a time and serves a bounded
//! number of simultaneous generations. The core accepts per-request model
//! and capability constraints, matches them against the running pool, and
//! when nothing matches aggregates the demand per model and commits at most
//! one backend per scheduling pass to an expensive model swap.
//!
//! The intake surface (HTTP/WebSocket handling, workflow construction,
//! image encoding) lives outside this crate; it talks to the core through
//! [`Orchestrator::get_next_backend`] and the [`driver::BackendDriver`]
//! seam.

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod session;

pub use backend::{
    BackendId, BackendRecord, BackendRegistry, BackendSnapshot, BackendStatus, RefreshEvent,
};
pub use config::{OrchestratorConfig, StallAction};
pub use driver::{
    BackendDriver, BackendSettings, BackendType, DriverHandshake, GenerationEvent,
    GenerationInput, ModelCategory, SettingField, SettingKind,
};
pub use error::{GenerateError, InitError, OrchestratorError};
pub use orchestrator::Orchestrator;
pub use scheduler::{AcquireOptions, BackendAccess, RequestFilter, Scheduler};
pub use session::{Session, SessionClaim, SessionCounters};
