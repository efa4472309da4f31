//! Error taxonomies for the orchestrator core.
//!
//! Three families: [`InitError`] for backend bring-up, [`GenerateError`] for
//! streaming generation, and [`OrchestratorError`] for everything the intake
//! layer can observe through [`crate::Orchestrator`].

use thiserror::Error;

use crate::backend::BackendId;

/// Failure modes of [`crate::driver::BackendDriver::init`].
#[derive(Debug, Error)]
pub enum InitError {
    /// The configuration is invalid. Do not retry; the backend goes to
    /// ERRORED immediately.
    #[error("backend configuration refused: {0}")]
    Refused(String),

    /// Network or process trouble. Retried up to
    /// `max_backend_init_attempts` with a one second backoff.
    #[error("transient backend init failure: {0}")]
    Transient(anyhow::Error),
}

impl InitError {
    /// Walk the source chain to the innermost cause and render it.
    pub fn root_cause(&self) -> String {
        match self {
            InitError::Refused(msg) => msg.clone(),
            InitError::Transient(err) => err.root_cause().to_string(),
        }
    }

    /// True when the innermost cause looks like a refused TCP connection,
    /// which usually means the worker process has not finished starting.
    pub fn is_connection_refused(&self) -> bool {
        self.root_cause().to_lowercase().contains("connection refused")
    }
}

/// Failure modes of [`crate::driver::BackendDriver::generate_live`].
#[derive(Debug, Error)]
pub enum GenerateError {
    /// The backend asks for the request to be retried against some other
    /// backend. Honored at most once per request.
    #[error("backend requested the generation be redirected to another backend")]
    PleaseRedirect,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced to the intake layer.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// There are no enabled backends at all, running or pending.
    #[error("no image generation backends are available")]
    NoBackendsAvailable,

    /// Backends exist but none satisfies the request filter.
    #[error("no available backend matches the request requirements")]
    NoMatchingBackend,

    /// Every backend capable of loading the model has failed to load it.
    #[error("all backends failed to load model '{model}'")]
    AllBackendsFailedModel { model: String },

    /// The request waited past its deadline. `holders` counts backends that
    /// currently have the requested model resident, for diagnostics.
    #[error("timed out waiting for a backend (requested model: {}, currently held by {holders} backend(s))",
            model.as_deref().unwrap_or("any"))]
    Timeout {
        model: Option<String>,
        holders: usize,
    },

    /// The registry is shutting down and refuses new work.
    #[error("the backend registry is shutting down")]
    ShuttingDown,

    #[error("unknown backend id {0}")]
    UnknownBackend(BackendId),

    #[error("unknown backend type '{0}'")]
    UnknownBackendType(String),

    /// Settings failed schema validation on add or edit.
    #[error("invalid backend settings: {0}")]
    InvalidSettings(String),

    /// A driver raised a generation failure that was not recoverable.
    #[error("generation failed: {0}")]
    Generation(#[source] GenerateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
