//! The driver seam between the orchestrator core and out-of-process
//! inference workers.
//!
//! A [`BackendDriver`] wraps exactly one worker process or remote endpoint.
//! The core treats it as opaque: spawn details, wire protocol and model
//! validation all live behind the trait. Each driver kind is described by a
//! [`BackendType`], which carries the settings schema the intake layer
//! renders and the factory the registry calls to build driver instances.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GenerateError, InitError};

/// Opaque generation input. The core never inspects it; the intake layer's
/// workflow builder produces it and the driver consumes it.
pub type GenerationInput = serde_json::Value;

/// Raw settings as submitted by the intake layer, keyed by schema field.
pub type BackendSettings = serde_json::Map<String, serde_json::Value>;

/// Model catalog category, as reported by a worker's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    Main,
    Vae,
    Lora,
    ControlNet,
    Embedding,
    Clip,
    Other,
}

/// What a driver reports once `init` succeeds: the feature set request
/// filters match against and the models the worker can see on disk.
#[derive(Debug, Clone, Default)]
pub struct DriverHandshake {
    pub features: HashSet<String>,
    pub models: HashMap<ModelCategory, Vec<String>>,
}

/// A progress record or finished image, in the order the worker produced
/// them.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Progress {
        /// Which image of the batch, when the worker reports per-image
        /// progress.
        batch_index: Option<u32>,
        /// Overall completion of the request, 0.0 to 1.0.
        overall: f32,
        /// Completion of the current step, 0.0 to 1.0.
        current: f32,
    },
    Image {
        batch_index: u32,
        data: Bytes,
        metadata: Option<serde_json::Value>,
    },
}

/// Capability set every backend driver must provide.
///
/// Methods take `&self`; drivers own whatever interior mutability their
/// worker handle needs. `generate_live` in particular must tolerate up to
/// `max_usages` concurrent calls.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Blocking bring-up. On success the driver is ready to serve.
    async fn init(&self) -> Result<DriverHandshake, InitError>;

    /// Cooperative teardown. Callable at any status, idempotent.
    async fn shutdown_now(&self);

    /// Swap the resident model. Returns whether the load succeeded; the
    /// driver performs any model-category validation itself. Never called
    /// while generations are in flight.
    async fn load_model(&self, model: &str) -> Result<bool>;

    /// Streaming generation. Events are delivered through `events` in worker
    /// order; the call returns once every output for the request has been
    /// sent or an error was raised. Cancellation of `cancel` must stop the
    /// stream promptly.
    async fn generate_live(
        &self,
        input: &GenerationInput,
        batch_id: Uuid,
        events: mpsc::Sender<GenerationEvent>,
        cancel: CancellationToken,
    ) -> Result<(), GenerateError>;

    /// Whether this driver can swap models at all.
    fn can_load_models(&self) -> bool {
        true
    }

    /// Upper bound on concurrent generations this worker serves.
    fn max_usages(&self) -> u32 {
        1
    }

    /// Drop cached weights without changing the resident model identity.
    async fn free_memory(&self) -> Result<()> {
        Ok(())
    }
}

/// Field type in a backend type's settings schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKind {
    Text,
    Integer,
    Decimal,
    Bool,
}

impl SettingKind {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            SettingKind::Text => value.is_string(),
            SettingKind::Integer => value.is_i64() || value.is_u64(),
            SettingKind::Decimal => value.is_number(),
            SettingKind::Bool => value.is_boolean(),
        }
    }
}

/// One enumerated field of a backend type's settings schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingField {
    /// Stable key in the settings map.
    pub key: String,
    /// Human-readable name for intake forms.
    pub name: String,
    pub kind: SettingKind,
    /// Value used when the field is absent from submitted settings.
    pub default: serde_json::Value,
}

impl SettingField {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        kind: SettingKind,
        default: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind,
            default,
        }
    }
}

type DriverFactory =
    Box<dyn Fn(&BackendSettings) -> Result<Arc<dyn BackendDriver>> + Send + Sync>;

/// Immutable descriptor of one backend kind.
pub struct BackendType {
    /// Stable id, referenced from persisted registry entries.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Enumerated settings schema.
    pub settings_schema: Vec<SettingField>,
    /// True when initialization is cheap enough to run inline on the adding
    /// task instead of through the init queue.
    pub can_load_fast: bool,
    factory: DriverFactory,
}

impl BackendType {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        settings_schema: Vec<SettingField>,
        can_load_fast: bool,
        factory: impl Fn(&BackendSettings) -> Result<Arc<dyn BackendDriver>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            settings_schema,
            can_load_fast,
            factory: Box::new(factory),
        }
    }

    /// Check submitted settings against the schema: unknown keys and type
    /// mismatches are refused.
    pub fn validate_settings(&self, settings: &BackendSettings) -> Result<(), String> {
        for (key, value) in settings {
            let Some(field) = self.settings_schema.iter().find(|f| &f.key == key) else {
                return Err(format!("unknown setting '{}' for backend type '{}'", key, self.id));
            };
            if !value.is_null() && !field.kind.accepts(value) {
                return Err(format!(
                    "setting '{}' expects {:?}, got {}",
                    key, field.kind, value
                ));
            }
        }
        Ok(())
    }

    /// Submitted settings merged over schema defaults.
    pub fn settings_with_defaults(&self, settings: &BackendSettings) -> BackendSettings {
        let mut merged = BackendSettings::new();
        for field in &self.settings_schema {
            merged.insert(field.key.clone(), field.default.clone());
        }
        for (key, value) in settings {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Build a driver instance for the given (validated) settings.
    pub(crate) fn create_driver(
        &self,
        settings: &BackendSettings,
    ) -> Result<Arc<dyn BackendDriver>> {
        (self.factory)(&self.settings_with_defaults(settings))
    }
}

impl fmt::Debug for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("can_load_fast", &self.can_load_fast)
            .finish()
    }
}
