//! Shared fixture for the end-to-end pool scenarios: a scripted in-process
//! driver whose init/load/generate behavior each test configures, plus a
//! helper that assembles an orchestrator around a set of them.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use genhive::{
    AcquireOptions, BackendDriver, BackendId, BackendSettings, BackendType, DriverHandshake,
    GenerateError, GenerationEvent, GenerationInput, InitError, ModelCategory, Orchestrator,
    OrchestratorConfig, RequestFilter,
};

/// Scripted behavior shared between a test and the driver instances built
/// from it.
pub struct Behavior {
    /// Fail init with a transient error this many times before succeeding.
    pub init_transient_failures: AtomicU32,
    /// Refuse init outright with this message.
    pub refuse_init: Mutex<Option<String>>,
    pub features: Vec<String>,
    pub catalog_models: Vec<String>,
    /// Models `load_model` reports failure for.
    pub failing_models: Mutex<Vec<String>>,
    pub load_delay: Duration,
    pub generation_delay: Duration,
    /// Every model name successfully handed to `load_model`, in order.
    pub loads: Mutex<Vec<String>>,
    pub generations: AtomicU32,
    /// When set, the next `generate_live` call asks for a redirect.
    pub redirect_next: AtomicBool,
    pub can_load_models: bool,
    pub max_usages: u32,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            init_transient_failures: AtomicU32::new(0),
            refuse_init: Mutex::new(None),
            features: vec!["txt2img".into()],
            catalog_models: vec!["model-a".into(), "model-b".into()],
            failing_models: Mutex::new(Vec::new()),
            load_delay: Duration::from_millis(10),
            generation_delay: Duration::from_millis(20),
            loads: Mutex::new(Vec::new()),
            generations: AtomicU32::new(0),
            redirect_next: AtomicBool::new(false),
            can_load_models: true,
            max_usages: 1,
        }
    }
}

impl Behavior {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn loads_of(&self, model: &str) -> usize {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == model)
            .count()
    }
}

pub struct ScriptedDriver {
    behavior: Arc<Behavior>,
}

#[async_trait]
impl BackendDriver for ScriptedDriver {
    async fn init(&self) -> Result<DriverHandshake, InitError> {
        if let Some(reason) = self.behavior.refuse_init.lock().unwrap().clone() {
            return Err(InitError::Refused(reason));
        }
        if self.behavior.init_transient_failures.load(Ordering::SeqCst) > 0 {
            self.behavior
                .init_transient_failures
                .fetch_sub(1, Ordering::SeqCst);
            return Err(InitError::Transient(anyhow::anyhow!(
                "connection refused (os error 111)"
            )));
        }
        let mut models = HashMap::new();
        models.insert(ModelCategory::Main, self.behavior.catalog_models.clone());
        Ok(DriverHandshake {
            features: self.behavior.features.iter().cloned().collect(),
            models,
        })
    }

    async fn shutdown_now(&self) {}

    async fn load_model(&self, model: &str) -> anyhow::Result<bool> {
        tokio::time::sleep(self.behavior.load_delay).await;
        if self
            .behavior
            .failing_models
            .lock()
            .unwrap()
            .iter()
            .any(|m| m == model)
        {
            return Ok(false);
        }
        self.behavior.loads.lock().unwrap().push(model.to_string());
        Ok(true)
    }

    async fn generate_live(
        &self,
        _input: &GenerationInput,
        _batch_id: Uuid,
        events: mpsc::Sender<GenerationEvent>,
        cancel: CancellationToken,
    ) -> Result<(), GenerateError> {
        if self.behavior.redirect_next.swap(false, Ordering::SeqCst) {
            return Err(GenerateError::PleaseRedirect);
        }
        let _ = events
            .send(GenerationEvent::Progress {
                batch_index: None,
                overall: 0.0,
                current: 0.0,
            })
            .await;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.behavior.generation_delay) => {}
        }
        let _ = events
            .send(GenerationEvent::Image {
                batch_index: 0,
                data: Bytes::from_static(b"fake png"),
                metadata: None,
            })
            .await;
        self.behavior.generations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn can_load_models(&self) -> bool {
        self.behavior.can_load_models
    }

    fn max_usages(&self) -> u32 {
        self.behavior.max_usages
    }
}

pub struct TestPool {
    pub orchestrator: Arc<Orchestrator>,
    pub behaviors: Vec<Arc<Behavior>>,
    pub ids: Vec<BackendId>,
}

/// Build an orchestrator with one scripted backend per behavior. Backends
/// use fast-load types, so they are RUNNING by the time this returns.
pub async fn start_pool(config: OrchestratorConfig, behaviors: Vec<Arc<Behavior>>) -> TestPool {
    let types: Vec<BackendType> = behaviors
        .iter()
        .enumerate()
        .map(|(i, behavior)| {
            let behavior = behavior.clone();
            BackendType::new(
                format!("scripted-{i}"),
                "Scripted",
                Vec::new(),
                true,
                move |_| {
                    Ok(Arc::new(ScriptedDriver {
                        behavior: behavior.clone(),
                    }) as Arc<dyn BackendDriver>)
                },
            )
        })
        .collect();
    let orchestrator = Arc::new(Orchestrator::start(config, types).await.unwrap());
    let mut ids = Vec::new();
    for i in 0..behaviors.len() {
        let record = orchestrator
            .registry()
            .add(
                &format!("scripted-{i}"),
                format!("backend-{i}"),
                BackendSettings::new(),
                true,
            )
            .await
            .unwrap();
        ids.push(record.id);
    }
    TestPool {
        orchestrator,
        behaviors,
        ids,
    }
}

pub fn only_backend(id: BackendId) -> RequestFilter {
    RequestFilter::new(move |record| record.id == id)
}

/// Drive a model load onto a specific backend through the scheduler, then
/// release the claim. Nudges the clock afterwards so LRU stamps stay
/// distinct.
pub async fn ensure_model(pool: &TestPool, backend: BackendId, model: &str) {
    let access = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            desired_model: Some(model.to_string()),
            filter: Some(only_backend(backend)),
            max_wait: Some(Duration::from_secs(60)),
            ..Default::default()
        })
        .await
        .unwrap()
        .expect("model staging claim was cancelled");
    assert_eq!(access.backend_id(), backend);
    access.release();
    tokio::time::sleep(Duration::from_millis(25)).await;
}
