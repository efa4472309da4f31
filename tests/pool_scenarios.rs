//! End-to-end scenarios for the backend pool: dispatch, model swaps under
//! pressure, failure fan-out, cancellation, clean edits and shutdown.

mod common;

use common::{ensure_model, start_pool, Behavior, TestPool};
use genhive::{
    AcquireOptions, OrchestratorConfig, OrchestratorError, SessionCounters, StallAction,
    Session,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn two_backend_pool() -> TestPool {
    start_pool(
        OrchestratorConfig::default(),
        vec![Behavior::arc(), Behavior::arc()],
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn single_request_claims_idle_backend() {
    let pool = start_pool(OrchestratorConfig::default(), vec![Behavior::arc()]).await;
    ensure_model(&pool, pool.ids[0], "model-m").await;

    let access = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(10)),
            ..AcquireOptions::for_model("model-m")
        })
        .await
        .unwrap()
        .expect("request was not cancelled");

    let record = pool.orchestrator.registry().record(pool.ids[0]).unwrap();
    assert_eq!(access.backend_id(), pool.ids[0]);
    assert_eq!(record.usages(), 1);

    access.release();
    assert_eq!(record.usages(), 0);
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pressure_swaps_model_on_lru_backend() {
    let pool = two_backend_pool().await;
    // Both backends hold model-a; backend 0 released earliest, so it is the
    // LRU eviction candidate.
    ensure_model(&pool, pool.ids[0], "model-a").await;
    ensure_model(&pool, pool.ids[1], "model-a").await;

    let notified = Arc::new(AtomicBool::new(false));
    let notified_hook = notified.clone();
    let access = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(60)),
            notify_will_load: Some(Box::new(move || {
                notified_hook.store(true, Ordering::SeqCst);
            })),
            ..AcquireOptions::for_model("model-b")
        })
        .await
        .unwrap()
        .expect("request was not cancelled");

    assert_eq!(access.backend_id(), pool.ids[0]);
    assert!(notified.load(Ordering::SeqCst));

    let swapped = pool.orchestrator.registry().record(pool.ids[0]).unwrap();
    let untouched = pool.orchestrator.registry().record(pool.ids[1]).unwrap();
    assert_eq!(swapped.current_model().as_deref(), Some("model-b"));
    assert_eq!(untouched.current_model().as_deref(), Some("model-a"));
    assert_eq!(pool.behaviors[0].loads.lock().unwrap().as_slice(), ["model-a", "model-b"]);
    assert_eq!(pool.behaviors[1].loads.lock().unwrap().as_slice(), ["model-a"]);

    access.release();
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_same_model_requests_amortizes_one_load() {
    let pool = two_backend_pool().await;
    ensure_model(&pool, pool.ids[0], "model-a").await;
    ensure_model(&pool, pool.ids[1], "model-a").await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let orchestrator = pool.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            let access = orchestrator
                .get_next_backend(AcquireOptions {
                    max_wait: Some(Duration::from_secs(300)),
                    ..AcquireOptions::for_model("model-b")
                })
                .await
                .unwrap()
                .expect("request was not cancelled");
            let backend = access.backend_id();
            tokio::time::sleep(Duration::from_millis(5)).await;
            access.release();
            backend
        }));
    }

    let mut served_by = Vec::new();
    for task in tasks {
        served_by.push(task.await.unwrap());
    }

    // Exactly one load of model-b was issued, and every request serialized
    // onto that one backend.
    let total_b_loads: usize = pool
        .behaviors
        .iter()
        .map(|b| b.loads_of("model-b"))
        .sum();
    assert_eq!(total_b_loads, 1);
    assert!(served_by.iter().all(|&b| b == served_by[0]));

    let other = if served_by[0] == pool.ids[0] {
        pool.ids[1]
    } else {
        pool.ids[0]
    };
    let other_record = pool.orchestrator.registry().record(other).unwrap();
    assert_eq!(other_record.current_model().as_deref(), Some("model-a"));

    for id in &pool.ids {
        assert_eq!(pool.orchestrator.registry().record(*id).unwrap().usages(), 0);
    }
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn all_candidates_failing_a_model_fails_the_requests() {
    let pool = two_backend_pool().await;
    for behavior in &pool.behaviors {
        behavior.failing_models.lock().unwrap().push("model-x".into());
    }

    let err = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(120)),
            ..AcquireOptions::for_model("model-x")
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::AllBackendsFailedModel { ref model } if model == "model-x"
    ));
    assert!(pool.orchestrator.scheduler().pressure_for("model-x").is_none());
    assert_eq!(pool.behaviors[0].loads_of("model-x"), 0);
    assert_eq!(pool.behaviors[1].loads_of("model-x"), 0);
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_wait_clears_pressure() {
    let pool = start_pool(
        OrchestratorConfig::default(),
        vec![Arc::new(Behavior {
            can_load_models: false,
            ..Behavior::default()
        })],
    )
    .await;

    let cancel = CancellationToken::new();
    let orchestrator = pool.orchestrator.clone();
    let waiter_cancel = cancel.clone();
    let waiter = tokio::spawn(async move {
        orchestrator
            .get_next_backend(AcquireOptions {
                max_wait: Some(Duration::from_secs(60)),
                cancel: Some(waiter_cancel),
                ..AcquireOptions::for_model("model-rare")
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let entry = pool
        .orchestrator
        .scheduler()
        .pressure_for("model-rare")
        .expect("pressure should be registered while waiting");
    assert_eq!(entry.count(), 1);

    cancel.cancel();
    let result = waiter.await.unwrap().unwrap();
    assert!(result.is_none(), "cancelled request must return nil");
    assert!(pool.orchestrator.scheduler().pressure_for("model-rare").is_none());
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn edit_drains_before_replacing_settings() {
    let pool = start_pool(OrchestratorConfig::default(), vec![Behavior::arc()]).await;
    let id = pool.ids[0];

    let held = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(10)),
            ..AcquireOptions::any_backend()
        })
        .await
        .unwrap()
        .expect("request was not cancelled");

    let registry = pool.orchestrator.registry().clone();
    let edit = tokio::spawn(async move {
        registry
            .edit_by_id(id, Default::default(), Some("renamed".into()), None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = pool.orchestrator.registry().record(id).unwrap();
    assert!(record.reserved(), "drain must reserve the backend");

    // No acquisition succeeds between the reserve and the re-init.
    let refused = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_millis(300)),
            ..AcquireOptions::any_backend()
        })
        .await;
    assert!(refused.is_err());

    held.release();
    let edited = edit.await.unwrap().unwrap();
    assert_eq!(edited.title(), "renamed");
    assert_eq!(edited.mod_count(), 1);
    assert_eq!(edited.status(), genhive::BackendStatus::Running);

    let after = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(10)),
            ..AcquireOptions::any_backend()
        })
        .await
        .unwrap();
    assert!(after.is_some());
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_reports_model_holders() {
    let pool = start_pool(OrchestratorConfig::default(), vec![Behavior::arc()]).await;
    ensure_model(&pool, pool.ids[0], "model-a").await;

    let held = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(10)),
            ..AcquireOptions::for_model("model-a")
        })
        .await
        .unwrap()
        .expect("request was not cancelled");

    let err = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_millis(500)),
            ..AcquireOptions::for_model("model-a")
        })
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Timeout { model, holders } => {
            assert_eq!(model.as_deref(), Some("model-a"));
            assert_eq!(holders, 1);
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    held.release();
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn redirect_is_honored_exactly_once() {
    let pool = two_backend_pool().await;
    ensure_model(&pool, pool.ids[0], "model-a").await;
    pool.behaviors[0].redirect_next.store(true, Ordering::SeqCst);

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let completed = pool
        .orchestrator
        .run_generation(
            AcquireOptions {
                max_wait: Some(Duration::from_secs(60)),
                ..AcquireOptions::for_model("model-a")
            },
            &json!({"prompt": "a field of tulips"}),
            events_tx,
        )
        .await
        .unwrap();

    assert!(completed);
    // The redirecting backend produced nothing; the second backend loaded
    // the model and served the generation.
    assert_eq!(pool.behaviors[0].generations.load(Ordering::SeqCst), 0);
    assert_eq!(pool.behaviors[1].generations.load(Ordering::SeqCst), 1);
    assert_eq!(pool.behaviors[1].loads_of("model-a"), 1);

    let mut saw_image = false;
    while let Ok(event) = events_rx.try_recv() {
        if matches!(event, genhive::GenerationEvent::Image { .. }) {
            saw_image = true;
        }
    }
    assert!(saw_image);
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_redirect_is_a_normal_failure() {
    let pool = two_backend_pool().await;
    ensure_model(&pool, pool.ids[0], "model-a").await;
    pool.behaviors[0].redirect_next.store(true, Ordering::SeqCst);
    pool.behaviors[1].redirect_next.store(true, Ordering::SeqCst);

    let (events_tx, _events_rx) = mpsc::channel(16);
    let err = pool
        .orchestrator
        .run_generation(
            AcquireOptions {
                max_wait: Some(Duration::from_secs(60)),
                ..AcquireOptions::for_model("model-a")
            },
            &json!({"prompt": "a field of tulips"}),
            events_tx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Generation(_)));

    for id in &pool.ids {
        assert_eq!(pool.orchestrator.registry().record(*id).unwrap().usages(), 0);
    }
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent_and_signals_open_requests() {
    let pool = start_pool(
        OrchestratorConfig::default(),
        vec![Arc::new(Behavior {
            can_load_models: false,
            ..Behavior::default()
        })],
    )
    .await;

    let orchestrator = pool.orchestrator.clone();
    let waiter = tokio::spawn(async move {
        orchestrator
            .get_next_backend(AcquireOptions {
                max_wait: Some(Duration::from_secs(300)),
                ..AcquireOptions::for_model("model-nowhere")
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.orchestrator.shutdown().await;
    let result = waiter.await.unwrap().unwrap();
    assert!(result.is_none(), "open request must be signalled on shutdown");

    let refused = pool
        .orchestrator
        .get_next_backend(AcquireOptions::any_backend())
        .await;
    assert!(matches!(refused, Err(OrchestratorError::ShuttingDown)));

    // Second shutdown is a no-op.
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stagnation_fail_all_sweeps_open_requests() {
    let pool = start_pool(
        OrchestratorConfig {
            max_timeout_minutes: 0,
            stall_action: StallAction::FailAll,
            ..Default::default()
        },
        vec![Arc::new(Behavior {
            can_load_models: false,
            ..Behavior::default()
        })],
    )
    .await;

    let err = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(3000)),
            ..AcquireOptions::for_model("model-nowhere")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout { .. }));
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stagnation_fail_expired_spares_fresh_requests() {
    let pool = start_pool(
        OrchestratorConfig {
            max_timeout_minutes: 0,
            stall_action: StallAction::FailExpired,
            ..Default::default()
        },
        vec![Arc::new(Behavior {
            can_load_models: false,
            ..Behavior::default()
        })],
    )
    .await;

    let cancel = CancellationToken::new();
    let orchestrator = pool.orchestrator.clone();
    let waiter_cancel = cancel.clone();
    let waiter = tokio::spawn(async move {
        orchestrator
            .get_next_backend(AcquireOptions {
                max_wait: Some(Duration::from_secs(600)),
                cancel: Some(waiter_cancel),
                ..AcquireOptions::for_model("model-nowhere")
            })
            .await
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        pool.orchestrator.scheduler().open_request_count(),
        1,
        "unexpired request must survive the stall sweep"
    );

    cancel.cancel();
    assert!(waiter.await.unwrap().unwrap().is_none());
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn session_counters_track_wait_and_load() {
    let behaviors = vec![
        Arc::new(Behavior {
            load_delay: Duration::from_secs(5),
            ..Behavior::default()
        }),
        Arc::new(Behavior {
            load_delay: Duration::from_secs(5),
            ..Behavior::default()
        }),
    ];
    let pool = start_pool(OrchestratorConfig::default(), behaviors).await;
    ensure_model(&pool, pool.ids[0], "model-a").await;
    ensure_model(&pool, pool.ids[1], "model-a").await;

    let session = Session::new();
    let orchestrator = pool.orchestrator.clone();
    let task_session = session.clone();
    let waiter = tokio::spawn(async move {
        orchestrator
            .get_next_backend(AcquireOptions {
                max_wait: Some(Duration::from_secs(120)),
                session: Some(task_session),
                ..AcquireOptions::for_model("model-b")
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.counters().waiting_backends, 1);
    assert_eq!(session.counters().loading_models, 0);

    // Past the pressure-defer window the load is committed and running.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(session.counters().loading_models, 1);
    assert_eq!(session.counters().waiting_backends, 1);

    let access = waiter.await.unwrap().unwrap().expect("not cancelled");
    access.release();
    assert_eq!(session.counters(), SessionCounters::default());
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn max_usages_bounds_concurrent_claims() {
    let pool = start_pool(
        OrchestratorConfig::default(),
        vec![Arc::new(Behavior {
            max_usages: 2,
            ..Behavior::default()
        })],
    )
    .await;

    let first = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(10)),
            ..AcquireOptions::any_backend()
        })
        .await
        .unwrap()
        .unwrap();
    let second = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_secs(10)),
            ..AcquireOptions::any_backend()
        })
        .await
        .unwrap()
        .unwrap();

    let record = pool.orchestrator.registry().record(pool.ids[0]).unwrap();
    assert_eq!(record.usages(), 2);

    let third = pool
        .orchestrator
        .get_next_backend(AcquireOptions {
            max_wait: Some(Duration::from_millis(300)),
            ..AcquireOptions::any_backend()
        })
        .await;
    assert!(matches!(third, Err(OrchestratorError::Timeout { .. })));

    first.release();
    second.release();
    assert_eq!(record.usages(), 0);
    pool.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_events_follow_model_loads() {
    let pool = start_pool(OrchestratorConfig::default(), vec![Behavior::arc()]).await;
    let mut refresh = pool.orchestrator.registry().subscribe_refresh();

    ensure_model(&pool, pool.ids[0], "model-a").await;

    let mut saw_model = false;
    while let Ok(event) = refresh.try_recv() {
        if event.loaded_models.contains("model-a") {
            saw_model = true;
        }
    }
    assert!(saw_model, "refresh broadcast should carry the loaded model");
    assert!(pool
        .orchestrator
        .registry()
        .loaded_models()
        .contains("model-a"));
    pool.orchestrator.shutdown().await;
}
