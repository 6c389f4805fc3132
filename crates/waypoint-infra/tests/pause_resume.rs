//! Pausing, resuming, cancelling and recovering flows.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;
use waypoint_core::flow::blueprint::{FlowBlueprintBuilder, FlowStep, PauseCondition};
use waypoint_core::flow::engine::StartRequest;
use waypoint_core::flow::handler::{StepError, StepOutput};
use waypoint_core::repository::flow::FlowRepository;
use waypoint_types::config::EngineConfig;
use waypoint_types::error::EngineError;
use waypoint_types::event::{FlowEventType, FlowNotification};
use waypoint_types::flow::{FlowInstance, FlowStatus, StepStatus};
use waypoint_types::resume::{PauseReason, ResumeConfig};

use common::{Harness, count, harness, harness_with_config, wait_for_status};

fn ok_step(name: &str) -> FlowStep {
    FlowStep::from_fn(name, |_ctx| async { Ok(StepOutput::new()) })
}

/// `approval` pauses at `review` under `resume`, then runs `publish`.
fn register_approval(h: &Harness, resume: ResumeConfig) {
    let blueprint = FlowBlueprintBuilder::new("approval")
        .step(ok_step("draft"))
        .step(
            FlowStep::from_fn("review", |_ctx| async {
                Ok(StepOutput::new().set("reviewed", true))
            })
            .pause_when(PauseCondition::always().reason(PauseReason::Approval))
            .resume_with(resume),
        )
        .step(ok_step("publish"))
        .build();
    h.engine.register(blueprint).unwrap();
}

async fn start_paused_approval(h: &Harness) -> FlowInstance {
    let result = h
        .engine
        .start("approval", BTreeMap::new(), "alice", None)
        .await
        .unwrap();
    assert!(result.is_paused(), "expected a pause, got {:?}", result.status);
    result.flow
}

#[tokio::test]
async fn pause_gate_stops_before_the_step_body() {
    let h = harness();
    register_approval(&h, ResumeConfig::manual().with_message("needs sign-off"));

    let flow = start_paused_approval(&h).await;

    assert_eq!(flow.current_step_name.as_deref(), Some("review"));
    assert_eq!(flow.steps[0].status, StepStatus::Succeeded);
    assert_eq!(flow.steps[1].status, StepStatus::Pending);
    assert!(flow.paused_at.is_some());
    let resume = flow.active_resume.as_ref().unwrap();
    assert_eq!(resume.message.as_deref(), Some("needs sign-off"));

    let stored = h.repo.load_flow(&flow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FlowStatus::Paused);
    assert!(!h.engine.runtime().is_active(&flow.id));
}

#[tokio::test]
async fn timeout_resume_fires_exactly_at_the_deadline() {
    let h = harness();
    register_approval(&h, ResumeConfig::after(Duration::from_secs(5)));
    let flow = start_paused_approval(&h).await;
    let paused_at = flow.paused_at.unwrap();
    let monitor = h.engine.pause_monitor();

    let early = monitor
        .check_once(paused_at + chrono::Duration::milliseconds(4_999))
        .await
        .unwrap();
    assert!(early.is_empty());
    assert_eq!(h.engine.status(flow.id, "alice").await.unwrap(), FlowStatus::Paused);

    let mut notifications = h.engine.subscribe();
    let sweep = monitor
        .check_once(paused_at + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(sweep.resumed, vec![flow.id]);

    let stored = h.engine.get(flow.id, "alice").await.unwrap();
    assert_eq!(stored.status, FlowStatus::Completed);
    assert_eq!(stored.data["reviewed"], json!(true));

    let mut statuses = Vec::new();
    while let Ok(note) = notifications.try_recv() {
        if let FlowNotification::StatusChanged { detail } = note {
            if detail.id == flow.id {
                statuses.push(detail.status);
            }
        }
    }
    assert_eq!(statuses.first(), Some(&FlowStatus::Running));
    assert_eq!(statuses.last(), Some(&FlowStatus::Completed));

    let events = h.engine.events(flow.id, "alice").await.unwrap();
    let resumed = events
        .iter()
        .find(|e| e.event_type == FlowEventType::Resumed)
        .unwrap();
    assert_eq!(resumed.payload["trigger"], json!("timeout"));
}

#[tokio::test]
async fn timeout_without_resume_expires_the_pause() {
    let h = harness();
    register_approval(
        &h,
        ResumeConfig::manual().with_timeout(Duration::from_secs(1), false),
    );
    let flow = start_paused_approval(&h).await;

    let sweep = h
        .engine
        .pause_monitor()
        .check_once(flow.paused_at.unwrap() + chrono::Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(sweep.expired, vec![flow.id]);
    assert!(sweep.resumed.is_empty());
    let stored = h.engine.get(flow.id, "alice").await.unwrap();
    assert_eq!(stored.status, FlowStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("pause timed out"));
    assert!(stored.active_resume.is_none());
}

#[tokio::test]
async fn condition_trigger_resumes_once_it_holds() {
    let h = harness();
    let ready = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ready);

    let blueprint = FlowBlueprintBuilder::new("stock")
        .step(
            ok_step("wait_for_stock")
                .pause_when(PauseCondition::always().reason(PauseReason::ExternalDependency))
                .resume_when(move |_ctx| flag.load(Ordering::SeqCst)),
        )
        .step(ok_step("ship"))
        .build();
    h.engine.register(blueprint).unwrap();
    let flow = h.engine.start("stock", BTreeMap::new(), "alice", None).await.unwrap();
    assert!(flow.is_paused());

    let monitor = h.engine.pause_monitor();
    assert!(monitor.check_once(chrono::Utc::now()).await.unwrap().is_empty());

    ready.store(true, Ordering::SeqCst);
    let sweep = monitor.check_once(chrono::Utc::now()).await.unwrap();
    assert_eq!(sweep.resumed, vec![flow.flow_id]);
    assert_eq!(
        h.engine.status(flow.flow_id, "alice").await.unwrap(),
        FlowStatus::Completed
    );
}

#[tokio::test]
async fn pause_conditions_evaluate_the_data_bag() {
    let h = harness();
    let blueprint = FlowBlueprintBuilder::new("transfer")
        .step(
            ok_step("send")
                .pause_when(PauseCondition::when(|ctx| ctx.get::<f64>("amount").unwrap_or(0.0) > 10_000.0)),
        )
        .build();
    h.engine.register(blueprint).unwrap();

    let small = h
        .engine
        .start("transfer", common::data(&[("amount", json!(50))]), "alice", None)
        .await
        .unwrap();
    assert!(small.is_completed());

    let large = h
        .engine
        .start("transfer", common::data(&[("amount", json!(50_000))]), "alice", None)
        .await
        .unwrap();
    assert!(large.is_paused());
}

#[tokio::test]
async fn manual_resume_is_limited_to_authorised_users() {
    let h = harness();
    register_approval(&h, ResumeConfig::manual());
    let flow = start_paused_approval(&h).await;

    let err = h.engine.resume_as(flow.id, "bob").await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert_eq!(h.engine.status(flow.id, "alice").await.unwrap(), FlowStatus::Paused);

    let result = h.engine.resume_as(flow.id, "alice").await.unwrap();
    assert!(result.is_completed());
    assert_eq!(result.flow.steps[1].status, StepStatus::Succeeded);

    let events = h.engine.events(flow.id, "alice").await.unwrap();
    let resumed = events
        .iter()
        .find(|e| e.event_type == FlowEventType::Resumed)
        .unwrap();
    assert_eq!(resumed.user_id.as_deref(), Some("alice"));
    assert_eq!(resumed.payload["trigger"], json!("manual"));

    let again = h.engine.resume_as(flow.id, "alice").await.unwrap_err();
    assert!(matches!(again, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn admins_may_resume_any_flow() {
    let h = harness();
    register_approval(&h, ResumeConfig::manual());
    let flow = start_paused_approval(&h).await;

    let result = h.engine.resume_as(flow.id, "root").await.unwrap();
    assert!(result.is_completed());
}

#[tokio::test]
async fn pauses_without_manual_resume_refuse_users_but_not_the_system() {
    let h = harness();
    register_approval(&h, ResumeConfig::on_events(["doc.signed"]).without_manual());
    let flow = start_paused_approval(&h).await;

    let err = h.engine.resume_as(flow.id, "alice").await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(ref m) if m.contains("manual")));

    let result = h.engine.resume(flow.id).await.unwrap();
    assert!(result.is_completed());
}

#[tokio::test]
async fn concurrent_resume_of_a_claimed_flow_conflicts() {
    let h = harness();
    register_approval(&h, ResumeConfig::manual());
    let flow = start_paused_approval(&h).await;

    let claim = h.engine.runtime().claim(flow.id).unwrap();
    let err = h.engine.resume_as(flow.id, "alice").await.unwrap_err();
    assert!(matches!(err, EngineError::ConcurrencyConflict(id) if id == flow.id));
    assert!(err.is_retryable());
    drop(claim);

    let result = h.engine.resume_as(flow.id, "alice").await.unwrap();
    assert!(result.is_completed());
}

#[tokio::test]
async fn cancelling_a_paused_flow_is_final() {
    let h = harness();
    register_approval(&h, ResumeConfig::manual());
    let flow = start_paused_approval(&h).await;

    let err = h.engine.cancel(flow.id, "bob", "nope").await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));

    assert!(h.engine.cancel(flow.id, "alice", "customer withdrew").await.unwrap());
    let stored = h.engine.get(flow.id, "alice").await.unwrap();
    assert_eq!(stored.status, FlowStatus::Cancelled);
    assert_eq!(stored.last_error.as_deref(), Some("customer withdrew"));
    assert!(stored.completed_at.is_some());

    assert!(!h.engine.cancel(flow.id, "alice", "twice").await.unwrap());
    let events = h.engine.events(flow.id, "alice").await.unwrap();
    assert_eq!(count(&events, FlowEventType::Cancelled), 1);

    let err = h.engine.resume_as(flow.id, "alice").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn cancelling_a_running_flow_stops_it_at_the_step_boundary() {
    let h = harness();
    let entered = Arc::new(Notify::new());
    let signal = Arc::clone(&entered);
    let after = Arc::new(AtomicU32::new(0));
    let after_counter = Arc::clone(&after);

    let blueprint = FlowBlueprintBuilder::new("export")
        .step(FlowStep::from_fn("stream_rows", move |ctx| {
            let signal = Arc::clone(&signal);
            async move {
                signal.notify_one();
                ctx.cancellation().cancelled().await;
                Err(StepError::Cancelled)
            }
        }))
        .step(FlowStep::from_fn("upload", move |_ctx| {
            after_counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(StepOutput::new()) }
        }))
        .build();
    h.engine.register(blueprint).unwrap();

    let flow_id = Uuid::now_v7();
    let engine = h.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .start_with_id(flow_id, StartRequest::new("export", "alice"))
            .await
    });

    entered.notified().await;
    assert!(h.engine.runtime().is_active(&flow_id));
    assert!(h.engine.cancel(flow_id, "alice", "operator stop").await.unwrap());

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancelled flow never stopped")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, FlowStatus::Cancelled);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert!(!h.engine.runtime().is_active(&flow_id));
    assert_eq!(
        h.engine.status(flow_id, "alice").await.unwrap(),
        FlowStatus::Cancelled
    );
}

#[tokio::test]
async fn cancel_stored_before_the_token_fires_still_ends_cancelled() {
    let h = harness();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (signal, gate) = (Arc::clone(&entered), Arc::clone(&release));
    let after = Arc::new(AtomicU32::new(0));
    let after_counter = Arc::clone(&after);

    let blueprint = FlowBlueprintBuilder::new("export")
        .step(
            FlowStep::from_fn("stream_rows", move |_ctx| {
                let (signal, gate) = (Arc::clone(&signal), Arc::clone(&gate));
                async move {
                    signal.notify_one();
                    gate.notified().await;
                    Ok(StepOutput::new())
                }
            })
            .critical(),
        )
        .step(FlowStep::from_fn("upload", move |_ctx| {
            after_counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(StepOutput::new()) }
        }))
        .build();
    h.engine.register(blueprint).unwrap();

    let flow_id = Uuid::now_v7();
    let engine = h.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .start_with_id(flow_id, StartRequest::new("export", "alice"))
            .await
    });

    entered.notified().await;
    // Store the cancellation without signalling the run token.
    assert!(h.repo.cancel_flow(&flow_id, "operator stop").await.unwrap());
    release.notify_one();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run never returned")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, FlowStatus::Cancelled);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.engine.status(flow_id, "alice").await.unwrap(),
        FlowStatus::Cancelled
    );
}

#[tokio::test]
async fn interrupted_runs_are_recovered_at_their_saved_step() {
    let h = harness();
    let reserved = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&reserved);
    let blueprint = FlowBlueprintBuilder::new("order")
        .step(FlowStep::from_fn("reserve", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(StepOutput::new()) }
        }))
        .step(FlowStep::from_fn("ship", |_ctx| async {
            Ok(StepOutput::new().set("shipped", true))
        }))
        .build();
    h.engine.register(blueprint).unwrap();

    // A run some earlier process left behind mid-walk.
    let mut flow = FlowInstance::new(
        Uuid::now_v7(),
        "order",
        "alice",
        "ord-1",
        vec!["reserve".to_string(), "ship".to_string()],
        BTreeMap::new(),
    );
    flow.transition(FlowStatus::Ready).unwrap();
    flow.transition(FlowStatus::Running).unwrap();
    flow.steps[0].status = StepStatus::Succeeded;
    flow.set_current_step(1);
    h.repo.save_flow(&flow).await.unwrap();

    let result = h.engine.resume(flow.id).await.unwrap();

    assert!(result.is_completed());
    assert_eq!(reserved.load(Ordering::SeqCst), 0);
    assert_eq!(result.flow.data["shipped"], json!(true));
    let events = h.engine.events(flow.id, "alice").await.unwrap();
    let resumed = events
        .iter()
        .find(|e| e.event_type == FlowEventType::Resumed)
        .unwrap();
    assert_eq!(resumed.payload["trigger"], json!("recovery"));
}

#[tokio::test]
async fn auto_resume_loop_picks_up_due_pauses_until_shutdown() {
    let h = harness_with_config(EngineConfig {
        auto_resume_interval_secs: 1,
        ..EngineConfig::default()
    });
    register_approval(&h, ResumeConfig::after(Duration::ZERO));
    let flow = start_paused_approval(&h).await;

    let monitor = h.engine.spawn_auto_resume();
    wait_for_status(&h.engine, flow.id, "alice", FlowStatus::Completed).await;

    h.engine.shutdown();
    tokio::time::timeout(Duration::from_secs(5), monitor)
        .await
        .expect("auto-resume loop ignored shutdown")
        .unwrap();
    assert!(h.engine.runtime().is_shut_down());
}
