//! Pause, resume and stop: manual tasks, webhooks, delays, loops and routers.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::{ScriptedSandbox, action, action_payload, chain, engine_with, flow, ok};
use flowline_engine::pause::resume_job_id;
use flowline_engine::{
    EngineConfig, EngineError, ExecutionType, FlowEngine, JobProcessor, JobScheduler,
    PauseMetadata, RunStatus, SandboxResponse, SchedulerConfig, SqliteStore, StepOutput,
    StepStatus, StopOutcome,
};
use serde_json::{Value, json};

/// Piece that pauses for a webhook when its input says so and returns the
/// resume payload when re-entered.
fn gate_sandbox() -> Arc<ScriptedSandbox> {
    ScriptedSandbox::new(|op| {
        let payload = action_payload(op).unwrap();
        match (payload.action_name.as_str(), payload.execution_type) {
            ("gate", ExecutionType::Begin) if payload.input["hold"] == json!(true) => {
                SandboxResponse::ok(json!({"status": "paused", "pause": {"type": "WEBHOOK"}}))
            }
            ("gate", ExecutionType::Resume) => ok(payload.resume_payload.unwrap_or(Value::Null)),
            _ => ok(payload.input),
        }
    })
}

#[tokio::test]
async fn test_approval_pause_and_resume() {
    let (engine, _store) = engine_with(ScriptedSandbox::echo());
    let f = flow(
        "approve",
        chain(vec![
            action("prepare", "x", "y", json!({"amount": 10})),
            action("approve", "approval", "wait_for_approval", json!({})),
            action("finish", "x", "y", json!({"by": "{{approve.by}}", "amount": "{{prepare.amount}}"})),
        ]),
    );

    let paused = engine.execute_flow(&f, &json!({}), Value::Null).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.pause_metadata, Some(PauseMetadata::ManualTask {}));
    assert_eq!(paused.steps["approve"].status(), StepStatus::Paused);
    assert!(!paused.steps.contains_key("finish"));

    let stored = engine.get_run(&paused.run_id).unwrap();
    assert_eq!(stored.status, RunStatus::Paused);
    assert_eq!(stored.cursor.as_ref().unwrap().step_name, "approve");

    let done = engine
        .resume_flow(&paused.run_id, Some(json!({"by": "ops"})))
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Succeeded);
    assert_eq!(done.steps["approve"].output(), Some(&json!({"by": "ops"})));
    assert_eq!(
        done.steps["finish"].output(),
        Some(&json!({"by": "ops", "amount": 10}))
    );

    let stored = engine.get_run(&paused.run_id).unwrap();
    assert!(stored.cursor.is_none());
    assert!(stored.pause.is_none());
}

#[tokio::test]
async fn test_resume_inside_loop_continues_remaining_items() {
    let sandbox = gate_sandbox();
    let (engine, _store) = engine_with(sandbox.clone());
    let body = chain(vec![
        action("check", "gate", "gate", json!({"item": "{{each.item}}", "hold": "{{each.item.hold}}"})),
        action("record", "x", "y", json!({"name": "{{each.item.name}}", "gate": "{{check}}"})),
    ]);
    let f = flow(
        "loop-pause",
        chain(vec![
            json!({"name": "each", "type": "LOOP_ON_ITEMS", "items": "{{configs.items}}", "first_loop_action": body}),
            action("after", "x", "y", json!({"done": true})),
        ]),
    );
    let items = json!({"items": [
        {"name": "a", "hold": false},
        {"name": "b", "hold": true},
        {"name": "c", "hold": false}
    ]});

    let paused = engine.execute_flow(&f, &items, Value::Null).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.pause_metadata, Some(PauseMetadata::Webhook {}));
    assert_eq!(paused.steps["each"].status(), StepStatus::Paused);
    let cursor = engine.get_run(&paused.run_id).unwrap().cursor.unwrap();
    assert_eq!(cursor.step_name, "check");
    assert_eq!(cursor.ancestors.len(), 1);
    assert_eq!(cursor.ancestors[0].step_name, "each");
    assert_eq!(cursor.ancestors[0].index, 1);

    let done = engine
        .resume_flow(&paused.run_id, Some(json!({"approved": true})))
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Succeeded);

    let StepOutput::Loop { status, iterations, .. } = &done.steps["each"] else {
        panic!("Expected loop output");
    };
    assert_eq!(*status, StepStatus::Succeeded);
    assert_eq!(iterations.len(), 3);
    assert_eq!(
        iterations[1]["record"].output(),
        Some(&json!({"name": "b", "gate": {"approved": true}}))
    );
    assert_eq!(iterations[2]["record"].output().unwrap()["name"], json!("c"));
    assert!(done.steps.contains_key("after"));

    // Item "a" is never re-run; item "b" is re-entered with RESUME.
    let checks: Vec<_> = sandbox
        .action_calls()
        .into_iter()
        .filter(|c| c.step_name == "check")
        .map(|c| (c.input["item"]["name"].clone(), c.execution_type))
        .collect();
    assert_eq!(
        checks,
        vec![
            (json!("a"), ExecutionType::Begin),
            (json!("b"), ExecutionType::Begin),
            (json!("b"), ExecutionType::Resume),
            (json!("c"), ExecutionType::Begin),
        ]
    );
}

#[tokio::test]
async fn test_resume_inside_router_branch() {
    let (engine, _store) = engine_with(ScriptedSandbox::echo());
    let router = json!({
        "name": "route",
        "type": "ROUTER",
        "branches": [
            {
                "name": "needs_approval",
                "conditions": [[{"first_value": "{{trigger.amount}}", "operator": "NUMBER_IS_GREATER_THAN", "second_value": 100}]],
                "first_action": chain(vec![
                    action("approve", "approval", "wait_for_approval", json!({})),
                    action("notify", "x", "y", json!({"ok": "{{approve.ok}}"}))
                ])
            },
            {"name": "auto", "first_action": action("auto_ok", "x", "y", json!({}))}
        ]
    });
    let f = flow("route-pause", chain(vec![router, action("after", "x", "y", json!({}))]));

    let paused = engine
        .execute_flow(&f, &json!({}), json!({"amount": 500}))
        .await
        .unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    let done = engine
        .resume_flow(&paused.run_id, Some(json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Succeeded);
    assert_eq!(done.steps["notify"].output(), Some(&json!({"ok": true})));
    assert!(!done.steps.contains_key("auto_ok"));
    assert!(done.steps.contains_key("after"));
    assert_eq!(
        done.steps["route"].output(),
        Some(&json!({"branch_index": 0, "branch_name": "needs_approval"}))
    );
}

#[tokio::test(start_paused = true)]
async fn test_short_delays_complete_inline() {
    let (engine, _store) = engine_with(ScriptedSandbox::echo());
    let f = flow(
        "short",
        chain(vec![
            action("none", "delay", "delay_for", json!({"delay_in_ms": 0})),
            action("brief", "delay", "delay_for", json!({"delay_in_ms": 2000})),
            action("after", "x", "y", json!({})),
        ]),
    );

    let result = engine.execute_flow(&f, &json!({}), Value::Null).await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.steps["none"].output(), Some(&json!({"success": true})));
    assert_eq!(result.steps["brief"].output(), Some(&json!({"success": true})));
    assert!(engine.scheduler().is_empty());
}

#[tokio::test]
async fn test_long_delay_suspends_and_scheduler_resumes() {
    let (engine, _store) = engine_with(ScriptedSandbox::echo());
    let f = flow(
        "long",
        chain(vec![
            action("wait", "delay", "delay_for", json!({"delay_seconds": 60})),
            action("after", "x", "y", json!({"ok": true})),
        ]),
    );

    let paused = engine.execute_flow(&f, &json!({}), Value::Null).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    let Some(PauseMetadata::Delay { resume_at }) = paused.pause_metadata else {
        panic!("Expected delay pause, got: {:?}", paused.pause_metadata);
    };
    assert!(resume_at > Utc::now() + ChronoDuration::seconds(55));

    let job_id = resume_job_id(&paused.run_id);
    let job = engine.scheduler().get(&job_id).unwrap();
    assert!(job.next_fire_at.unwrap() >= resume_at.timestamp());

    // Nothing fires before the resume time.
    assert!(engine.scheduler().take_due(Utc::now()).is_empty());

    let due = engine
        .scheduler()
        .take_due(resume_at + ChronoDuration::seconds(1));
    assert_eq!(due.len(), 1);
    engine.process(due.into_iter().next().unwrap()).await.unwrap();

    let run = engine.get_run(&paused.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.state.steps()["wait"].output(), Some(&json!({"success": true})));
    assert!(run.state.steps().contains_key("after"));
}

#[tokio::test]
async fn test_resume_errors() {
    let (engine, _store) = engine_with(ScriptedSandbox::echo());
    let f = flow("plain", action("only", "x", "y", json!({})));
    let done = engine.execute_flow(&f, &json!({}), Value::Null).await.unwrap();

    match engine.resume_flow(&done.run_id, None).await {
        Err(EngineError::RunNotResumable { status, .. }) => assert_eq!(status, "SUCCEEDED"),
        other => panic!("Expected RunNotResumable, got: {other:?}"),
    }
    assert!(matches!(
        engine.resume_flow("missing", None).await,
        Err(EngineError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_stop_paused_run_cancels_it() {
    let (engine, _store) = engine_with(ScriptedSandbox::echo());
    let f = flow("cancel", action("wait", "delay", "delay_for", json!({"delay_seconds": 3600})));
    let paused = engine.execute_flow(&f, &json!({}), Value::Null).await.unwrap();
    assert!(engine.scheduler().get(&resume_job_id(&paused.run_id)).is_some());

    assert_eq!(engine.stop_run(&paused.run_id).unwrap(), StopOutcome::Cancelled);
    assert_eq!(engine.get_run(&paused.run_id).unwrap().status, RunStatus::Stopped);
    assert!(engine.scheduler().get(&resume_job_id(&paused.run_id)).is_none());
    assert!(matches!(
        engine.resume_flow(&paused.run_id, None).await,
        Err(EngineError::RunNotResumable { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stop_running_run_at_next_boundary() {
    let sandbox = ScriptedSandbox::echo();
    let (engine, _store) = engine_with(sandbox.clone());
    let f = flow(
        "stoppable",
        chain(vec![
            action("wait", "delay", "delay_for", json!({"delay_in_ms": 1000})),
            action("after", "x", "y", json!({})),
        ]),
    );

    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute_flow(&f, &json!({}), Value::Null).await }
    });

    let run_id = loop {
        tokio::task::yield_now().await;
        if let Some(run) = engine.list_runs(RunStatus::Running).unwrap().pop() {
            break run.run_id;
        }
    };
    assert_eq!(engine.stop_run(&run_id).unwrap(), StopOutcome::Signalled);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, RunStatus::Stopped);
    assert!(result.steps.contains_key("wait"));
    assert!(!result.steps.contains_key("after"));
    assert!(sandbox.calls().is_empty());
}

#[tokio::test]
async fn test_paused_run_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("runs.db");
    let f = flow(
        "durable",
        chain(vec![
            action("approve", "approval", "wait_for_approval", json!({})),
            action("after", "x", "y", json!({"who": "{{approve.who}}"})),
        ]),
    );
    let delayed = flow(
        "durable-delay",
        action("wait", "delay", "delay_for", json!({"delay_seconds": 600})),
    );

    let build = || {
        FlowEngine::with_store(
            EngineConfig::default(),
            ScriptedSandbox::echo(),
            Arc::new(SqliteStore::open(&db).unwrap()),
            Arc::new(JobScheduler::new(SchedulerConfig::default())),
        )
    };

    let (approval_run, delay_run) = {
        let engine = build();
        let a = engine.execute_flow(&f, &json!({}), Value::Null).await.unwrap();
        let d = engine.execute_flow(&delayed, &json!({}), Value::Null).await.unwrap();
        (a.run_id, d.run_id)
    };

    let engine = build();
    assert_eq!(engine.list_runs(RunStatus::Paused).unwrap().len(), 2);
    assert_eq!(engine.recover_paused_runs().unwrap(), 1);
    assert!(engine.scheduler().get(&resume_job_id(&delay_run)).is_some());

    let done = engine
        .resume_flow(&approval_run, Some(json!({"who": "lead"})))
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Succeeded);
    assert_eq!(done.steps["after"].output(), Some(&json!({"who": "lead"})));
}
