mod common;

use chrono::Utc;
use common::{base_registry, init_tracing, output_of, runtime_with};
use craftcore::{
    Blueprint, EdgeDef, FlowcraftEvent, NodeDef, WorkflowStatus, AWAITING_IDS_KEY,
};
use craftruntime::{InitialState, ResumeData, RunOptions, TimerScheduler};
use serde_json::json;

fn wait_blueprint() -> Blueprint {
    let mut bp = Blueprint::new("gate");
    bp.add_node(NodeDef::new("approve", "wait"))
        .add_node(NodeDef::new("announce", "append").with_params(json!({"suffix": " approved"})))
        .add_edge(EdgeDef::new("approve", "announce"));
    bp
}

#[tokio::test]
async fn wait_node_suspends_and_resumes_with_external_output() {
    init_tracing();
    let (runtime, _bus) = runtime_with(base_registry());
    let bp = wait_blueprint();

    let first = runtime
        .run(&bp, InitialState::Empty, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, WorkflowStatus::Awaiting);
    assert_eq!(
        first.context.get(AWAITING_IDS_KEY),
        Some(&json!(["approve"]))
    );
    assert!(output_of(&first.context, "announce").is_none());

    let second = runtime
        .resume(
            &bp,
            &first.serialized_context,
            ResumeData::with_output(json!("request")),
            None,
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(second.status, WorkflowStatus::Completed);
    assert_eq!(output_of(&second.context, "approve"), Some(&json!("request")));
    assert_eq!(
        output_of(&second.context, "announce"),
        Some(&json!("request approved"))
    );
    assert!(second.context.get(AWAITING_IDS_KEY).is_none());
}

#[tokio::test]
async fn resume_of_a_completed_context_is_idempotent() {
    init_tracing();
    let (runtime, bus) = runtime_with(base_registry());
    let bp = wait_blueprint();

    let awaiting = runtime
        .run(&bp, InitialState::Empty, RunOptions::default())
        .await
        .unwrap();
    let completed = runtime
        .resume(
            &bp,
            &awaiting.serialized_context,
            ResumeData::with_output(json!("go")),
            None,
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(completed.status, WorkflowStatus::Completed);

    let starts_before = node_start_count(&bus.snapshot());
    let again = runtime
        .resume(
            &bp,
            &completed.serialized_context,
            ResumeData::with_output(json!("go again")),
            None,
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(again.status, WorkflowStatus::Completed);
    // The awaiting node keeps its first completion value.
    assert_eq!(output_of(&again.context, "approve"), Some(&json!("go")));
    assert_eq!(node_start_count(&bus.snapshot()), starts_before);
}

fn node_start_count(events: &[FlowcraftEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, FlowcraftEvent::NodeStart { .. }))
        .count()
}

#[tokio::test]
async fn sleep_suspends_with_a_timer_and_resumes_to_completion() {
    init_tracing();
    let (runtime, _bus) = runtime_with(base_registry());

    let mut bp = Blueprint::new("nap");
    bp.add_node(NodeDef::new("sleep", "sleep").with_params(json!({"duration": "1s"})));

    let first = runtime
        .run(&bp, InitialState::Empty, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, WorkflowStatus::Awaiting);
    let details = first
        .context
        .get("_awaitingDetails.sleep")
        .expect("awaiting details recorded");
    assert_eq!(details.get("reason"), Some(&json!("timer")));
    assert!(details.get("wakeUpAt").is_some());

    let second = runtime
        .resume(
            &bp,
            &first.serialized_context,
            ResumeData::default(),
            None,
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(second.status, WorkflowStatus::Completed);
    assert_eq!(output_of(&second.context, "sleep"), Some(&json!(null)));
}

#[tokio::test]
async fn malformed_sleep_durations_fail_the_node() {
    init_tracing();
    let (runtime, _bus) = runtime_with(base_registry());

    let mut bp = Blueprint::new("bad-nap");
    bp.add_node(NodeDef::new("sleep", "sleep").with_params(json!({"duration": "-5s"})));

    let result = runtime
        .run(&bp, InitialState::Empty, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.errors[0].is_fatal);
}

#[tokio::test]
async fn scheduler_resumes_elapsed_timers() {
    init_tracing();
    let (runtime, bus) = runtime_with(base_registry());
    let scheduler = TimerScheduler::new(&runtime);
    runtime.attach_scheduler(&scheduler);

    let mut bp = Blueprint::new("timed");
    bp.add_node(NodeDef::new("pause", "sleep").with_params(json!({"duration": 0})))
        .add_node(NodeDef::new("done", "emit").with_params(json!({"value": "woke"})))
        .add_edge(EdgeDef::new("pause", "done"));
    runtime.register_blueprint(bp.clone()).await;

    let first = runtime
        .run(&bp, InitialState::Empty, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, WorkflowStatus::Awaiting);
    assert_eq!(scheduler.tracked_count(), 1);

    scheduler
        .poll_due(Utc::now() + chrono::Duration::seconds(1))
        .await;
    assert_eq!(scheduler.tracked_count(), 0);

    let finished_completed = bus.snapshot().iter().any(|e| {
        matches!(
            e,
            FlowcraftEvent::WorkflowFinish {
                status: WorkflowStatus::Completed,
                ..
            }
        )
    });
    assert!(finished_completed, "timer resume should complete the run");
}

#[tokio::test]
async fn step_orchestrator_advances_one_tick_at_a_time() {
    init_tracing();
    let (runtime, _bus) = runtime_with(base_registry());

    let mut bp = Blueprint::new("stepwise");
    bp.add_node(NodeDef::new("A", "emit").with_params(json!({"value": 1})))
        .add_node(NodeDef::new("B", "emit").with_params(json!({"value": 2})))
        .add_edge(EdgeDef::new("A", "B"));

    let mut stepper = runtime
        .step_runner(&bp, InitialState::Empty, RunOptions::default())
        .unwrap();

    let first = stepper.step().await.unwrap();
    assert!(!first.done);
    assert_eq!(output_of(&first.result.context, "A"), Some(&json!(1)));
    assert!(output_of(&first.result.context, "B").is_none());

    let second = stepper.step().await.unwrap();
    assert_eq!(output_of(&second.result.context, "B"), Some(&json!(2)));

    let third = stepper.step().await.unwrap();
    assert!(third.done);
    assert_eq!(third.result.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn execute_node_runs_a_single_node_without_scheduling() {
    init_tracing();
    let (runtime, bus) = runtime_with(base_registry());

    let mut bp = Blueprint::new("single");
    bp.add_node(NodeDef::new("first", "emit").with_params(json!({"value": "seed"})))
        .add_node(
            NodeDef::new("second", "append")
                .with_params(json!({"suffix": "ling"}))
                .with_inputs(craftcore::InputSpec::Key("first".into())),
        )
        .add_edge(EdgeDef::new("first", "second"));

    let seeded = serde_json::to_string(&json!({"_outputs.first": "seed"})).unwrap();
    let execution = runtime
        .execute_node(&bp, "second", &seeded, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.result.output, Some(json!("seedling")));
    let context: serde_json::Value =
        serde_json::from_str(&execution.serialized_context).unwrap();
    assert_eq!(context.get("_outputs.second"), Some(&json!("seedling")));
    // Only the requested node ran.
    assert_eq!(node_start_count(&bus.snapshot()), 1);
}
