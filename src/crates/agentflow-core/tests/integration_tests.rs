//! End-to-end scenarios for the superstep engine.

use agentflow_core::{
    handler, value_handler, Envelope, Executor, ExternalRequest, ExternalResponse, FailureKind,
    InMemoryCheckpointStore, RequestPort, Result, RouteBuilder, RunStatus, RunnerOptions, SenderId,
    StepContext, TypeTag, Workflow, WorkflowBuilder, WorkflowError, WorkflowEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test timed out")
}

fn assert_contiguous(records: &[agentflow_core::EventRecord]) {
    for (index, record) in records.iter().enumerate() {
        assert_eq!(
            record.sequence,
            index as u64 + 1,
            "event sequence must be contiguous from 1"
        );
    }
}

// --- test executors -------------------------------------------------------

/// Echoes integers onward and reports each one as an output.
struct Echo;

#[async_trait]
impl Executor for Echo {
    fn id(&self) -> &str {
        "a"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn output_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "int",
            value_handler(|value, ctx, _| async move {
                ctx.yield_output(value.clone());
                Ok(value)
            }),
        )?;
        Ok(())
    }
}

/// Increments integers and echoes the result back.
struct Increment;

#[async_trait]
impl Executor for Increment {
    fn id(&self) -> &str {
        "b"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn output_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "int",
            value_handler(|value, ctx, _| async move {
                let next = json!(value.as_i64().unwrap_or(0) + 1);
                ctx.yield_output(next.clone());
                Ok(next)
            }),
        )?;
        Ok(())
    }
}

/// Posts a question through the GuessNumber port, outputs the answer.
struct Guesser;

#[async_trait]
impl Executor for Guesser {
    fn id(&self) -> &str {
        "guesser"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["start".to_string(), "answer".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "start",
            handler(|_, ctx, _| async move {
                ctx.post_external_request(ExternalRequest::new(
                    "GuessNumber",
                    json!("guess a number"),
                ))?;
                Ok(None)
            }),
        )?;
        routes.on(
            "answer",
            handler(|value, ctx, _| async move {
                ctx.yield_output(value);
                ctx.request_halt();
                Ok(None)
            }),
        )?;
        Ok(())
    }
}

/// Splits a list input: first element to `a`, second (if any) to `b`.
struct Splitter;

#[async_trait]
impl Executor for Splitter {
    fn id(&self) -> &str {
        "seed"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["letters".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "letters",
            handler(|value, ctx, _| async move {
                let items = value.as_array().cloned().unwrap_or_default();
                if let Some(first) = items.first() {
                    ctx.send_message_to(first.clone(), "text", "a");
                }
                if let Some(second) = items.get(1) {
                    ctx.send_message_to(second.clone(), "text", "b");
                }
                Ok(None)
            }),
        )?;
        Ok(())
    }
}

/// Forwards text payloads unchanged.
struct Forwarder {
    id: String,
}

#[async_trait]
impl Executor for Forwarder {
    fn id(&self) -> &str {
        &self.id
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["text".to_string()]
    }

    fn output_types(&self) -> Vec<TypeTag> {
        vec!["text".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "text",
            value_handler(|value, _, _| async move { Ok(value) }),
        )?;
        Ok(())
    }
}

/// Collects joined pairs and reports them.
struct Collector;

#[async_trait]
impl Executor for Collector {
    fn id(&self) -> &str {
        "c"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["pair".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "pair",
            handler(|value, ctx, _| async move {
                ctx.yield_output(value);
                ctx.request_halt();
                Ok(None)
            }),
        )?;
        Ok(())
    }
}

/// Counts up through a self-edge and halts at 6.
struct Counter;

#[async_trait]
impl Executor for Counter {
    fn id(&self) -> &str {
        "counter"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn output_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "int",
            handler(|value, ctx, _| async move {
                let next = value.as_i64().unwrap_or(0) + 1;
                if next >= 6 {
                    ctx.yield_output(json!(next));
                    ctx.request_halt();
                    Ok(None)
                } else {
                    Ok(Some(json!(next)))
                }
            }),
        )?;
        Ok(())
    }
}

/// Yields one output and halts, calling for a halt several times.
struct Stopper;

#[async_trait]
impl Executor for Stopper {
    fn id(&self) -> &str {
        "stopper"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["go".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "go",
            handler(|value, ctx, _| async move {
                ctx.yield_output(value);
                ctx.request_halt();
                ctx.request_halt();
                ctx.request_halt();
                Ok(None)
            }),
        )?;
        Ok(())
    }
}

/// Fails recoverably on every delivery.
struct Flaky;

#[async_trait]
impl Executor for Flaky {
    fn id(&self) -> &str {
        "flaky"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["text".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on_recoverable(
            "text",
            handler(|_, _, _| async move {
                Err(WorkflowError::Execution("flaky failure".to_string()))
            }),
        )?;
        Ok(())
    }
}

/// Fails fatally on every delivery.
struct Broken;

#[async_trait]
impl Executor for Broken {
    fn id(&self) -> &str {
        "broken"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["text".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "text",
            handler(|_, _, _| async move {
                Err(WorkflowError::Execution("broken beyond repair".to_string()))
            }),
        )?;
        Ok(())
    }
}

/// Reports what it read from state before writing this step's value.
struct Journal;

#[async_trait]
impl Executor for Journal {
    fn id(&self) -> &str {
        "journal"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn output_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "int",
            handler(|value, ctx, _| async move {
                let read = ctx.read_state("last");
                ctx.yield_output(json!({"value": value.clone(), "read": read}));
                ctx.write_state("last", value.clone());
                let n = value.as_i64().unwrap_or(0);
                if n < 1 {
                    Ok(Some(json!(n + 1)))
                } else {
                    ctx.request_halt();
                    Ok(None)
                }
            }),
        )?;
        Ok(())
    }
}

// --- graph helpers --------------------------------------------------------

fn ping_pong_workflow() -> Workflow {
    WorkflowBuilder::new()
        .add_executor(Arc::new(Echo))
        .add_executor(Arc::new(Increment))
        .with_start_executor("a")
        .add_edge("a", "b")
        .add_edge("b", "a")
        .build()
        .unwrap()
}

fn guesser_workflow() -> Workflow {
    WorkflowBuilder::new()
        .add_executor(Arc::new(Guesser))
        .with_start_executor("guesser")
        .with_request_port(RequestPort::new("GuessNumber", "question", "answer"), "guesser")
        .build()
        .unwrap()
}

fn fan_in_workflow() -> Workflow {
    WorkflowBuilder::new()
        .add_executor(Arc::new(Splitter))
        .add_executor(Arc::new(Forwarder { id: "a".to_string() }))
        .add_executor(Arc::new(Forwarder { id: "b".to_string() }))
        .add_executor(Arc::new(Collector))
        .with_start_executor("seed")
        .add_fan_in_edge(vec!["a".to_string(), "b".to_string()], "c", "pair")
        .build()
        .unwrap()
}

fn outputs_of(records: &[agentflow_core::EventRecord]) -> Vec<(String, Value)> {
    records
        .iter()
        .filter_map(|r| match &r.event {
            WorkflowEvent::WorkflowOutput { source_id, value } => {
                Some((source_id.clone(), value.clone()))
            }
            _ => None,
        })
        .collect()
}

fn count_matching(
    records: &[agentflow_core::EventRecord],
    predicate: impl Fn(&WorkflowEvent) -> bool,
) -> usize {
    records.iter().filter(|r| predicate(&r.event)).count()
}

// --- seed scenarios -------------------------------------------------------

/// Scenario 1: ping-pong between an echo and an incrementer.
#[tokio::test]
async fn ping_pong_round_trip() {
    let workflow = ping_pong_workflow();
    let run = workflow
        .start_run(RunnerOptions::default().streaming())
        .unwrap();

    assert_eq!(run.status(), RunStatus::NotStarted);
    assert!(run.enqueue_input(json!(0), "int").unwrap());

    let mut stream = run.take_event_stream(false).unwrap();
    let mut records = Vec::new();
    let mut a_outputs = Vec::new();
    let mut b_outputs = Vec::new();

    within(async {
        while a_outputs.len() < 5 || b_outputs.len() < 5 {
            let record = stream.next().await.expect("stream ended early");
            if let WorkflowEvent::WorkflowOutput { source_id, value } = &record.event {
                let n = value.as_i64().unwrap();
                match source_id.as_str() {
                    "a" => a_outputs.push(n),
                    "b" => b_outputs.push(n),
                    other => panic!("unexpected source {}", other),
                }
            }
            records.push(record);
        }
    })
    .await;

    run.request_end_run();
    within(async {
        while let Some(record) = stream.next().await {
            records.push(record);
        }
    })
    .await;

    assert_eq!(&a_outputs[..5], &[0, 1, 2, 3, 4]);
    assert_eq!(&b_outputs[..5], &[1, 2, 3, 4, 5]);
    assert_eq!(run.status(), RunStatus::Completed);
    assert_contiguous(&records);
}

/// Scenario 2: external request round-trip through a port, with the exact
/// observable event order.
#[tokio::test]
async fn guess_a_number_port_round_trip() {
    let workflow = guesser_workflow();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!("begin"), "start").unwrap());

    let mut stream = run.take_event_stream(true).unwrap();

    // Superstep 1: invocation, request posting, completion event.
    let mut records = Vec::new();
    within(async {
        for _ in 0..4 {
            records.push(stream.next().await.expect("stream ended early"));
        }
    })
    .await;

    let request_id = records
        .iter()
        .find_map(|r| match &r.event {
            WorkflowEvent::RequestInfo { request } => Some(request.request_id.clone()),
            _ => None,
        })
        .expect("no RequestInfo event");

    run.enqueue_response(ExternalResponse::new(request_id, json!("42")))
        .unwrap();

    within(async {
        while let Some(record) = stream.next().await {
            records.push(record);
        }
    })
    .await;

    // Project onto the observable order the scenario pins down.
    let observed: Vec<&str> = records
        .iter()
        .filter_map(|r| match &r.event {
            WorkflowEvent::ExecutorInvoked { .. } => Some("invoked"),
            WorkflowEvent::RequestInfo { .. } => Some("request"),
            WorkflowEvent::SuperStepCompleted { step: 1, .. } => Some("step1"),
            WorkflowEvent::SuperStepCompleted { step: 2, .. } => Some("step2"),
            WorkflowEvent::WorkflowOutput { .. } => Some("output"),
            WorkflowEvent::RequestHalt => Some("halt"),
            _ => None,
        })
        .collect();
    assert_eq!(
        observed,
        vec!["invoked", "request", "step1", "invoked", "step2", "output", "halt"]
    );

    let outputs = outputs_of(&records);
    assert_eq!(outputs, vec![("guesser".to_string(), json!("42"))]);
    assert_eq!(run.status(), RunStatus::Completed);
    assert_contiguous(&records);
}

/// Scenario 3: fan-in join delivers exactly one joined envelope.
#[tokio::test]
async fn fan_in_joins_one_envelope_per_pair() {
    let workflow = fan_in_workflow();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!(["x", "y"]), "letters").unwrap());

    let stream = run.take_event_stream(true).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    let c_invocations = count_matching(&records, |e| {
        matches!(e, WorkflowEvent::ExecutorInvoked { executor_id } if executor_id == "c")
    });
    assert_eq!(c_invocations, 1);

    let outputs = outputs_of(&records);
    assert_eq!(outputs, vec![("c".to_string(), json!(["x", "y"]))]);
}

/// Scenario 3b: a partial join never invokes the target.
#[tokio::test]
async fn fan_in_partial_join_does_not_fire() {
    let workflow = fan_in_workflow();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    // Only `a` receives a letter; the join stays incomplete.
    assert!(run.enqueue_input(json!(["x"]), "letters").unwrap());

    let stream = run.take_event_stream(true).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    let c_invocations = count_matching(&records, |e| {
        matches!(e, WorkflowEvent::ExecutorInvoked { executor_id } if executor_id == "c")
    });
    assert_eq!(c_invocations, 0);
    assert!(outputs_of(&records).is_empty());
}

/// Scenario 4: checkpoint at step 3, restore into a fresh handle, resume;
/// the final output matches the uninterrupted run.
#[tokio::test]
async fn checkpoint_resume_matches_uninterrupted_run() {
    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Counter))
        .with_start_executor("counter")
        .add_edge("counter", "counter")
        .build()
        .unwrap();
    let store = Arc::new(InMemoryCheckpointStore::new());

    // Uninterrupted run.
    let run = workflow
        .start_run_with_store(
            RunnerOptions::default().with_checkpointing(),
            store.clone(),
        )
        .unwrap();
    assert!(run.enqueue_input(json!(0), "int").unwrap());
    let stream = run.take_event_stream(false).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    let uninterrupted = outputs_of(&records);
    assert_eq!(uninterrupted, vec![("counter".to_string(), json!(6))]);

    let checkpoints = run.checkpoints();
    assert_eq!(checkpoints.len(), 6);
    let at_step_3 = checkpoints[2].clone();
    assert_eq!(at_step_3.step_number, 3);
    run.dispose().await;

    // Fresh handle, restored from step 3.
    let resumed = workflow
        .start_run_with_store(
            RunnerOptions::default().with_checkpointing(),
            store.clone(),
        )
        .unwrap();
    resumed.restore_checkpoint(&at_step_3).await.unwrap();

    let stream = resumed.take_event_stream(false).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    assert_eq!(outputs_of(&records), uninterrupted);
    let steps: Vec<u64> = records
        .iter()
        .filter_map(|r| match &r.event {
            WorkflowEvent::SuperStepCompleted { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![4, 5, 6]);
    resumed.dispose().await;
}

/// Scenario 4b: a checkpoint taken while a fan-in join is half-full keeps
/// the buffered contribution; after a restore the join still fires with it.
#[tokio::test]
async fn checkpoint_mid_join_preserves_partial_buffers() {
    let workflow = fan_in_workflow();
    let store = Arc::new(InMemoryCheckpointStore::new());

    // Only `a` contributes, so the join buffers "x" and waits for `b`.
    let run = workflow
        .start_run_with_store(
            RunnerOptions::default().with_checkpointing(),
            store.clone(),
        )
        .unwrap();
    assert!(run.enqueue_input(json!(["x"]), "letters").unwrap());

    let stream = run.take_event_stream(true).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;
    let c_invocations = count_matching(&records, |e| {
        matches!(e, WorkflowEvent::ExecutorInvoked { executor_id } if executor_id == "c")
    });
    assert_eq!(c_invocations, 0);

    // The last checkpoint was taken after `a` forwarded into the join.
    let mid_join = run.checkpoints().last().cloned().expect("no checkpoints");
    assert_eq!(mid_join.step_number, 2);
    run.dispose().await;

    // Fresh handle restored from the half-full join.
    let resumed = workflow
        .start_run_with_store(RunnerOptions::default().with_checkpointing(), store)
        .unwrap();
    resumed.restore_checkpoint(&mid_join).await.unwrap();
    assert!(resumed.enqueue_input(json!(["z", "y"]), "letters").unwrap());

    let stream = resumed.take_event_stream(true).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    // The join pairs the restored "x" with the new "y", in arrival order;
    // "z" stays buffered behind it. Had the buffer been dropped on restore
    // the pair would have been ["z", "y"].
    assert_eq!(outputs_of(&records), vec![("c".to_string(), json!(["x", "y"]))]);
    resumed.dispose().await;
}

/// Scenario 5: a second concurrent enumerator is rejected; the first still
/// yields everything.
#[tokio::test]
async fn concurrent_enumerator_rejected() {
    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Stopper))
        .with_start_executor("stopper")
        .build()
        .unwrap();
    let run = workflow
        .start_run(RunnerOptions::default().streaming())
        .unwrap();

    let first = run.take_event_stream(false).unwrap();
    let second = run.take_event_stream(false);
    assert!(matches!(second, Err(WorkflowError::ConcurrentEnumeration)));

    assert!(run.enqueue_input(json!("payload"), "go").unwrap());
    let records: Vec<_> = within(first.collect::<Vec<_>>()).await;

    assert!(count_matching(&records, |e| matches!(e, WorkflowEvent::ExecutorInvoked { .. })) >= 1);
    assert_eq!(count_matching(&records, |e| matches!(e, WorkflowEvent::RequestHalt)), 1);
    assert_eq!(outputs_of(&records).len(), 1);
    assert_contiguous(&records);
}

/// Scenario 6: a response for an unknown request id is rejected without
/// touching the run.
#[tokio::test]
async fn unknown_response_is_rejected_without_side_effects() {
    let workflow = guesser_workflow();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();

    let result = run.enqueue_response(ExternalResponse::new("nope", json!(1)));
    assert!(matches!(result, Err(WorkflowError::UnknownRequestId(id)) if id == "nope"));

    // The run proceeds unaffected.
    assert!(run.enqueue_input(json!("begin"), "start").unwrap());
    let mut stream = run.take_event_stream(false).unwrap();
    let mut records = Vec::new();
    within(async {
        for _ in 0..4 {
            records.push(stream.next().await.expect("stream ended early"));
        }
    })
    .await;

    assert_eq!(
        count_matching(&records, |e| matches!(e, WorkflowEvent::WorkflowError { .. })),
        0
    );
    assert_eq!(
        count_matching(&records, |e| matches!(e, WorkflowEvent::RequestInfo { .. })),
        1
    );
    assert_contiguous(&records);
}

// --- property and boundary behaviors --------------------------------------

/// Delivering the same response twice: one successful routing, then
/// `UnknownRequestId`.
#[tokio::test]
async fn response_delivery_is_idempotent() {
    let workflow = guesser_workflow();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!("begin"), "start").unwrap());

    let mut stream = run.take_event_stream(true).unwrap();
    let mut request_id = None;
    within(async {
        while request_id.is_none() {
            let record = stream.next().await.expect("stream ended early");
            if let WorkflowEvent::RequestInfo { request } = &record.event {
                request_id = Some(request.request_id.clone());
            }
        }
    })
    .await;
    let request_id = request_id.unwrap();

    run.enqueue_response(ExternalResponse::new(request_id.clone(), json!("42")))
        .unwrap();
    let second = run.enqueue_response(ExternalResponse::new(request_id, json!("42")));
    assert!(matches!(second, Err(WorkflowError::UnknownRequestId(_))));

    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;
    assert_eq!(outputs_of(&records).len(), 1);
}

/// Multiple halt requests within one step coalesce into one event.
#[tokio::test]
async fn halt_requests_coalesce() {
    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Stopper))
        .with_start_executor("stopper")
        .build()
        .unwrap();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!(null), "go").unwrap());

    let stream = run.take_event_stream(false).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    assert_eq!(count_matching(&records, |e| matches!(e, WorkflowEvent::RequestHalt)), 1);
    assert_eq!(run.status(), RunStatus::Completed);
}

/// Incompatible input is rejected with `false` and records no state change.
#[tokio::test]
async fn incompatible_input_returns_false() {
    let workflow = ping_pong_workflow();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();

    assert!(!run.enqueue_input(json!("text"), "text").unwrap());
    assert_eq!(run.status(), RunStatus::NotStarted);
    assert!(run.checkpoints().is_empty());
}

/// Enqueueing after the run completed fails with `RunEnded`.
#[tokio::test]
async fn enqueue_after_completion_fails() {
    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Stopper))
        .with_start_executor("stopper")
        .build()
        .unwrap();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!(null), "go").unwrap());

    let stream = run.take_event_stream(false).unwrap();
    let _records: Vec<_> = within(stream.collect::<Vec<_>>()).await;
    assert_eq!(run.status(), RunStatus::Completed);

    assert!(matches!(
        run.enqueue_input(json!(null), "go"),
        Err(WorkflowError::RunEnded)
    ));
}

/// A recoverable failure is reported and the step continues with the other
/// executors.
#[tokio::test]
async fn recoverable_failure_lets_step_continue() {
    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Forwarder { id: "relay".to_string() }))
        .add_executor(Arc::new(Flaky))
        .add_executor(Arc::new(Forwarder { id: "worker".to_string() }))
        .with_start_executor("relay")
        .add_fan_out_edge("relay", vec!["flaky".to_string(), "worker".to_string()])
        .build()
        .unwrap();

    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!("hello"), "text").unwrap());

    let stream = run.take_event_stream(true).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    let recoverable_failures = count_matching(&records, |e| {
        matches!(
            e,
            WorkflowEvent::ExecutorFailed { kind: FailureKind::Recoverable, .. }
        )
    });
    assert_eq!(recoverable_failures, 1);
    assert_eq!(
        count_matching(&records, |e| matches!(e, WorkflowEvent::WorkflowError { .. })),
        0
    );
    // The worker's invocation completed in the same step.
    let worker_completed = count_matching(&records, |e| {
        matches!(e, WorkflowEvent::ExecutorCompleted { executor_id } if executor_id == "worker")
    });
    assert_eq!(worker_completed, 1);
    assert_ne!(run.status(), RunStatus::Completed);
}

/// A fatal failure emits `WorkflowError` and completes the run.
#[tokio::test]
async fn fatal_failure_completes_run() {
    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Forwarder { id: "relay".to_string() }))
        .add_executor(Arc::new(Broken))
        .with_start_executor("relay")
        .add_edge("relay", "broken")
        .build()
        .unwrap();

    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!("hello"), "text").unwrap());

    let stream = run.take_event_stream(false).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    let fatal_failures = count_matching(&records, |e| {
        matches!(e, WorkflowEvent::ExecutorFailed { kind: FailureKind::Fatal, .. })
    });
    assert_eq!(fatal_failures, 1);
    assert_eq!(
        count_matching(&records, |e| matches!(e, WorkflowEvent::WorkflowError { .. })),
        1
    );
    assert_eq!(run.status(), RunStatus::Completed);
}

/// State writes publish at the step boundary: a step never reads its own
/// writes.
#[tokio::test]
async fn state_writes_are_step_fenced() {
    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Journal))
        .with_start_executor("journal")
        .add_edge("journal", "journal")
        .build()
        .unwrap();

    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!(0), "int").unwrap());

    let stream = run.take_event_stream(false).unwrap();
    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;

    let outputs = outputs_of(&records);
    assert_eq!(outputs.len(), 2);
    // Step 1 read nothing; step 2 sees step 1's write.
    assert_eq!(outputs[0].1, json!({"value": 0, "read": null}));
    assert_eq!(outputs[1].1, json!({"value": 1, "read": 0}));
}

/// In lockstep mode nothing runs until the event stream is polled.
#[tokio::test]
async fn lockstep_is_consumer_driven() {
    let workflow = ping_pong_workflow();
    let run = workflow.start_run(RunnerOptions::default()).unwrap();
    assert!(run.enqueue_input(json!(0), "int").unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(run.status(), RunStatus::NotStarted);
    run.dispose().await;
}

/// Restoring a checkpoint with an outstanding request republishes exactly
/// one `RequestInfo` before the next superstep, and the restored request can
/// be answered.
#[tokio::test]
async fn restore_republishes_outstanding_requests() {
    let workflow = guesser_workflow();
    let store = Arc::new(InMemoryCheckpointStore::new());

    let run = workflow
        .start_run_with_store(
            RunnerOptions::default().with_checkpointing(),
            store.clone(),
        )
        .unwrap();
    assert!(run.enqueue_input(json!("begin"), "start").unwrap());

    // Drive through superstep 1, which posts the request and checkpoints.
    let mut stream = run.take_event_stream(false).unwrap();
    let mut checkpoint = None;
    within(async {
        while checkpoint.is_none() {
            let record = stream.next().await.expect("stream ended early");
            if let WorkflowEvent::SuperStepCompleted { step: 1, checkpoint: info } = &record.event {
                checkpoint = info.clone();
            }
        }
    })
    .await;
    let checkpoint = checkpoint.expect("superstep 1 carried no checkpoint");
    drop(stream);
    run.dispose().await;

    // Fresh handle; the restore republishes the outstanding request.
    let resumed = workflow
        .start_run_with_store(RunnerOptions::default().with_checkpointing(), store)
        .unwrap();
    resumed.restore_checkpoint(&checkpoint).await.unwrap();

    let mut stream = resumed.take_event_stream(true).unwrap();
    let first = within(stream.next()).await.expect("stream ended early");
    let request_id = match &first.event {
        WorkflowEvent::RequestInfo { request } => request.request_id.clone(),
        other => panic!("expected republished RequestInfo, got {:?}", other),
    };

    resumed
        .enqueue_response(ExternalResponse::new(request_id, json!("42")))
        .unwrap();

    let records: Vec<_> = within(stream.collect::<Vec<_>>()).await;
    assert_eq!(outputs_of(&records), vec![("guesser".to_string(), json!("42"))]);
    resumed.dispose().await;
}

// --- structural properties -------------------------------------------------

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn portable_envelope_round_trips(value in any::<i64>(), tag in "[a-z]{1,8}") {
            let envelope = Envelope::external(json!(value), tag.clone());
            let portable = envelope.to_portable().unwrap();
            let back = Envelope::from_portable(&portable).unwrap();
            prop_assert_eq!(back.value, json!(value));
            prop_assert_eq!(back.type_tag, tag);
            prop_assert_eq!(back.source, SenderId::External);
        }

        #[test]
        fn step_context_preserves_sender_order(values in proptest::collection::vec(any::<i64>(), 1..20)) {
            let mut step = StepContext::new();
            for v in &values {
                step.commit(Arc::new(
                    Envelope::new(json!(v), "int", SenderId::Executor("s".into()))
                        .with_target("t"),
                ));
            }
            let pairs = step.into_pairs();
            let got: Vec<i64> = pairs[0].1.iter().map(|e| e.value.as_i64().unwrap()).collect();
            prop_assert_eq!(got, values);
        }
    }
}
