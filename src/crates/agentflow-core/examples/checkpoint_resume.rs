//! Checkpoint resume example
//!
//! This example runs a counting workflow with per-superstep checkpointing,
//! abandons the run partway, then restores a mid-run checkpoint into a fresh
//! handle and lets it finish.

use agentflow_core::{
    handler, Executor, InMemoryCheckpointStore, Result, RouteBuilder, RunnerOptions, TypeTag,
    WorkflowBuilder, WorkflowEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;

struct Countdown;

#[async_trait]
impl Executor for Countdown {
    fn id(&self) -> &str {
        "countdown"
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
            handler(|value, ctx, _cancel| async move {
                let remaining = value.as_i64().unwrap_or(0);
                println!("countdown: {}", remaining);
                if remaining == 0 {
                    ctx.yield_output(json!("liftoff"));
                    ctx.request_halt();
                    Ok(None)
                } else {
                    Ok(Some(json!(remaining - 1)))
                }
            }),
        )?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Checkpoint Resume Example ===\n");

    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Countdown))
        .with_start_executor("countdown")
        .add_edge("countdown", "countdown")
        .build()?;
    let store = Arc::new(InMemoryCheckpointStore::new());

    // First run: step through the countdown, then abandon it.
    let run = workflow
        .start_run_with_store(RunnerOptions::default().with_checkpointing(), store.clone())?;
    run.enqueue_input(json!(5), "int")?;

    let mut events = run.take_event_stream(false)?;
    let mut resume_from = None;
    while resume_from.is_none() {
        let record = events.next().await.expect("run ended early");
        if let WorkflowEvent::SuperStepCompleted { step: 3, checkpoint } = record.event {
            resume_from = checkpoint;
        }
    }
    drop(events);
    run.dispose().await;
    let resume_from = resume_from.expect("checkpointing was enabled");
    println!("\nabandoned after superstep {}\n", resume_from.step_number);

    // Second run: restore the mid-run snapshot and finish.
    let resumed = workflow
        .start_run_with_store(RunnerOptions::default().with_checkpointing(), store)?;
    resumed.restore_checkpoint(&resume_from).await?;

    let mut events = resumed.take_event_stream(true)?;
    while let Some(record) = events.next().await {
        if let WorkflowEvent::WorkflowOutput { value, .. } = record.event {
            println!("workflow output: {}", value);
        }
    }

    println!("final status: {:?}", resumed.status());
    Ok(())
}
