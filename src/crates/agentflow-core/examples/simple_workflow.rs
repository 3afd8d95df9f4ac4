//! Simple workflow example
//!
//! This example demonstrates a two-executor pipeline: a doubler forwards its
//! result to a reporter, which yields the workflow output.

use agentflow_core::{
    handler, value_handler, Executor, Result, RouteBuilder, RunnerOptions, TypeTag,
    WorkflowBuilder, WorkflowEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;

struct Doubler;

#[async_trait]
impl Executor for Doubler {
    fn id(&self) -> &str {
        "doubler"
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
            value_handler(|value, _ctx, _cancel| async move {
                let doubled = value.as_i64().unwrap_or(0) * 2;
                println!("doubler: {} -> {}", value, doubled);
                Ok(json!(doubled))
            }),
        )?;
        Ok(())
    }
}

struct Reporter;

#[async_trait]
impl Executor for Reporter {
    fn id(&self) -> &str {
        "reporter"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["int".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "int",
            handler(|value, ctx, _cancel| async move {
                ctx.yield_output(value);
                ctx.request_halt();
                Ok(None)
            }),
        )?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Simple Workflow Example ===\n");

    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Doubler))
        .add_executor(Arc::new(Reporter))
        .with_start_executor("doubler")
        .add_edge("doubler", "reporter")
        .build()?;

    let run = workflow.start_run(RunnerOptions::default())?;
    run.enqueue_input(json!(21), "int")?;

    let mut events = run.take_event_stream(true)?;
    while let Some(record) = events.next().await {
        match record.event {
            WorkflowEvent::SuperStepCompleted { step, .. } => {
                println!("superstep {} completed", step);
            }
            WorkflowEvent::WorkflowOutput { source_id, value } => {
                println!("output from {}: {}", source_id, value);
            }
            WorkflowEvent::RequestHalt => println!("workflow halted"),
            _ => {}
        }
    }

    println!("\nfinal status: {:?}", run.status());
    Ok(())
}
