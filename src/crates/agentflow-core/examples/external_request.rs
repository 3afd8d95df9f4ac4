//! External request example
//!
//! This example demonstrates the request/response port protocol: an executor
//! posts a request through a declared port, the run parks awaiting the
//! response, and the embedding application answers through the run handle.

use agentflow_core::{
    handler, Executor, ExternalRequest, ExternalResponse, RequestPort, Result, RouteBuilder,
    RunnerOptions, TypeTag, WorkflowBuilder, WorkflowEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;

struct Approver;

#[async_trait]
impl Executor for Approver {
    fn id(&self) -> &str {
        "approver"
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec!["proposal".to_string(), "decision".to_string()]
    }

    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
        routes.on(
            "proposal",
            handler(|value, ctx, _cancel| async move {
                println!("approver: requesting sign-off for {}", value);
                ctx.post_external_request(ExternalRequest::new("sign-off", value))?;
                Ok(None)
            }),
        )?;
        routes.on(
            "decision",
            handler(|value, ctx, _cancel| async move {
                println!("approver: decision received: {}", value);
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
    println!("=== External Request Example ===\n");

    let workflow = WorkflowBuilder::new()
        .add_executor(Arc::new(Approver))
        .with_start_executor("approver")
        .with_request_port(RequestPort::new("sign-off", "proposal", "decision"), "approver")
        .build()?;

    let run = workflow.start_run(RunnerOptions::default())?;
    run.enqueue_input(json!({"action": "deploy"}), "proposal")?;

    let mut events = run.take_event_stream(true)?;
    while let Some(record) = events.next().await {
        match record.event {
            WorkflowEvent::RequestInfo { request } => {
                println!("outstanding request {}: {}", request.request_id, request.payload);
                // The embedding application answers the request.
                run.enqueue_response(ExternalResponse::new(request.request_id, json!("approved")))?;
            }
            WorkflowEvent::WorkflowOutput { value, .. } => {
                println!("workflow output: {}", value);
            }
            WorkflowEvent::RequestHalt => println!("workflow halted"),
            _ => {}
        }
    }

    println!("\nfinal status: {:?}", run.status());
    Ok(())
}
