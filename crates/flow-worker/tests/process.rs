//! The worker binary driven through `WorkerProcess` over real stdio pipes

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flow_engine::nodes::{console_log, start};
use flow_engine::supervision::{WorkerMessage, WorkerProcess};
use flow_engine::{EngineConfig, FlowGraph, GraphConnector, GraphNode, VecEventSink};
use tokio::sync::mpsc::UnboundedReceiver;

const STEP: Duration = Duration::from_secs(10);

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.program = PathBuf::from(env!("CARGO_BIN_EXE_flow-worker"));
    config
}

fn hello_flow() -> FlowGraph {
    let mut flow = FlowGraph::new("hello", "Hello");
    flow.nodes.push(GraphNode::new("start", start::NAME));
    flow.nodes.push(GraphNode::new("log", console_log::NAME));
    flow.connectors
        .push(GraphConnector::new("start", start::PORT_TRIGGER, "log", console_log::PORT_TRIGGER));
    flow
}

async fn next(events: &mut UnboundedReceiver<WorkerMessage>) -> Option<WorkerMessage> {
    tokio::time::timeout(STEP, events.recv())
        .await
        .expect("worker did not reply in time")
}

async fn drain(events: &mut UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
    let mut messages = Vec::new();
    while let Some(message) = next(events).await {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn test_worker_exits_clean_when_controller_closes() {
    let (mut worker, mut events) = WorkerProcess::spawn(&config(), Arc::new(VecEventSink::new())).unwrap();
    assert!(worker.id().is_some());
    assert!(matches!(next(&mut events).await, Some(WorkerMessage::Init)));

    // Stop before any flow is a no-op; closing the pipe ends the worker
    assert!(worker.stop(None));
    worker.close();

    assert!(drain(&mut events).await.is_empty());
    let status = tokio::time::timeout(STEP, worker.wait()).await.unwrap().unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_worker_exits_non_zero_on_failed_start() {
    let (mut worker, mut events) = WorkerProcess::spawn(&config(), Arc::new(VecEventSink::new())).unwrap();
    assert!(matches!(next(&mut events).await, Some(WorkerMessage::Init)));

    let mut nodes = HashMap::new();
    nodes.insert(start::NAME.to_string(), start::manifest());
    nodes.insert(
        console_log::NAME.to_string(),
        console_log::manifest().with_path("/nonexistent/nodes/console.log"),
    );
    assert!(worker.start(config(), hello_flow(), nodes, None));

    let messages = drain(&mut events).await;
    assert!(!messages.iter().any(|m| matches!(m, WorkerMessage::Started)));
    let error = messages
        .iter()
        .find_map(|m| match m {
            WorkerMessage::Stop { error: Some(error) } => Some(error.message.clone()),
            _ => None,
        })
        .expect("worker did not report the failed start");
    assert!(error.contains("console.log"));

    let status = tokio::time::timeout(STEP, worker.wait()).await.unwrap().unwrap();
    assert_eq!(status.code(), Some(1));
}
