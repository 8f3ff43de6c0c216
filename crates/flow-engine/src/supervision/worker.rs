//! Worker side of the supervision protocol
//!
//! A worker hosts exactly one flow. [`WorkerFsm`] tracks its lifecycle,
//! [`Worker::handle`] applies controller messages, and [`Worker::serve`]
//! runs the JSON-lines loop over any reader/writer pair (stdio in the
//! `flow-worker` binary, in-memory pipes in tests).

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::channel::{channel, Channel, ChannelEventSink, ChannelReceiver};
use super::messages::{ControllerMessage, WorkerMessage};
use crate::config::EngineConfig;
use crate::error::{EngineError, NodeError, Result};
use crate::events::FlowEvent;
use crate::flow::{panic_message, Flow, FlowOptions};
use crate::registry::NodeRegistry;
use crate::types::{FlowGraph, NodeManifest};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Waiting for a flow
    Uninitialized,
    /// Resolving nodes and materializing the flow
    Initializing,
    /// Flow built, not running
    Ready,
    Running,
    Stopped,
    /// Absorbing; the worker must exit
    Failed,
}

/// Worker lifecycle event
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Provision,
    Provisioned,
    Run,
    Stop,
    Fail(String),
}

/// Worker state machine
#[derive(Debug, Clone)]
pub struct WorkerFsm {
    state: WorkerState,
    error: Option<String>,
}

impl WorkerFsm {
    /// Create a new FSM in the uninitialized state
    pub fn new() -> Self {
        Self {
            state: WorkerState::Uninitialized,
            error: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Error message of the failure, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: WorkerEvent) -> Result<WorkerState> {
        let new_state = match (self.state, &event) {
            // Failure wins from anywhere
            (_, WorkerEvent::Fail(err)) => {
                if self.error.is_none() {
                    self.error = Some(err.clone());
                }
                WorkerState::Failed
            }

            (WorkerState::Uninitialized, WorkerEvent::Provision) => WorkerState::Initializing,
            (WorkerState::Initializing, WorkerEvent::Provisioned) => WorkerState::Ready,
            (WorkerState::Ready | WorkerState::Running, WorkerEvent::Run) => WorkerState::Running,

            // Stopping is idempotent and never an error
            (WorkerState::Uninitialized, WorkerEvent::Stop) => WorkerState::Uninitialized,
            (WorkerState::Failed, WorkerEvent::Stop) => WorkerState::Failed,
            (_, WorkerEvent::Stop) => WorkerState::Stopped,

            (state, event) => {
                return Err(EngineError::InvalidTransition {
                    from: format!("{:?}", state),
                    event: format!("{:?}", event),
                });
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for WorkerFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// How [`Worker::serve`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    Failed(String),
}

/// Hosts one flow on behalf of a controller
pub struct Worker {
    fsm: WorkerFsm,
    catalog: NodeRegistry,
    outbound: Channel<WorkerMessage>,
    config: EngineConfig,
    flow: Option<Arc<Flow>>,
    flow_events: Option<broadcast::Receiver<FlowEvent>>,
}

impl Worker {
    /// Create a worker resolving node implementations from `catalog`
    ///
    /// Returns the receiving end of the worker's outbound messages.
    pub fn new(catalog: NodeRegistry) -> (Self, ChannelReceiver<WorkerMessage>) {
        let (outbound, rx) = channel();
        (Self::with_channel(catalog, outbound), rx)
    }

    /// Create a worker sending through an existing channel
    pub fn with_channel(catalog: NodeRegistry, outbound: Channel<WorkerMessage>) -> Self {
        Self {
            fsm: WorkerFsm::new(),
            catalog,
            outbound,
            config: EngineConfig::default(),
            flow: None,
            flow_events: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.fsm.state()
    }

    pub fn flow(&self) -> Option<&Arc<Flow>> {
        self.flow.as_ref()
    }

    pub fn outbound(&self) -> &Channel<WorkerMessage> {
        &self.outbound
    }

    /// Tell the controller the worker is listening
    pub fn announce(&self) {
        self.outbound.send(WorkerMessage::Init);
    }

    /// Apply one controller message
    ///
    /// Provisioning and run failures are reported to the controller and
    /// move the worker to `Failed`; only protocol violations are returned.
    pub fn handle(&mut self, message: ControllerMessage) -> Result<()> {
        log::debug!("Worker in {:?} handling '{}'", self.state(), message.method());
        match message {
            ControllerMessage::Start {
                config,
                flow,
                nodes,
                direct_nodes,
            } => {
                self.fsm.process(WorkerEvent::Provision)?;
                let outcome = self.provision(config, &flow, &nodes).and_then(|()| {
                    self.fsm.process(WorkerEvent::Run)?;
                    self.launch(direct_nodes.as_deref(), true)
                });
                self.settle(outcome);
            }

            ControllerMessage::Init { config, flow, nodes } => {
                self.fsm.process(WorkerEvent::Provision)?;
                let outcome = self.provision(config, &flow, &nodes);
                self.settle(outcome);
            }

            ControllerMessage::Run => {
                let first = self.state() == WorkerState::Ready;
                self.fsm.process(WorkerEvent::Run)?;
                let outcome = self.launch(None, first);
                self.settle(outcome);
            }

            ControllerMessage::DirectNodes { direct_nodes } => {
                if self.flow.is_none() {
                    log::debug!("No flow to run nodes directly on, ignoring");
                    return Ok(());
                }
                let first = self.state() == WorkerState::Ready;
                self.fsm.process(WorkerEvent::Run)?;
                let outcome = self.launch(Some(&direct_nodes), first);
                self.settle(outcome);
            }

            ControllerMessage::Stop { error } => {
                if let Some(error) = error {
                    log::warn!("Controller requested stop: {}", error);
                }
                self.fsm.process(WorkerEvent::Stop)?;
                if let Some(flow) = &self.flow {
                    flow.stop();
                }
            }
        }
        Ok(())
    }

    /// Report a failure, force-stop the flow and enter `Failed`
    pub fn fail(&mut self, error: NodeError) {
        log::error!("Worker failed: {}", error);
        self.outbound.send(WorkerMessage::Stop {
            error: Some(error.clone()),
        });
        if let Some(flow) = &self.flow {
            flow.stop();
        }
        // Fail is accepted from every state
        let _ = self.fsm.process(WorkerEvent::Fail(error.message));
    }

    fn settle(&mut self, outcome: Result<()>) {
        if let Err(e) = outcome {
            self.fail(e.into());
        }
    }

    fn provision(
        &mut self,
        config: EngineConfig,
        graph: &FlowGraph,
        manifests: &HashMap<String, NodeManifest>,
    ) -> Result<()> {
        // Only the node types the graph uses are resolved, each once
        let mut registry = NodeRegistry::new();
        for name in graph.node_names() {
            let manifest = manifests
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::resolution(name, "no manifest supplied"))?;
            let constructor = self.catalog.resolve(&manifest)?;
            registry.register(manifest, constructor);
        }

        let sink = Arc::new(ChannelEventSink::new(self.outbound.clone()));
        let flow = Flow::from_graph(graph, &registry, FlowOptions::from_config(&config, sink))?;
        self.flow_events = Some(flow.subscribe());
        self.flow = Some(flow);
        self.config = config;

        self.fsm.process(WorkerEvent::Provisioned)?;
        self.outbound.send(WorkerMessage::Initialized);
        Ok(())
    }

    fn launch(&mut self, direct_nodes: Option<&[String]>, announce: bool) -> Result<()> {
        let flow = self
            .flow
            .as_ref()
            .ok_or_else(|| EngineError::precondition("no flow has been provisioned"))?;
        match direct_nodes {
            Some(ids) => flow.direct(ids)?,
            None => flow.start()?,
        }
        if announce {
            self.outbound.send(WorkerMessage::Started);
        }
        Ok(())
    }

    fn exit_status(&self, input_open: bool) -> Option<WorkerExit> {
        match self.state() {
            WorkerState::Failed => Some(WorkerExit::Failed(
                self.fsm.error().unwrap_or("unknown failure").to_string(),
            )),
            WorkerState::Stopped => Some(WorkerExit::Clean),
            // A running flow keeps going after the controller disappears
            WorkerState::Running => None,
            _ if !input_open => Some(WorkerExit::Clean),
            _ => None,
        }
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let message: ControllerMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Skipping unparseable controller message: {}", e);
                return;
            }
        };
        let method = message.method();
        match panic::catch_unwind(AssertUnwindSafe(|| self.handle(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Ignoring controller message: {}", e),
            Err(payload) => self.fail(NodeError::new(format!(
                "'{}' panicked: {}",
                method,
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn on_flow_event(&mut self, event: FlowEvent) {
        match event {
            FlowEvent::Error(err) if self.config.flows.stop_on_error => self.fail(err),
            FlowEvent::Error(err) => log::warn!("Node error: {}", err),
            // Failures are taken from the flow's failure slot
            FlowEvent::Failure { .. } | FlowEvent::Started | FlowEvent::Stopped => {}
        }
    }

    /// Recover what a lagging event receiver may have skipped
    fn on_events_lagged(&mut self) {
        if !self.config.flows.stop_on_error {
            return;
        }
        if let Some(err) = self.flow.as_ref().and_then(|flow| flow.first_error()) {
            self.fail(err);
        }
    }

    /// Run the protocol until the flow stops, fails, or the controller
    /// goes away while nothing is running
    pub async fn serve<R, W>(mut self, reader: R, writer: W, outbound: ChannelReceiver<WorkerMessage>) -> WorkerExit
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer_task = spawn_writer(writer, outbound);
        self.announce();

        let mut lines = BufReader::new(reader).lines();
        let mut input_open = true;

        let exit = loop {
            if let Some(exit) = self.exit_status(input_open) {
                break exit;
            }

            let flow = self.flow.clone();
            tokio::select! {
                message = flow_failure(flow.as_deref()) => self.fail(NodeError::new(message)),
                line = lines.next_line(), if input_open => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => {
                        log::info!("Controller closed the channel");
                        input_open = false;
                    }
                    Err(e) => {
                        log::warn!("Failed to read from controller: {}", e);
                        input_open = false;
                    }
                },
                signal = recv_flow_event(&mut self.flow_events) => match signal {
                    Some(FlowSignal::Event(event)) => self.on_flow_event(event),
                    Some(FlowSignal::Lagged) => self.on_events_lagged(),
                    None => self.flow_events = None,
                },
            }
        };

        if let Some(flow) = self.flow.take() {
            flow.stop();
        }
        self.outbound.close();
        if let Err(e) = writer_task.await {
            log::warn!("Writer task ended abnormally: {}", e);
        }
        log::info!("Worker exiting: {:?}", exit);
        exit
    }
}

enum FlowSignal {
    Event(FlowEvent),
    /// Events were dropped before the worker could read them
    Lagged,
}

async fn recv_flow_event(events: &mut Option<broadcast::Receiver<FlowEvent>>) -> Option<FlowSignal> {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(event) => Some(FlowSignal::Event(event)),
        Err(RecvError::Lagged(skipped)) => {
            log::warn!("Missed {} flow events", skipped);
            Some(FlowSignal::Lagged)
        }
        Err(RecvError::Closed) => None,
    }
}

async fn flow_failure(flow: Option<&Flow>) -> String {
    match flow {
        Some(flow) => flow.failed().await,
        None => std::future::pending().await,
    }
}

fn spawn_writer<W>(writer: W, mut outbound: ChannelReceiver<WorkerMessage>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to serialize worker message: {}", e);
                    continue;
                }
            };
            line.push('\n');
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                log::warn!("Controller unreachable, running detached: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_fsm_transitions() {
        let mut fsm = WorkerFsm::new();
        assert_eq!(fsm.state(), WorkerState::Uninitialized);

        fsm.process(WorkerEvent::Provision).unwrap();
        assert_eq!(fsm.state(), WorkerState::Initializing);

        fsm.process(WorkerEvent::Provisioned).unwrap();
        assert_eq!(fsm.state(), WorkerState::Ready);

        fsm.process(WorkerEvent::Run).unwrap();
        fsm.process(WorkerEvent::Run).unwrap();
        assert_eq!(fsm.state(), WorkerState::Running);

        fsm.process(WorkerEvent::Stop).unwrap();
        fsm.process(WorkerEvent::Stop).unwrap();
        assert_eq!(fsm.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_fsm_invalid_transitions() {
        let mut fsm = WorkerFsm::new();
        let err = fsm.process(WorkerEvent::Run).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        fsm.process(WorkerEvent::Provision).unwrap();
        assert!(fsm.process(WorkerEvent::Provision).is_err());
    }

    #[test]
    fn test_fsm_stop_before_start_is_noop() {
        let mut fsm = WorkerFsm::new();
        assert_eq!(fsm.process(WorkerEvent::Stop).unwrap(), WorkerState::Uninitialized);
    }

    #[test]
    fn test_fsm_failed_is_absorbing() {
        let mut fsm = WorkerFsm::new();
        fsm.process(WorkerEvent::Fail("first".into())).unwrap();
        fsm.process(WorkerEvent::Fail("second".into())).unwrap();
        fsm.process(WorkerEvent::Stop).unwrap();
        assert_eq!(fsm.state(), WorkerState::Failed);
        assert_eq!(fsm.error(), Some("first"));
        assert!(fsm.process(WorkerEvent::Provision).is_err());
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_start() {
        let (mut worker, mut rx) = Worker::new(NodeRegistry::with_builtins());
        let mut flow = FlowGraph::new("f", "f");
        flow.nodes.push(crate::types::GraphNode::new("a", "console.log"));

        worker
            .handle(ControllerMessage::Start {
                config: EngineConfig::default(),
                flow,
                nodes: HashMap::new(),
                direct_nodes: None,
            })
            .unwrap();

        assert_eq!(worker.state(), WorkerState::Failed);
        match rx.recv().await {
            Some(WorkerMessage::Stop { error: Some(error) }) => {
                assert!(error.message.contains("console.log"));
            }
            other => panic!("Expected stop with error, got {:?}", other),
        }
    }
}
