//! Flow runtime: hosts nodes, wires connectors, drives the lifecycle
//!
//! A [`Flow`] owns its nodes; nodes and ports only point back at it weakly.
//! There is no scheduler loop. Execution is the chain of trigger handlers
//! spawned through [`Flow::spawn`], which routes their failures (error
//! results and panics alike) to [`FlowEvent::Failure`].

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};

use crate::config::{defaults, EngineConfig};
use crate::error::{EngineError, NodeError, Result};
use crate::events::{EventSink, FlowEvent, NullEventSink};
use crate::node::Node;
use crate::port::{Connector, Input, Output};
use crate::registry::NodeRegistry;
use crate::state::ExecutionState;
use crate::typedef::TypeRegistry;
use crate::types::{FlowGraph, GraphConnector};
use crate::vault::Vault;

const FLOW_EVENT_CAPACITY: usize = 256;

/// Anything an editor can select and delete in a flow
#[derive(Debug, Clone)]
pub enum GraphItem {
    Node(Node),
    Connector(Arc<Connector>),
}

/// Collaborators and settings shared by every node of a flow
#[derive(Clone)]
pub struct FlowOptions {
    /// Receives status broadcasts
    pub sink: Arc<dyn EventSink>,
    /// Secret store bound to nodes with an id
    pub vault: Option<Arc<Vault>>,
    /// Type hierarchy consulted for connector compatibility
    pub types: Option<Arc<TypeRegistry>>,
    pub error_status_timeout_ms: u64,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            sink: Arc::new(NullEventSink),
            vault: None,
            types: None,
            error_status_timeout_ms: defaults::ERROR_STATUS_TIMEOUT_MS,
        }
    }
}

impl FlowOptions {
    /// Options derived from engine configuration, broadcasting to `sink`
    pub fn from_config(config: &EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            vault: Some(Arc::new(Vault::new(&config.vault.path))),
            types: None,
            error_status_timeout_ms: config.flows.error_status_timeout_ms,
        }
    }

    pub fn with_types(mut self, types: Arc<TypeRegistry>) -> Self {
        self.types = Some(types);
        self
    }
}

/// Lifecycle state of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Running,
    /// Terminal; the flow is inert
    Stopped,
}

/// A running (or runnable) flow graph
pub struct Flow {
    id: String,
    name: String,
    this: Weak<Flow>,
    nodes: RwLock<Vec<Node>>,
    state: RwLock<FlowState>,
    options: FlowOptions,
    events: broadcast::Sender<FlowEvent>,
    /// First unhandled failure; never lost to a lagging subscriber
    failure: Mutex<Option<String>>,
    /// First node error, kept for the same reason
    first_error: Mutex<Option<NodeError>>,
    failed: Notify,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &*self.state.read())
            .field("nodes", &self.nodes.read().len())
            .finish()
    }
}

impl Flow {
    /// Create an empty flow; an empty id is replaced by a generated one
    pub fn new(id: impl Into<String>, name: impl Into<String>, options: FlowOptions) -> Arc<Self> {
        let mut id = id.into();
        if id.is_empty() {
            id = uuid::Uuid::new_v4().to_string();
        }
        let (events, _) = broadcast::channel(FLOW_EVENT_CAPACITY);
        Arc::new_cyclic(|this| Self {
            id,
            name: name.into(),
            this: this.clone(),
            nodes: RwLock::new(Vec::new()),
            state: RwLock::new(FlowState::Idle),
            options,
            events,
            failure: Mutex::new(None),
            first_error: Mutex::new(None),
            failed: Notify::new(),
        })
    }

    /// Materialize a persisted graph
    ///
    /// Every node name must resolve in `registry`; connectors are checked
    /// for compatibility and connector limits.
    pub fn from_graph(graph: &FlowGraph, registry: &NodeRegistry, options: FlowOptions) -> Result<Arc<Self>> {
        let flow = Self::new(graph.id.clone(), graph.name.clone(), options);

        for instance in &graph.nodes {
            let manifest = registry
                .manifest(&instance.name)
                .ok_or_else(|| EngineError::resolution(&instance.name, "no manifest registered"))?;
            let constructor = registry.resolve(manifest)?;

            let node = Node::new(manifest, Some(instance), flow.options.vault.clone())?;
            flow.add_node(node.clone())?;
            let constructed = match panic::catch_unwind(AssertUnwindSafe(|| constructor.construct(&node))) {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
            };
            constructed
                .map_err(|reason| EngineError::resolution(&instance.name, format!("constructor failed: {}", reason)))?;
        }

        for connector in &graph.connectors {
            flow.connect_by_name(
                &connector.source,
                &connector.source_handle,
                &connector.target,
                &connector.target_handle,
            )?;
        }

        log::info!(
            "Flow '{}' materialized with {} nodes and {} connectors",
            flow.id,
            graph.nodes.len(),
            graph.connectors.len()
        );
        Ok(flow)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FlowState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == FlowState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == FlowState::Stopped
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.options.sink
    }

    pub fn vault(&self) -> Option<&Arc<Vault>> {
        self.options.vault.as_ref()
    }

    pub fn error_status_timeout_ms(&self) -> u64 {
        self.options.error_status_timeout_ms
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: FlowEvent) {
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Graph
    // =========================================================================

    /// Attach a node; a node without an id is given one
    pub fn add_node(&self, node: Node) -> Result<Node> {
        if let Some(owner) = node.flow() {
            return Err(EngineError::precondition(format!(
                "node '{}' is already attached to flow '{}'",
                node.name(),
                owner.id()
            )));
        }

        let mut nodes = self.nodes.write();
        let id = match node.id() {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                node.assign_id(id.clone());
                id
            }
        };
        if nodes.iter().any(|n| n.id().as_deref() == Some(id.as_str())) {
            return Err(EngineError::precondition(format!("duplicate node id '{}'", id)));
        }

        node.attach(self.this.clone());
        nodes.push(node.clone());
        log::debug!("Attached node '{}' ({}) to flow '{}'", node.name(), id, self.id);
        Ok(node)
    }

    /// Detach a node, dropping every connector touching it
    pub fn remove_node(&self, id: &str) -> Option<Node> {
        let node = {
            let mut nodes = self.nodes.write();
            let index = nodes.iter().position(|n| n.id().as_deref() == Some(id))?;
            nodes.remove(index)
        };

        for input in node.inputs() {
            for connector in input.connectors() {
                connector.origin().remove_connector(connector.id());
            }
        }
        for output in node.outputs() {
            for connector in output.connectors() {
                if let Some(destination) = connector.destination() {
                    destination.remove_connector(connector.id());
                }
            }
        }
        node.teardown();
        node.attach(Weak::new());
        Some(node)
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.nodes.read().iter().find(|n| n.id().as_deref() == Some(id)).cloned()
    }

    /// Nodes in attachment order
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().clone()
    }

    /// Join an output to an input
    pub fn connect(&self, origin: &Output, destination: &Input) -> Result<Arc<Connector>> {
        if !self.compatible(origin, destination) {
            return Err(EngineError::IncompatibleConnector {
                origin: describe(origin.name(), origin.data_type()),
                destination: describe(destination.name(), destination.data_type()),
            });
        }
        for port in [&**origin, &**destination] {
            if let Some(max) = port.max_connectors() {
                if port.connectors().len() >= max {
                    return Err(EngineError::ConnectorLimit { port: port.name(), max });
                }
            }
        }

        let connector = Arc::new(Connector::new(origin.clone(), destination.clone()));
        origin.push_connector(Arc::clone(&connector));
        destination.push_connector(Arc::clone(&connector));
        Ok(connector)
    }

    /// Join ports addressed by node id and port name
    pub fn connect_by_name(
        &self,
        source: &str,
        source_handle: &str,
        target: &str,
        target_handle: &str,
    ) -> Result<Arc<Connector>> {
        let origin = self
            .node(source)
            .ok_or_else(|| EngineError::NotFound(format!("node '{}'", source)))?
            .output(source_handle)
            .ok_or_else(|| EngineError::NotFound(format!("output '{}' on node '{}'", source_handle, source)))?;
        let destination = self
            .node(target)
            .ok_or_else(|| EngineError::NotFound(format!("node '{}'", target)))?
            .input(target_handle)
            .ok_or_else(|| EngineError::NotFound(format!("input '{}' on node '{}'", target_handle, target)))?;
        self.connect(&origin, &destination)
    }

    /// Remove a connector from both of its ports
    pub fn disconnect(&self, connector: &Connector) {
        connector.origin().remove_connector(connector.id());
        if let Some(destination) = connector.destination() {
            destination.remove_connector(connector.id());
        }
    }

    /// Delete an editor selection
    pub fn remove(&self, item: &GraphItem) {
        match item {
            GraphItem::Node(node) => {
                if let Some(id) = node.id() {
                    self.remove_node(&id);
                }
            }
            GraphItem::Connector(connector) => self.disconnect(connector),
        }
    }

    fn compatible(&self, origin: &Output, destination: &Input) -> bool {
        match (origin.data_type(), destination.data_type()) {
            (None, None) => true,
            (Some(from), Some(to)) => {
                from == to
                    || self
                        .options
                        .types
                        .as_ref()
                        .is_some_and(|types| types.is_assignable(&from, &to))
            }
            (Some(_), None) => origin.is_single_type(),
            (None, Some(_)) => destination.is_single_type(),
        }
    }

    /// Global outputs of the given type, across all nodes
    pub fn global_outputs_by_type(&self, data_type: Option<&str>) -> Vec<Output> {
        self.nodes
            .read()
            .iter()
            .flat_map(|n| n.outputs())
            .filter(|o| o.is_global() && o.data_type().as_deref() == data_type)
            .collect()
    }

    /// Global inputs of the given type, across all nodes
    pub fn global_inputs_by_type(&self, data_type: Option<&str>) -> Vec<Input> {
        self.nodes
            .read()
            .iter()
            .flat_map(|n| n.inputs())
            .filter(|i| i.is_global() && i.data_type().as_deref() == data_type)
            .collect()
    }

    /// Serialize the live flow back into its persisted form
    pub fn to_graph(&self) -> FlowGraph {
        let nodes = self.nodes();
        let mut graph = FlowGraph::new(self.id.clone(), self.name.clone());

        for node in &nodes {
            let source = node.id().unwrap_or_default();
            for output in node.outputs() {
                for connector in output.connectors() {
                    let Some(destination) = connector.destination() else {
                        continue;
                    };
                    let target = destination.node().and_then(|n| n.id()).unwrap_or_default();
                    graph
                        .connectors
                        .push(GraphConnector::new(&source, output.name(), target, destination.name()));
                }
            }
        }
        graph.nodes = nodes.iter().map(Node::to_graph_node).collect();
        graph
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn enter_running(&self) -> Result<bool> {
        let mut state = self.state.write();
        match *state {
            FlowState::Idle => {
                *state = FlowState::Running;
                Ok(true)
            }
            FlowState::Running => Ok(false),
            FlowState::Stopped => Err(EngineError::precondition(format!(
                "flow '{}' has been stopped and cannot run again",
                self.id
            ))),
        }
    }

    /// Run every node's init hooks, each with a fresh root state
    pub fn start(&self) -> Result<()> {
        if !self.enter_running()? {
            log::debug!("Flow '{}' is already running", self.id);
            return Ok(());
        }
        let nodes = self.nodes();
        self.init(&nodes);
        log::info!("Flow '{}' started", self.id);
        self.emit(FlowEvent::Started);
        Ok(())
    }

    /// Run only the init hooks of the given nodes, for manual testing
    pub fn direct(&self, ids: &[String]) -> Result<()> {
        let first = self.enter_running()?;

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.node(id) {
                Some(node) => nodes.push(node),
                None => log::warn!("Flow '{}' has no node '{}' to run directly", self.id, id),
            }
        }
        self.init(&nodes);
        log::info!("Flow '{}' running {} nodes directly", self.id, nodes.len());
        if first {
            self.emit(FlowEvent::Started);
        }
        Ok(())
    }

    fn init(&self, nodes: &[Node]) {
        for node in nodes {
            let state = ExecutionState::new(self.id.clone());
            match panic::catch_unwind(AssertUnwindSafe(|| node.init_tasks(&state))) {
                Ok(tasks) => tasks.into_iter().for_each(|task| self.spawn(task)),
                Err(payload) => self.report_failure(format!(
                    "init of node '{}' panicked: {}",
                    node.name(),
                    panic_message(payload.as_ref())
                )),
            }
        }
    }

    /// Stop the flow; stopping twice is a no-op
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == FlowState::Stopped {
                return;
            }
            *state = FlowState::Stopped;
        }
        for node in self.nodes() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| node.close())) {
                log::error!(
                    "Close hook of node '{}' panicked: {}",
                    node.name(),
                    panic_message(payload.as_ref())
                );
            }
        }
        log::info!("Flow '{}' stopped", self.id);
        self.emit(FlowEvent::Stopped);
    }

    /// Run node work on the runtime, reporting errors and panics as failures
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let flow = self.this.clone();
        tokio::spawn(async move {
            let message = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panic: {}", panic_message(panic.as_ref())),
            };
            match flow.upgrade() {
                Some(flow) => flow.report_failure(message),
                None => log::error!("Unhandled failure after flow was dropped: {}", message),
            }
        });
    }

    /// Record an unhandled asynchronous failure
    pub fn report_failure(&self, message: String) {
        if self.is_stopped() {
            log::debug!("Ignoring failure on stopped flow '{}': {}", self.id, message);
            return;
        }
        log::error!("Unhandled failure in flow '{}': {}", self.id, message);
        self.failure.lock().get_or_insert_with(|| message.clone());
        self.failed.notify_waiters();
        self.emit(FlowEvent::Failure { message });
    }

    /// The first unhandled failure, if any
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Resolve with the first unhandled failure, waiting for one if needed
    pub async fn failed(&self) -> String {
        loop {
            let notified = self.failed.notified();
            if let Some(message) = self.failure() {
                return message;
            }
            notified.await;
        }
    }

    /// The first error reported through `Node::error`, if any
    pub fn first_error(&self) -> Option<NodeError> {
        self.first_error.lock().clone()
    }

    pub(crate) fn emit_error(&self, err: NodeError) {
        self.first_error.lock().get_or_insert_with(|| err.clone());
        self.emit(FlowEvent::Error(err));
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        for node in self.nodes.get_mut().iter() {
            node.teardown();
        }
    }
}

fn describe(name: String, data_type: Option<String>) -> String {
    match data_type {
        Some(t) => format!("{} ({})", name, t),
        None => format!("{} (untyped)", name),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
