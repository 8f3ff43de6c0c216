//! Nodes: typed units of work owning named ports
//!
//! A [`Node`] is a cheap, clonable handle. Ports hold a weak reference back
//! to their node and nodes a weak reference to their flow, so dropping the
//! flow releases the whole graph.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::config::defaults;
use crate::error::{EngineError, NodeError, Result};
use crate::events::NodeEvent;
use crate::flow::Flow;
use crate::port::{Input, Output, Pullable, Pushable};
use crate::state::ExecutionState;
use crate::status::{now_millis, Status, StatusMessage};
use crate::types::{GraphNode, NodeKind, NodeManifest, PortDefinition};
use crate::vault::Vault;

const NODE_EVENT_CAPACITY: usize = 64;

type InitHook = Arc<dyn Fn(ExecutionState) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type CloseHook = Arc<dyn Fn() + Send + Sync>;

/// Either a raw port definition or an already constructed port
pub enum PortSpec<P> {
    Definition(PortDefinition),
    Built(P),
}

impl<P> From<PortDefinition> for PortSpec<P> {
    fn from(definition: PortDefinition) -> Self {
        Self::Definition(definition)
    }
}

impl From<Input> for PortSpec<Input> {
    fn from(port: Input) -> Self {
        Self::Built(port)
    }
}

impl From<Output> for PortSpec<Output> {
    fn from(port: Output) -> Self {
        Self::Built(port)
    }
}

/// Ordered port storage with a name index
struct PortList<P> {
    ports: Vec<P>,
    index: HashMap<String, usize>,
}

impl<P: Clone> PortList<P> {
    fn new() -> Self {
        Self {
            ports: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert, replacing an existing port of the same name in place and
    /// returning it
    fn insert(&mut self, name: &str, port: P) -> Option<P> {
        match self.index.get(name) {
            Some(&i) => Some(std::mem::replace(&mut self.ports[i], port)),
            None => {
                self.index.insert(name.to_string(), self.ports.len());
                self.ports.push(port);
                None
            }
        }
    }

    fn get(&self, name: &str) -> Option<P> {
        self.index.get(name).map(|&i| self.ports[i].clone())
    }

    fn to_vec(&self) -> Vec<P> {
        self.ports.clone()
    }
}

pub(crate) struct NodeInner {
    id: RwLock<Option<String>>,
    name: String,
    kind: NodeKind,
    level: u32,
    description: Option<String>,
    position: (f64, f64),
    data: RwLock<Map<String, Value>>,
    inputs: RwLock<PortList<Input>>,
    outputs: RwLock<PortList<Output>>,
    flow: RwLock<Weak<Flow>>,
    states: Mutex<HashMap<String, Value>>,
    vault: Option<Arc<Vault>>,
    init_hooks: RwLock<Vec<InitHook>>,
    close_hooks: RwLock<Vec<CloseHook>>,
    events: broadcast::Sender<NodeEvent>,
}

/// Handle to a node in a flow graph
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

/// Non-owning node handle, for capture inside the node's own handlers
#[derive(Clone)]
pub struct WeakNode(Weak<NodeInner>);

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("name", &self.0.name)
            .field("kind", &self.0.kind)
            .finish()
    }
}

impl Node {
    /// Build a node from its manifest and, optionally, a persisted instance
    ///
    /// Instance data overrides manifest defaults; vault values override both.
    pub fn new(manifest: &NodeManifest, instance: Option<&GraphNode>, vault: Option<Arc<Vault>>) -> Result<Self> {
        let id = instance.map(|i| i.id.clone()).filter(|id| !id.is_empty());

        let mut data = manifest.data.clone();
        if let Some(instance) = instance {
            data.extend(instance.data.clone());
        }

        // The vault binding only exists for nodes with an id
        let vault = vault.filter(|_| id.is_some());
        if let Some(vault) = &vault {
            match vault.get(id.as_deref()) {
                Some(Value::Object(secrets)) => data.extend(secrets),
                Some(other) => log::warn!("Ignoring non-object vault entry for node {:?}: {}", id, other),
                None => {}
            }
        }

        let (events, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        let node = Self(Arc::new(NodeInner {
            id: RwLock::new(id),
            name: manifest.name.clone(),
            kind: manifest.kind,
            level: manifest.level,
            description: manifest.description.clone(),
            position: instance.map_or((0.0, 0.0), |i| (i.left, i.top)),
            data: RwLock::new(data),
            inputs: RwLock::new(PortList::new()),
            outputs: RwLock::new(PortList::new()),
            flow: RwLock::new(Weak::new()),
            states: Mutex::new(HashMap::new()),
            vault,
            init_hooks: RwLock::new(Vec::new()),
            close_hooks: RwLock::new(Vec::new()),
            events,
        }));

        let instance_inputs = instance.map(|i| i.inputs.as_slice()).unwrap_or_default();
        for def in manifest.inputs.iter().chain(instance_inputs) {
            node.add_input(&def.name, def.clone())?;
        }
        let instance_outputs = instance.map(|i| i.outputs.as_slice()).unwrap_or_default();
        for def in manifest.outputs.iter().chain(instance_outputs) {
            node.add_output(&def.name, def.clone())?;
        }

        Ok(node)
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self(inner)
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> Option<String> {
        self.0.id.read().clone()
    }

    pub(crate) fn assign_id(&self, id: String) {
        *self.0.id.write() = Some(id);
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> NodeKind {
        self.0.kind
    }

    pub fn level(&self) -> u32 {
        self.0.level
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    /// Snapshot of the node's configured data
    pub fn data(&self) -> Map<String, Value> {
        self.0.data.read().clone()
    }

    pub fn data_value(&self, key: &str) -> Option<Value> {
        self.0.data.read().get(key).cloned()
    }

    pub fn set_data_value(&self, key: impl Into<String>, value: Value) {
        self.0.data.write().insert(key.into(), value);
    }

    /// The owning flow, if attached and alive
    pub fn flow(&self) -> Option<Arc<Flow>> {
        self.0.flow.read().upgrade()
    }

    pub(crate) fn attach(&self, flow: Weak<Flow>) {
        *self.0.flow.write() = flow;
    }

    // =========================================================================
    // Ports
    // =========================================================================

    /// Register an input, replacing any input of the same name
    ///
    /// A replaced input is disconnected from its origins.
    pub fn add_input(&self, name: &str, spec: impl Into<PortSpec<Input>>) -> Result<Input> {
        let input = match spec.into() {
            PortSpec::Definition(def) => Input::new(def)?,
            PortSpec::Built(input) => input,
        };
        input.bind(name, Arc::downgrade(&self.0));
        let replaced = self.0.inputs.write().insert(name, input.clone());
        if let Some(old) = replaced.filter(|old| !old.same_port(&input)) {
            for connector in old.connectors() {
                connector.origin().remove_connector(connector.id());
            }
            old.clear();
        }
        Ok(input)
    }

    /// Register an output, replacing any output of the same name
    ///
    /// A replaced output is disconnected from its destinations.
    pub fn add_output(&self, name: &str, spec: impl Into<PortSpec<Output>>) -> Result<Output> {
        let output = match spec.into() {
            PortSpec::Definition(def) => Output::new(def)?,
            PortSpec::Built(output) => output,
        };
        output.bind(name, Arc::downgrade(&self.0));
        let replaced = self.0.outputs.write().insert(name, output.clone());
        if let Some(old) = replaced.filter(|old| !old.same_port(&output)) {
            for connector in old.connectors() {
                if let Some(destination) = connector.destination() {
                    destination.remove_connector(connector.id());
                }
            }
            old.clear();
        }
        Ok(output)
    }

    /// Inputs in registration order
    pub fn inputs(&self) -> Vec<Input> {
        self.0.inputs.read().to_vec()
    }

    /// Outputs in registration order
    pub fn outputs(&self) -> Vec<Output> {
        self.0.outputs.read().to_vec()
    }

    pub fn input(&self, name: &str) -> Option<Input> {
        self.0.inputs.read().get(name)
    }

    pub fn output(&self, name: &str) -> Option<Output> {
        self.0.outputs.read().get(name)
    }

    /// Whether an input of the given type has at least one connector
    ///
    /// `None` matches every input. Untyped inputs accept any type and
    /// therefore match every `Some` query too.
    pub fn has_connected_inputs_of_type(&self, data_type: Option<&str>) -> bool {
        self.0.inputs.read().ports.iter().any(|input| {
            let matches = match (data_type, input.data_type()) {
                (None, _) | (_, None) => true,
                (Some(wanted), Some(actual)) => wanted == actual,
            };
            matches && !input.connectors().is_empty()
        })
    }

    /// Fire the named output
    pub fn trigger_output(&self, name: &str, state: &ExecutionState) -> Result<()> {
        let output = self
            .output(name)
            .ok_or_else(|| EngineError::NotFound(format!("output '{}' on node '{}'", name, self.name())))?;
        output.trigger(state)
    }

    /// Pull the values of the named input
    pub async fn values_of(&self, name: &str, state: &ExecutionState) -> Result<Vec<Value>> {
        let input = self
            .input(name)
            .ok_or_else(|| EngineError::NotFound(format!("input '{}' on node '{}'", name, self.name())))?;
        input.get_values(state).await
    }

    // =========================================================================
    // Lifecycle and events
    // =========================================================================

    /// Run `hook` with a fresh state whenever the flow starts this node
    pub fn on_init<F, Fut>(&self, hook: F)
    where
        F: Fn(ExecutionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: InitHook = Arc::new(move |state| hook(state).boxed());
        self.0.init_hooks.write().push(hook);
    }

    /// Run `hook` when the flow stops
    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let hook: CloseHook = Arc::new(hook);
        self.0.close_hooks.write().push(hook);
    }

    pub(crate) fn init_tasks(&self, state: &ExecutionState) -> Vec<BoxFuture<'static, Result<()>>> {
        let hooks = self.0.init_hooks.read().clone();
        hooks.iter().map(|hook| hook(state.clone())).collect()
    }

    pub(crate) fn close(&self) {
        let hooks = self.0.close_hooks.read().clone();
        for hook in hooks {
            hook();
        }
    }

    /// Release handlers, hooks and connectors so captured clones are dropped
    pub(crate) fn teardown(&self) {
        for input in self.inputs() {
            input.clear();
        }
        for output in self.outputs() {
            output.clear();
        }
        self.0.init_hooks.write().clear();
        self.0.close_hooks.write().clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.0.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.0.events.send(event);
    }

    // =========================================================================
    // Scratch state and vault
    // =========================================================================

    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.0.states.lock().get(key).cloned()
    }

    pub fn set_state_value(&self, key: impl Into<String>, value: Value) {
        self.0.states.lock().insert(key.into(), value);
    }

    pub fn remove_state_value(&self, key: &str) -> Option<Value> {
        self.0.states.lock().remove(key)
    }

    /// The node's secret-vault binding; absent for nodes without an id
    pub fn vault(&self) -> Option<NodeVault<'_>> {
        self.0.vault.as_deref().map(|vault| NodeVault { node: self, vault })
    }

    // =========================================================================
    // Status broadcasts
    // =========================================================================

    fn broadcast(&self, build: impl FnOnce(String, String) -> StatusMessage) {
        let Some(flow) = self.flow() else {
            log::debug!("Node '{}' is not attached to a flow, dropping status", self.name());
            return;
        };
        let message = build(self.id().unwrap_or_default(), flow.id().to_string());
        if let Err(e) = flow.sink().send(message) {
            log::trace!("Status of node '{}' not delivered: {}", self.name(), e);
        }
    }

    /// Show a status badge; returns its generated id
    pub fn add_status(&self, mut status: Status) -> Result<String> {
        if status.is_empty() {
            return Err(EngineError::argument("status"));
        }
        let status_id = uuid::Uuid::new_v4().to_string();
        status.id = Some(status_id.clone());
        self.broadcast(|node_id, flow_id| StatusMessage::AddStatus {
            node_id,
            flow_id,
            status,
        });
        Ok(status_id)
    }

    /// Change the message and color of an existing status
    pub fn update_status_by_id(&self, status_id: &str, status: Status) -> Result<String> {
        if status_id.is_empty() {
            return Err(EngineError::argument("statusId"));
        }
        if status.is_empty() {
            return Err(EngineError::argument("status"));
        }
        let status = Status {
            id: Some(status_id.to_string()),
            message: status.message,
            color: status.color,
            ..Default::default()
        };
        self.broadcast(|node_id, flow_id| StatusMessage::UpdateStatusById {
            node_id,
            flow_id,
            status,
        });
        Ok(status_id.to_string())
    }

    /// Remove a status or progress bar, optionally after `timeout_ms`
    pub fn remove_status_by_id(&self, status_id: &str, timeout_ms: Option<u64>) -> Result<()> {
        if status_id.is_empty() {
            return Err(EngineError::argument("statusId"));
        }
        let status = Status {
            id: Some(status_id.to_string()),
            timeout: timeout_ms,
            ..Default::default()
        };
        self.broadcast(|node_id, flow_id| StatusMessage::RemoveStatusById {
            node_id,
            flow_id,
            status,
        });
        Ok(())
    }

    pub fn remove_progress_bar_by_id(&self, status_id: &str, timeout_ms: Option<u64>) -> Result<()> {
        self.remove_status_by_id(status_id, timeout_ms)
    }

    pub fn remove_all_statuses(&self) {
        self.broadcast(|node_id, flow_id| StatusMessage::RemoveAllStatuses { node_id, flow_id });
    }

    /// Show a progress bar; returns its generated id
    pub fn add_progress_bar(&self, mut status: Status) -> Result<String> {
        if status.is_empty() {
            return Err(EngineError::argument("status"));
        }
        let status_id = uuid::Uuid::new_v4().to_string();
        status.id = Some(status_id.clone());
        status.start_date.get_or_insert_with(now_millis);
        self.broadcast(|node_id, flow_id| StatusMessage::AddProgressBar {
            node_id,
            flow_id,
            status,
        });
        Ok(status_id)
    }

    pub fn update_progress_bar_by_id(&self, status_id: &str, status: Status) -> Result<String> {
        if status_id.is_empty() {
            return Err(EngineError::argument("statusId"));
        }
        if status.is_empty() {
            return Err(EngineError::argument("status"));
        }
        let status = Status {
            id: Some(status_id.to_string()),
            percentage: status.percentage,
            ..Default::default()
        };
        self.broadcast(|node_id, flow_id| StatusMessage::UpdateProgressBarById {
            node_id,
            flow_id,
            status,
        });
        Ok(status_id.to_string())
    }

    /// Replace the node's single tracker line
    pub fn set_tracker(&self, status: Status) -> Result<()> {
        if status.is_empty() {
            return Err(EngineError::argument("status"));
        }
        self.broadcast(|node_id, flow_id| StatusMessage::SetTracker {
            node_id,
            flow_id,
            status,
        });
        Ok(())
    }

    /// Report a runtime error raised by this node's logic
    ///
    /// Requires an execution state, either passed in or already carried by
    /// `err`. Shows a red tracker and emits an error event on the flow.
    pub fn error(&self, err: impl Into<NodeError>, state: Option<&ExecutionState>) -> Result<NodeError> {
        let mut err = err.into();
        let flow = self.flow();
        let flow_id = flow.as_ref().map(|f| f.id().to_string());

        let state = match (state, err.state.as_ref()) {
            (Some(state), _) | (None, Some(state)) => state.clone(),
            (None, None) => {
                return Err(EngineError::precondition(
                    "an execution state is required to report a node error",
                ))
            }
        };
        if !state.belongs_to(flow_id.as_deref()) {
            return Err(EngineError::precondition(format!(
                "execution state of flow '{}' does not belong to node '{}'",
                state.flow_id(),
                self.name()
            )));
        }

        err = err.with_state(state);
        err.node_id = self.id();
        err.node_name = Some(self.name().to_string());
        err.flow_id = flow_id;

        let timeout = flow
            .as_ref()
            .map_or(defaults::ERROR_STATUS_TIMEOUT_MS, |f| f.error_status_timeout_ms());
        let tracker = Status::message(err.message.clone()).with_color("red").with_timeout(timeout);
        if let Err(e) = self.set_tracker(tracker) {
            log::debug!("Could not show error tracker on node '{}': {}", self.name(), e);
        }

        log::warn!("Node '{}' reported an error: {}", self.name(), err.message);
        if let Some(flow) = flow {
            flow.emit_error(err.clone());
        }
        Ok(err)
    }

    /// Serializable snapshot, excluding flow, scratch state and vault
    pub fn to_graph_node(&self) -> GraphNode {
        GraphNode {
            id: self.id().unwrap_or_default(),
            name: self.name().to_string(),
            data: self.data(),
            inputs: self.inputs().iter().map(|p| p.definition()).collect(),
            outputs: self.outputs().iter().map(|p| p.definition()).collect(),
            left: self.0.position.0,
            top: self.0.position.1,
        }
    }
}

/// A node's view of the secret vault
pub struct NodeVault<'a> {
    node: &'a Node,
    vault: &'a Vault,
}

impl NodeVault<'_> {
    pub fn get(&self) -> Option<Value> {
        self.vault.get(self.node.id().as_deref())
    }

    /// Store secrets for the node; object keys are also merged into `data`
    pub fn set(&self, value: Value) -> Result<()> {
        if let Value::Object(fields) = &value {
            self.node.0.data.write().extend(fields.clone());
        }
        self.vault.set(self.node.id().as_deref(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::flow::FlowOptions;
    use serde_json::json;

    fn manifest() -> NodeManifest {
        NodeManifest::new("test.node", NodeKind::Action)
            .with_input(PortDefinition::typed("trigger", "trigger"))
            .with_input(PortDefinition::typed("value", "string"))
            .with_output(PortDefinition::typed("done", "trigger"))
    }

    #[test]
    fn test_ports_from_manifest_in_order() {
        let node = Node::new(&manifest(), None, None).unwrap();
        let names: Vec<String> = node.inputs().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["trigger", "value"]);
        assert_eq!(node.outputs().len(), 1);
        assert!(node.input("value").unwrap().node().unwrap().ptr_eq(&node));
    }

    #[test]
    fn test_add_input_replaces_by_name() {
        let node = Node::new(&manifest(), None, None).unwrap();
        let replaced = node.add_input("value", PortDefinition::typed("ignored", "number")).unwrap();

        assert_eq!(node.inputs().len(), 2);
        assert_eq!(replaced.name(), "value");
        assert!(node.input("value").unwrap().same_port(&replaced));
        assert_eq!(node.input("value").unwrap().data_type().as_deref(), Some("number"));
        // Position is kept
        assert_eq!(node.inputs()[1].name(), "value");
    }

    #[test]
    fn test_add_prebuilt_port() {
        let node = Node::new(&manifest(), None, None).unwrap();
        let port = Output::new(PortDefinition::typed("tmp", "string")).unwrap();
        let added = node.add_output("result", port.clone()).unwrap();
        assert!(added.same_port(&port));
        assert_eq!(port.name(), "result");
        assert!(node.output("result").unwrap().same_port(&port));
    }

    #[test]
    fn test_replacing_connected_ports_disconnects_peers() {
        let flow = Flow::new("f", "f", FlowOptions::default());
        let source = flow.add_node(Node::new(&manifest(), None, None).unwrap()).unwrap();
        let sink = flow.add_node(Node::new(&manifest(), None, None).unwrap()).unwrap();
        let done = source.output("done").unwrap();
        flow.connect(&done, &sink.input("trigger").unwrap()).unwrap();
        assert_eq!(done.connectors().len(), 1);

        let old_input = sink.input("trigger").unwrap();
        sink.add_input("trigger", PortDefinition::typed("trigger", "trigger")).unwrap();
        assert!(done.connectors().is_empty());
        assert!(old_input.connectors().is_empty());
        assert!(sink.input("trigger").unwrap().connectors().is_empty());

        let input = sink.input("trigger").unwrap();
        flow.connect(&done, &input).unwrap();
        source.add_output("done", PortDefinition::typed("done", "trigger")).unwrap();
        assert!(input.connectors().is_empty());
        assert!(done.connectors().is_empty());
    }

    #[test]
    fn test_re_adding_same_port_keeps_connectors() {
        let flow = Flow::new("f", "f", FlowOptions::default());
        let source = flow.add_node(Node::new(&manifest(), None, None).unwrap()).unwrap();
        let sink = flow.add_node(Node::new(&manifest(), None, None).unwrap()).unwrap();
        let input = sink.input("trigger").unwrap();
        flow.connect(&source.output("done").unwrap(), &input).unwrap();

        sink.add_input("trigger", input.clone()).unwrap();
        assert_eq!(input.connectors().len(), 1);
        assert_eq!(source.output("done").unwrap().connectors().len(), 1);
    }

    #[test]
    fn test_connected_inputs_by_type() {
        let flow = Flow::new("f", "f", FlowOptions::default());
        let source = flow.add_node(Node::new(&manifest(), None, None).unwrap()).unwrap();
        let sink = flow.add_node(Node::new(&manifest(), None, None).unwrap()).unwrap();
        assert!(!sink.has_connected_inputs_of_type(None));

        flow.connect(&source.output("done").unwrap(), &sink.input("trigger").unwrap())
            .unwrap();
        assert!(sink.has_connected_inputs_of_type(None));
        assert!(sink.has_connected_inputs_of_type(Some("trigger")));
        // "value" is typed but not connected
        assert!(!sink.has_connected_inputs_of_type(Some("string")));

        let any = sink.add_input("any", PortDefinition::new("any")).unwrap();
        let loose = source.add_output("loose", PortDefinition::new("loose")).unwrap();
        flow.connect(&loose, &any).unwrap();
        assert!(sink.has_connected_inputs_of_type(Some("string")));
    }

    #[test]
    fn test_instance_ports_override_manifest() {
        let mut instance = GraphNode::new("n1", "test.node");
        instance.inputs.push(PortDefinition::typed("value", "string").global());

        let node = Node::new(&manifest(), Some(&instance), None).unwrap();
        assert!(node.input("value").unwrap().is_global());
        assert_eq!(node.inputs().len(), 2);
    }

    #[test]
    fn test_vault_overrides_data() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::new(dir.path().join("vault.json")));
        vault.set(Some("n1"), json!({ "password": "secret" })).unwrap();

        let mut manifest = manifest();
        manifest.data.insert("password".into(), json!("default"));
        manifest.data.insert("host".into(), json!("localhost"));

        let node = Node::new(&manifest, Some(&GraphNode::new("n1", "test.node")), Some(vault.clone())).unwrap();
        assert_eq!(node.data_value("password"), Some(json!("secret")));
        assert_eq!(node.data_value("host"), Some(json!("localhost")));

        node.vault().unwrap().set(json!({ "password": "rotated" })).unwrap();
        assert_eq!(node.data_value("password"), Some(json!("rotated")));
        assert_eq!(Vault::new(vault.path()).get(Some("n1")), Some(json!({ "password": "rotated" })));
    }

    #[test]
    fn test_no_vault_binding_without_id() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::new(dir.path().join("vault.json")));
        let node = Node::new(&manifest(), None, Some(vault)).unwrap();
        assert!(node.vault().is_none());
    }

    #[test]
    fn test_status_argument_errors() {
        let node = Node::new(&manifest(), None, None).unwrap();
        assert_eq!(node.add_status(Status::default()).unwrap_err().kind(), ErrorKind::Argument);
        assert_eq!(
            node.update_status_by_id("", Status::message("x")).unwrap_err().kind(),
            ErrorKind::Argument
        );
        assert_eq!(
            node.update_progress_bar_by_id("id", Status::default()).unwrap_err().kind(),
            ErrorKind::Argument
        );
        assert_eq!(node.remove_status_by_id("", None).unwrap_err().kind(), ErrorKind::Argument);
        assert_eq!(node.set_tracker(Status::default()).unwrap_err().kind(), ErrorKind::Argument);
        // Detached nodes still get an id back
        assert!(node.add_progress_bar(Status::progress(0.0)).is_ok());
    }

    #[test]
    fn test_error_requires_state() {
        let node = Node::new(&manifest(), None, None).unwrap();
        let err = node.error("boom", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let state = ExecutionState::new("flow");
        let reported = node.error("boom", Some(&state)).unwrap();
        assert_eq!(reported.node_name.as_deref(), Some("test.node"));
        assert_eq!(reported.state_id, Some(state.id().to_string()));

        // A state carried by the error itself is enough
        let carried = NodeError::new("again").with_state(state.clone());
        assert!(node.error(carried, None).is_ok());
    }

    #[test]
    fn test_scratch_states() {
        let node = Node::new(&manifest(), None, None).unwrap();
        node.set_state_value("count", json!(1));
        assert_eq!(node.state_value("count"), Some(json!(1)));
        assert_eq!(node.remove_state_value("count"), Some(json!(1)));
        assert!(node.state_value("count").is_none());
    }

    #[test]
    fn test_to_graph_node_snapshot() {
        let mut instance = GraphNode::new("n1", "test.node");
        instance.left = 10.0;
        instance.data.insert("k".into(), json!("v"));
        let node = Node::new(&manifest(), Some(&instance), None).unwrap();

        let snapshot = node.to_graph_node();
        assert_eq!(snapshot.id, "n1");
        assert_eq!(snapshot.left, 10.0);
        assert_eq!(snapshot.data.get("k"), Some(&json!("v")));
        assert_eq!(snapshot.inputs.len(), 2);
    }
}
