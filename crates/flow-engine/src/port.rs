//! Ports, connectors and the trigger protocol
//!
//! A [`Port`] is a typed endpoint owned by a node. [`Input`] and [`Output`]
//! are thin typed handles over a shared port, each adding the behavior of
//! its direction:
//!
//! - [`Pullable`] (inputs): aggregate values from every upstream origin.
//! - [`Pushable`] (outputs): fan a trigger out to every connected input,
//!   giving each branch its own split [`ExecutionState`].

use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{EngineError, Result};
use crate::events::{NodeEvent, PortEvent};
use crate::flow::Flow;
use crate::node::{Node, NodeInner};
use crate::state::ExecutionState;
use crate::types::PortDefinition;

const PORT_EVENT_CAPACITY: usize = 64;

/// Direction of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Produces the value an input pulls through a connector
#[async_trait]
pub trait OutputHandler: Send + Sync {
    /// Return `None` to contribute nothing, a JSON array to contribute
    /// several values, anything else to contribute one value.
    async fn pull(&self, connector: Arc<Connector>, state: ExecutionState) -> Result<Option<Value>>;
}

/// Reacts to a trigger pushed into an input
#[async_trait]
pub trait InputHandler: Send + Sync {
    async fn triggered(&self, connector: Arc<Connector>, state: ExecutionState) -> Result<()>;
}

struct FnOutputHandler<F>(F);

#[async_trait]
impl<F, Fut> OutputHandler for FnOutputHandler<F>
where
    F: Fn(Arc<Connector>, ExecutionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    async fn pull(&self, connector: Arc<Connector>, state: ExecutionState) -> Result<Option<Value>> {
        (self.0)(connector, state).await
    }
}

struct FnInputHandler<F>(F);

#[async_trait]
impl<F, Fut> InputHandler for FnInputHandler<F>
where
    F: Fn(Arc<Connector>, ExecutionState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn triggered(&self, connector: Arc<Connector>, state: ExecutionState) -> Result<()> {
        (self.0)(connector, state).await
    }
}

#[derive(Clone)]
enum Handler {
    Output(Arc<dyn OutputHandler>),
    Input(Arc<dyn InputHandler>),
}

/// Shared state of an input or output
pub struct Port {
    id: String,
    direction: Direction,
    definition: RwLock<PortDefinition>,
    node: RwLock<Weak<NodeInner>>,
    connectors: RwLock<Vec<Arc<Connector>>>,
    handler: RwLock<Option<Handler>>,
    events: broadcast::Sender<PortEvent>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("definition", &*self.definition.read())
            .finish()
    }
}

impl Port {
    fn new(direction: Direction, definition: PortDefinition) -> Result<Arc<Self>> {
        definition.validate()?;
        let (events, _) = broadcast::channel(PORT_EVENT_CAPACITY);
        Ok(Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            definition: RwLock::new(definition),
            node: RwLock::new(Weak::new()),
            connectors: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            events,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn name(&self) -> String {
        self.definition.read().name.clone()
    }

    pub fn data_type(&self) -> Option<String> {
        self.definition.read().data_type.clone()
    }

    pub fn is_single_type(&self) -> bool {
        self.definition.read().single_type
    }

    pub fn max_connectors(&self) -> Option<usize> {
        self.definition.read().max_connectors
    }

    pub fn is_global(&self) -> bool {
        self.definition.read().global
    }

    pub fn set_global(&self, global: bool) {
        self.definition.write().global = global;
    }

    pub fn description(&self) -> Option<String> {
        self.definition.read().description.clone()
    }

    /// Snapshot of the port's definition
    pub fn definition(&self) -> PortDefinition {
        self.definition.read().clone()
    }

    /// The node owning this port, if still alive and attached
    pub fn node(&self) -> Option<Node> {
        self.node.read().upgrade().map(Node::from_inner)
    }

    /// Snapshot of the connectors, in registration order
    pub fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }

    /// Whether this port has a source or destination, including global ones
    pub fn is_connected(&self) -> bool {
        if !self.connectors.read().is_empty() {
            return true;
        }
        if !self.is_global() {
            return false;
        }
        let Some(flow) = self.flow() else {
            return false;
        };
        let data_type = self.data_type();
        match self.direction {
            Direction::Input => !flow.global_outputs_by_type(data_type.as_deref()).is_empty(),
            Direction::Output => !flow.global_inputs_by_type(data_type.as_deref()).is_empty(),
        }
    }

    pub(crate) fn bind(&self, name: &str, node: Weak<NodeInner>) {
        self.definition.write().name = name.to_string();
        *self.node.write() = node;
    }

    pub(crate) fn push_connector(&self, connector: Arc<Connector>) {
        self.connectors.write().push(connector);
    }

    pub(crate) fn remove_connector(&self, connector_id: &str) {
        self.connectors.write().retain(|c| c.id() != connector_id);
    }

    /// Drop connectors and handlers, breaking reference cycles
    pub(crate) fn clear(&self) {
        self.connectors.write().clear();
        *self.handler.write() = None;
    }

    fn flow(&self) -> Option<Arc<Flow>> {
        self.node().and_then(|n| n.flow())
    }

    fn emit(&self, event: PortEvent) {
        // No subscribers is the common case
        let _ = self.events.send(event);
    }

    fn check_state(&self, state: &ExecutionState) -> Result<Option<Arc<Flow>>> {
        let flow = self.flow();
        if !state.belongs_to(flow.as_ref().map(|f| f.id())) {
            return Err(EngineError::precondition(format!(
                "execution state of flow '{}' cannot drive port '{}'",
                state.flow_id(),
                self.name()
            )));
        }
        Ok(flow)
    }

    fn report_failure(&self, err: &EngineError) {
        let message = format!("port '{}': {}", self.name(), err);
        match self.flow() {
            Some(flow) => flow.report_failure(message),
            None => log::error!("Unhandled failure on detached {}", message),
        }
    }
}

/// A directed edge from an output to an input
///
/// Connectors synthesized for global inputs have no destination.
#[derive(Debug)]
pub struct Connector {
    id: String,
    origin: Output,
    destination: Option<Input>,
}

impl Connector {
    pub(crate) fn new(origin: Output, destination: Input) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            destination: Some(destination),
        }
    }

    fn global(origin: Output) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            destination: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> &Output {
        &self.origin
    }

    pub fn destination(&self) -> Option<&Input> {
        self.destination.as_ref()
    }

    /// True for the origin-only connectors built for global inputs
    pub fn is_global(&self) -> bool {
        self.destination.is_none()
    }
}

/// Inputs aggregate values from their upstream origins
#[async_trait]
pub trait Pullable {
    async fn get_values(&self, state: &ExecutionState) -> Result<Vec<Value>>;
}

/// Outputs fan triggers out to their destinations
pub trait Pushable {
    fn trigger(&self, state: &ExecutionState) -> Result<()>;
}

/// Input port handle
#[derive(Debug, Clone)]
pub struct Input(Arc<Port>);

impl Input {
    pub fn new(definition: PortDefinition) -> Result<Self> {
        Port::new(Direction::Input, definition).map(Self)
    }

    /// Register the handler invoked when a trigger is pushed into this input
    pub fn on_trigger<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connector>, ExecutionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.set_handler(Arc::new(FnInputHandler(handler)));
    }

    pub fn set_handler(&self, handler: Arc<dyn InputHandler>) {
        *self.0.handler.write() = Some(Handler::Input(handler));
    }

    pub fn same_port(&self, other: &Input) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Deliver a pushed trigger; the handler runs as its own task
    pub(crate) fn dispatch(&self, connector: Arc<Connector>, state: ExecutionState) {
        self.emit(PortEvent::Triggered {
            connector_id: connector.id().to_string(),
        });

        let registered = self.handler.read().clone();
        let handler = match registered {
            Some(Handler::Input(handler)) => handler,
            _ => {
                log::debug!("Input '{}' has no trigger handler", self.name());
                return;
            }
        };

        let name = self.name();
        let work = async move { handler.triggered(connector, state).await };
        match self.flow() {
            Some(flow) => flow.spawn(work),
            None => {
                tokio::spawn(async move {
                    if let Err(e) = work.await {
                        log::error!("Trigger handler of detached input '{}' failed: {}", name, e);
                    }
                });
            }
        }
    }
}

impl Deref for Input {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.0
    }
}

#[async_trait]
impl Pullable for Input {
    async fn get_values(&self, state: &ExecutionState) -> Result<Vec<Value>> {
        let flow = self.check_state(state)?;
        if flow.as_ref().is_some_and(|f| f.is_stopped()) {
            log::debug!("Input '{}' pulled on a stopped flow", self.name());
            return Ok(Vec::new());
        }

        let mut connectors = self.connectors();
        if connectors.is_empty() && self.is_global() {
            if let Some(flow) = &flow {
                let data_type = self.data_type();
                connectors = flow
                    .global_outputs_by_type(data_type.as_deref())
                    .into_iter()
                    .map(|origin| Arc::new(Connector::global(origin)))
                    .collect();
            }
        }

        if connectors.is_empty() {
            return Ok(Vec::new());
        }

        let mut pending: FuturesUnordered<_> = connectors
            .into_iter()
            .map(|connector| {
                let state = state.clone();
                async move {
                    let origin = connector.origin().clone();
                    let value = origin.pull(Arc::clone(&connector), state).await;
                    origin.emit(PortEvent::TriggerDone {
                        connector_id: connector.id().to_string(),
                    });
                    value
                }
            })
            .collect();

        // Aggregation follows completion order, not connector order
        let mut values = Vec::new();
        while let Some(value) = pending.next().await {
            match value {
                Some(Value::Array(items)) => values.extend(items),
                Some(value) => values.push(value),
                None => {}
            }
        }
        Ok(values)
    }
}

/// Output port handle
#[derive(Debug, Clone)]
pub struct Output(Arc<Port>);

impl Output {
    pub fn new(definition: PortDefinition) -> Result<Self> {
        Port::new(Direction::Output, definition).map(Self)
    }

    /// Register the handler producing this output's value when pulled
    pub fn on_trigger<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connector>, ExecutionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.set_handler(Arc::new(FnOutputHandler(handler)));
    }

    pub fn set_handler(&self, handler: Arc<dyn OutputHandler>) {
        *self.0.handler.write() = Some(Handler::Output(handler));
    }

    pub fn same_port(&self, other: &Output) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    async fn pull(&self, connector: Arc<Connector>, state: ExecutionState) -> Option<Value> {
        self.emit(PortEvent::TriggerRequested {
            connector_id: connector.id().to_string(),
        });

        let registered = self.handler.read().clone();
        let handler = match registered {
            Some(Handler::Output(handler)) => handler,
            _ => {
                log::debug!("Output '{}' has no trigger handler, contributing nothing", self.name());
                return None;
            }
        };

        match handler.pull(connector, state).await {
            Ok(value) => value,
            Err(e) => {
                self.report_failure(&e);
                None
            }
        }
    }
}

impl Deref for Output {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.0
    }
}

impl Pushable for Output {
    fn trigger(&self, state: &ExecutionState) -> Result<()> {
        let flow = self.check_state(state)?;
        if flow.as_ref().is_some_and(|f| f.is_stopped()) {
            log::debug!("Output '{}' triggered on a stopped flow", self.name());
            return Ok(());
        }

        if let Some(node) = self.node() {
            node.emit(NodeEvent::TriggerOut { output: self.name() });
        }

        for connector in self.connectors() {
            let Some(destination) = connector.destination().cloned() else {
                continue;
            };
            if let Some(node) = destination.node() {
                node.emit(NodeEvent::TriggerIn {
                    input: destination.name(),
                });
            }
            destination.dispatch(Arc::clone(&connector), state.split());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn wire(origin: &Output, destination: &Input) -> Arc<Connector> {
        let connector = Arc::new(Connector::new(origin.clone(), destination.clone()));
        origin.push_connector(Arc::clone(&connector));
        destination.push_connector(Arc::clone(&connector));
        connector
    }

    #[test]
    fn test_global_literal_rejected_at_construction() {
        let err = Input::new(PortDefinition::typed("in", "global")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        let err = Output::new(PortDefinition::typed("out", "global")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[tokio::test]
    async fn test_unconnected_input_resolves_empty() {
        let input = Input::new(PortDefinition::typed("in", "string")).unwrap();
        let state = ExecutionState::new("flow");
        assert!(input.get_values(&state).await.unwrap().is_empty());
        assert!(!input.is_connected());
    }

    #[tokio::test]
    async fn test_values_flatten_and_skip_none() {
        let input = Input::new(PortDefinition::new("in")).unwrap();
        let scalar = Output::new(PortDefinition::new("a")).unwrap();
        let list = Output::new(PortDefinition::new("b")).unwrap();
        let nothing = Output::new(PortDefinition::new("c")).unwrap();

        scalar.on_trigger(|_, _| async { Ok(Some(json!(1))) });
        list.on_trigger(|_, _| async { Ok(Some(json!([2, 3]))) });
        nothing.on_trigger(|_, _| async { Ok(None) });

        wire(&scalar, &input);
        wire(&list, &input);
        wire(&nothing, &input);

        let mut values = input.get_values(&ExecutionState::new("flow")).await.unwrap();
        values.sort_by_key(|v| v.as_i64());
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_trigger_done_fires_once_per_source() {
        let input = Input::new(PortDefinition::new("in")).unwrap();
        let origin = Output::new(PortDefinition::new("out")).unwrap();
        origin.on_trigger(|_, _| async { Ok(None) });
        let connector = wire(&origin, &input);

        let mut events = origin.subscribe();
        input.get_values(&ExecutionState::new("flow")).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            PortEvent::TriggerRequested {
                connector_id: connector.id().to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            PortEvent::TriggerDone {
                connector_id: connector.id().to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_in_shares_state() {
        let input = Input::new(PortDefinition::new("in")).unwrap();
        let origin = Output::new(PortDefinition::new("out")).unwrap();
        origin.on_trigger(|_, state: ExecutionState| async move {
            Ok(Some(json!(state.id().to_string())))
        });
        wire(&origin, &input);

        let state = ExecutionState::new("flow");
        let values = input.get_values(&state).await.unwrap();
        assert_eq!(values, vec![json!(state.id().to_string())]);
    }

    #[tokio::test]
    async fn test_trigger_splits_state_per_branch() {
        let output = Output::new(PortDefinition::typed("out", "trigger")).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut inputs = Vec::new();
        for i in 0..3 {
            let input = Input::new(PortDefinition::typed(format!("in{}", i), "trigger")).unwrap();
            let tx = tx.clone();
            input.on_trigger(move |_, state| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(state);
                    Ok(())
                }
            });
            wire(&output, &input);
            inputs.push(input);
        }

        let root = ExecutionState::new("flow");
        output.trigger(&root).unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let state = rx.recv().await.unwrap();
            assert_eq!(state.parent(), Some(root.id()));
            assert_ne!(state.id(), root.id());
            ids.push(state.id());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_output_without_handler_contributes_nothing() {
        let input = Input::new(PortDefinition::new("in")).unwrap();
        let origin = Output::new(PortDefinition::new("out")).unwrap();
        wire(&origin, &input);
        assert!(input.get_values(&ExecutionState::new("flow")).await.unwrap().is_empty());
    }
}
