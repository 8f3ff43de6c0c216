//! Built-in node types
//!
//! Just enough to make a worker useful without external node packages:
//! a trigger that fires when the flow starts and a logging action.

use serde_json::Value;

use crate::error::Result;
use crate::node::Node;
use crate::port::{Pullable, Pushable};
use crate::registry::BuiltinNode;
use crate::status::Status;
use crate::types::{NodeKind, NodeManifest, PortDefinition};

/// Port type carried by trigger connections
pub const TRIGGER_TYPE: &str = "trigger";

pub mod start {
    use super::*;

    pub const NAME: &str = "flow.start";
    pub const PORT_TRIGGER: &str = "trigger";

    pub fn manifest() -> NodeManifest {
        let mut manifest = NodeManifest::new(NAME, NodeKind::Trigger)
            .with_output(PortDefinition::typed(PORT_TRIGGER, TRIGGER_TYPE));
        manifest.description = Some("Triggers when the flow starts".to_string());
        manifest
    }

    pub fn construct(node: &Node) -> Result<()> {
        let weak = node.downgrade();
        node.on_init(move |state| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(node) => node.trigger_output(PORT_TRIGGER, &state),
                    None => Ok(()),
                }
            }
        });
        Ok(())
    }
}

inventory::submit!(BuiltinNode {
    manifest: start::manifest,
    construct: start::construct,
});

pub mod console_log {
    use super::*;

    pub const NAME: &str = "console.log";
    pub const PORT_TRIGGER: &str = "trigger";
    pub const PORT_VALUE: &str = "value";
    pub const PORT_DONE: &str = "done";

    pub fn manifest() -> NodeManifest {
        let mut manifest = NodeManifest::new(NAME, NodeKind::Action)
            .with_input(PortDefinition::typed(PORT_TRIGGER, TRIGGER_TYPE))
            .with_input(PortDefinition::new(PORT_VALUE))
            .with_output(PortDefinition::typed(PORT_DONE, TRIGGER_TYPE));
        manifest.description = Some("Logs the values connected to its value input".to_string());
        manifest
    }

    pub fn construct(node: &Node) -> Result<()> {
        let Some(trigger) = node.input(PORT_TRIGGER) else {
            return Ok(());
        };
        let weak = node.downgrade();
        trigger.on_trigger(move |_, state| {
            let weak = weak.clone();
            async move {
                let Some(node) = weak.upgrade() else {
                    return Ok(());
                };
                let values = match node.input(PORT_VALUE) {
                    Some(input) => input.get_values(&state).await?,
                    None => Vec::new(),
                };
                let line = render(&values);
                log::info!("[{}] {}", node.id().unwrap_or_default(), line);
                node.add_status(Status::message(line).with_timeout(3000))?;

                if let Some(done) = node.output(PORT_DONE) {
                    done.trigger(&state)?;
                }
                Ok(())
            }
        });
        Ok(())
    }

    fn render(values: &[Value]) -> String {
        values
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

inventory::submit!(BuiltinNode {
    manifest: console_log::manifest,
    construct: console_log::construct,
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NodeEvent, VecEventSink};
    use crate::flow::{Flow, FlowOptions};
    use crate::registry::NodeRegistry;
    use crate::status::StatusMessage;
    use crate::types::{FlowGraph, GraphConnector, GraphNode};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_start_feeds_console_log() {
        let mut graph = FlowGraph::new("f", "hello");
        graph.nodes.push(GraphNode::new("start", start::NAME));
        graph.nodes.push(GraphNode::new("log", console_log::NAME));
        graph.nodes.push(GraphNode::new("text", "text"));
        graph
            .connectors
            .push(GraphConnector::new("start", "trigger", "log", "trigger"));
        graph.connectors.push(GraphConnector::new("text", "out", "log", "value"));

        let mut registry = NodeRegistry::with_builtins();
        registry.register_fn(
            NodeManifest::new("text", NodeKind::Object).with_output(PortDefinition::new("out")),
            |node: &Node| {
                if let Some(out) = node.output("out") {
                    out.on_trigger(|_, _| async { Ok(Some(Value::String("hello world".into()))) });
                }
                Ok(())
            },
        );

        let sink = Arc::new(VecEventSink::new());
        let options = FlowOptions {
            sink: sink.clone(),
            ..Default::default()
        };
        let flow = Flow::from_graph(&graph, &registry, options).unwrap();
        let mut done = flow.node("log").unwrap().subscribe();
        flow.start().unwrap();

        // TriggerIn from the start node, then TriggerOut on "done"
        loop {
            if let NodeEvent::TriggerOut { output } = done.recv().await.unwrap() {
                assert_eq!(output, console_log::PORT_DONE);
                break;
            }
        }

        let statuses: Vec<StatusMessage> = sink
            .messages()
            .into_iter()
            .filter(|m| m.node_id() == Some("log"))
            .collect();
        assert_eq!(statuses.len(), 1);
        match &statuses[0] {
            StatusMessage::AddStatus { flow_id, status, .. } => {
                assert_eq!(flow_id, "f");
                assert_eq!(status.message.as_deref(), Some("hello world"));
            }
            other => panic!("Expected addStatus, got {:?}", other),
        }
    }
}
