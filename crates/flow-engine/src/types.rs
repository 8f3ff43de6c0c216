//! Core types for flow graphs
//!
//! These types define the serialized structure of node manifests and
//! flow graphs: nodes, connectors, ports and their metadata.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Unique identifier for a node instance
pub type NodeId = String;

/// Name of a port on a node
pub type PortName = String;

/// Reserved routing modifier that may never be used as a data type
pub const GLOBAL_TYPE: &str = "global";

/// The behavioral class of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Produces values on demand
    #[default]
    Object,
    /// Performs a side effect when triggered
    Action,
    /// Starts trigger chains on its own
    Trigger,
}

/// Raw definition of a port (input or output)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    /// Port name, unique per node per direction
    pub name: PortName,
    /// Semantic data type; `None` means untyped
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Whether this port also matches untyped peers
    #[serde(default)]
    pub single_type: bool,
    /// Maximum number of connectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connectors: Option<usize>,
    /// Whether this port sources from / broadcasts to same-typed global ports
    #[serde(default)]
    pub global: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PortDefinition {
    /// Create an untyped port
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create a typed port
    pub fn typed(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: Some(data_type.into()),
            ..Default::default()
        }
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn single_type(mut self) -> Self {
        self.single_type = true;
        self
    }

    pub fn max_connectors(mut self, max: usize) -> Self {
        self.max_connectors = Some(max);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Reject the reserved "global" literal as a data type
    pub fn validate(&self) -> Result<()> {
        if self.data_type.as_deref() == Some(GLOBAL_TYPE) {
            return Err(EngineError::Type(format!(
                "port '{}' cannot be defined with type '{}'",
                self.name, GLOBAL_TYPE
            )));
        }
        Ok(())
    }
}

/// Manifest of an installable node type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeManifest {
    /// Manifest key (e.g. "console.log")
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: NodeKind,
    /// UI grouping level
    #[serde(default)]
    pub level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Filesystem location of the node implementation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Default configuration values
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub inputs: Vec<PortDefinition>,
    #[serde(default)]
    pub outputs: Vec<PortDefinition>,
}

impl NodeManifest {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn with_input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// A node instance in a persisted flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Stable, engine-assigned identifier
    #[serde(rename = "_id")]
    pub id: NodeId,
    /// Manifest key of the node type
    pub name: String,
    /// User-configured values
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Per-instance port definitions, overriding manifest ports by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PortDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<PortDefinition>,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A connector from an output port to an input port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConnector {
    /// Origin node ID
    pub source: NodeId,
    /// Origin output name
    pub source_handle: PortName,
    /// Destination node ID
    pub target: NodeId,
    /// Destination input name
    pub target_handle: PortName,
}

impl GraphConnector {
    pub fn new(
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_handle: source_handle.into(),
            target: target.into(),
            target_handle: target_handle.into(),
        }
    }
}

/// A complete persisted flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub connectors: Vec<GraphConnector>,
}

impl FlowGraph {
    /// Create a new empty graph
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            connectors: Vec::new(),
        }
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Distinct node type names referenced by this graph, in first-use order
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for node in &self.nodes {
            if !names.contains(&node.name.as_str()) {
                names.push(&node.name);
            }
        }
        names
    }

    /// Get connectors coming into a node
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphConnector> + 'a {
        self.connectors.iter().filter(move |c| c.target == node_id)
    }

    /// Get connectors going out of a node
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a GraphConnector> + 'a {
        self.connectors.iter().filter(move |c| c.source == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_global_literal_rejected() {
        let err = PortDefinition::typed("in", "global").validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        assert!(PortDefinition::typed("in", "string").global().validate().is_ok());
    }

    #[test]
    fn test_flow_graph_json_shape() {
        let json = serde_json::json!({
            "_id": "flow-1",
            "name": "Lights",
            "nodes": [
                { "_id": "n1", "name": "flow.start" },
                { "_id": "n2", "name": "console.log", "data": { "prefix": ">" },
                  "inputs": [{ "name": "value", "type": "string", "global": true }] }
            ],
            "connectors": [
                { "source": "n1", "sourceHandle": "trigger", "target": "n2", "targetHandle": "trigger" }
            ]
        });

        let graph: FlowGraph = serde_json::from_value(json).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[1].inputs[0].data_type.as_deref(), Some("string"));
        assert!(graph.nodes[1].inputs[0].global);
        assert_eq!(graph.incoming("n2").count(), 1);
        assert_eq!(graph.outgoing("n1").count(), 1);
        assert_eq!(graph.node_names(), vec!["flow.start", "console.log"]);
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: NodeManifest =
            serde_json::from_value(serde_json::json!({ "name": "x", "type": "action" })).unwrap();
        assert_eq!(manifest.kind, NodeKind::Action);
        assert!(manifest.inputs.is_empty());
        assert!(manifest.path.is_none());
    }
}
