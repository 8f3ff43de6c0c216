//! Wire messages exchanged between a controller and a worker
//!
//! Every message is one JSON object discriminated by its `method` field.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::status::StatusMessage;
use crate::types::{FlowGraph, NodeManifest};

/// Controller to worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ControllerMessage {
    /// Provision the flow and run it (or a direct subset of it)
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default)]
        config: EngineConfig,
        flow: FlowGraph,
        /// Manifests of every node name used by the flow
        #[serde(default)]
        nodes: HashMap<String, NodeManifest>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direct_nodes: Option<Vec<String>>,
    },

    /// Provision the flow without running it
    Init {
        #[serde(default)]
        config: EngineConfig,
        flow: FlowGraph,
        #[serde(default)]
        nodes: HashMap<String, NodeManifest>,
    },

    /// Run a provisioned flow
    Run,

    /// Run only the listed nodes
    #[serde(rename_all = "camelCase")]
    DirectNodes { direct_nodes: Vec<String> },

    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<NodeError>,
    },
}

impl ControllerMessage {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Init { .. } => "init",
            Self::Run => "run",
            Self::DirectNodes { .. } => "directNodes",
            Self::Stop { .. } => "stop",
        }
    }
}

/// Worker to controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// The worker process is up and listening
    Init,
    /// The flow graph is materialized and ready to run
    Initialized,
    /// The flow began executing
    Started,
    /// The worker stopped, with the error that caused it if any
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<NodeError>,
    },
    /// A status broadcast to relay to observers
    BroadcastWebSocket { message: StatusMessage },
}
