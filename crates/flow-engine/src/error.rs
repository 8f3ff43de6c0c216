//! Error types for the flow engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ExecutionState;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the flow engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required call argument was missing or empty
    #[error("Argument error: the \"{0}\" argument is required")]
    Argument(String),

    /// Missing or invalid execution state
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Illegal port type (e.g. the reserved literal "global")
    #[error("Type error: {0}")]
    Type(String),

    /// A node implementation could not be resolved
    #[error("Could not resolve node '{node}': {reason}")]
    Resolution { node: String, reason: String },

    /// An error raised by node logic during execution
    #[error("Runtime error: {0}")]
    Runtime(NodeError),

    /// A connector joins ports whose types do not match
    #[error("Incompatible connector {origin} -> {destination}")]
    IncompatibleConnector { origin: String, destination: String },

    /// A port already holds its maximum number of connectors
    #[error("Port '{port}' allows at most {max} connectors")]
    ConnectorLimit { port: String, max: usize },

    /// A node or port could not be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A worker received a message that is illegal in its current state
    #[error("Invalid transition from {from} on '{event}'")]
    InvalidTransition { from: String, event: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Precondition,
    Type,
    Resolution,
    Runtime,
    Graph,
    Protocol,
    Io,
}

impl EngineError {
    /// Create an argument error for a missing argument name
    pub fn argument(name: impl Into<String>) -> Self {
        Self::Argument(name.into())
    }

    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a resolution error for a node
    pub fn resolution(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// The taxonomy bucket this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Argument(_) => ErrorKind::Argument,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::Type(_) => ErrorKind::Type,
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::IncompatibleConnector { .. } | Self::ConnectorLimit { .. } | Self::NotFound(_) => {
                ErrorKind::Graph
            }
            Self::InvalidTransition { .. } | Self::Serialization(_) => ErrorKind::Protocol,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Structured error raised by node logic
///
/// Carries enough context to be shown to a user and to cross the worker
/// process boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
    #[serde(skip)]
    pub state: Option<ExecutionState>,
}

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Attach the execution state the error happened in
    pub fn with_state(mut self, state: ExecutionState) -> Self {
        self.state_id = Some(state.id().to_string());
        self.state = Some(state);
        self
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node_name {
            Some(name) => write!(f, "{} (node '{}')", self.message, name),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<&str> for NodeError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for NodeError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<EngineError> for NodeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Runtime(inner) => inner,
            other => Self::new(other.to_string()),
        }
    }
}

impl From<NodeError> for EngineError {
    fn from(err: NodeError) -> Self {
        Self::Runtime(err)
    }
}
