//! Event types for observing flow execution
//!
//! Two kinds of events exist:
//!
//! - Status broadcasts ([`StatusMessage`]) leave the engine through an
//!   [`EventSink`]; they are advisory and fire-and-forget.
//! - Entity events ([`NodeEvent`], [`PortEvent`], [`FlowEvent`]) are published
//!   on per-entity broadcast channels for in-process observers.

use crate::error::NodeError;
use crate::status::StatusMessage;

/// Trait for sending status broadcasts
///
/// This abstracts over the transport mechanism (worker channel, mpsc,
/// websocket relay, etc.) allowing the engine to run in different contexts.
pub trait EventSink: Send + Sync {
    /// Send a status message
    ///
    /// Returns an error if the message could not be sent (e.g., channel closed)
    fn send(&self, message: StatusMessage) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// A no-op event sink that discards all messages
///
/// Useful for testing or when nobody observes statuses.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _message: StatusMessage) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects messages
///
/// Useful for testing to verify messages were emitted correctly.
pub struct VecEventSink {
    messages: parking_lot::Mutex<Vec<StatusMessage>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            messages: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected messages
    pub fn messages(&self) -> Vec<StatusMessage> {
        self.messages.lock().clone()
    }

    /// Clear all collected messages
    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, message: StatusMessage) -> Result<(), EventError> {
        self.messages.lock().push(message);
        Ok(())
    }
}

/// Coarse observations published by a node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A trigger is incoming on one of the node's inputs
    TriggerIn { input: String },
    /// One of the node's outputs fanned out a trigger
    TriggerOut { output: String },
}

/// Observations published by a single port
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    /// An input asked this output for a value
    TriggerRequested { connector_id: String },
    /// The pull through this output has completed
    TriggerDone { connector_id: String },
    /// This input received a pushed trigger
    Triggered { connector_id: String },
}

/// Lifecycle and failure events of a flow
#[derive(Debug, Clone)]
pub enum FlowEvent {
    Started,
    Stopped,
    /// A node reported an error through `Node::error`
    Error(NodeError),
    /// Node work failed without being handled (error result or panic)
    Failure { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    #[test]
    fn test_vec_event_sink() {
        let sink = VecEventSink::new();

        sink.send(StatusMessage::RemoveAllStatuses {
            node_id: "n1".to_string(),
            flow_id: "f1".to_string(),
        })
        .unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].node_id(), Some("n1"));

        sink.clear();
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_null_event_sink() {
        let sink = NullEventSink;
        // Should not panic
        sink.send(StatusMessage::SetTracker {
            node_id: "n1".to_string(),
            flow_id: "f1".to_string(),
            status: Status::message("hi"),
        })
        .unwrap();
    }
}
