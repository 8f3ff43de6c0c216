//! Status and progress broadcasts
//!
//! Nodes report progress bars, status badges and error trackers to whoever
//! observes the flow. Messages are scoped by `(nodeId, flowId)` and carry
//! no delivery guarantee: losing one never affects flow correctness.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::EventSink;

/// Content of a status badge, progress bar or tracker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Engine-generated identifier
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Progress from 0 to 100 inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    /// Milliseconds over which a progress bar animates to 100%
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_over_time: Option<u64>,
    /// Milliseconds after which the UI dismisses the status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Milliseconds since the unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
}

impl Status {
    /// A status carrying only a message
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// A progress bar starting at the given percentage
    pub fn progress(percentage: f64) -> Self {
        Self {
            percentage: Some(percentage),
            ..Default::default()
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_update_over_time(mut self, duration_ms: u64) -> Self {
        self.update_over_time = Some(duration_ms);
        self
    }

    /// True when no field is set, i.e. the caller supplied nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Broadcast message relayed from a node to status observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum StatusMessage {
    #[serde(rename = "node.addStatus", rename_all = "camelCase")]
    AddStatus {
        node_id: String,
        flow_id: String,
        status: Status,
    },

    #[serde(rename = "node.updateStatusById", rename_all = "camelCase")]
    UpdateStatusById {
        node_id: String,
        flow_id: String,
        status: Status,
    },

    #[serde(rename = "node.removeStatusById", rename_all = "camelCase")]
    RemoveStatusById {
        node_id: String,
        flow_id: String,
        status: Status,
    },

    #[serde(rename = "node.removeAllStatuses", rename_all = "camelCase")]
    RemoveAllStatuses { node_id: String, flow_id: String },

    #[serde(rename = "node.addProgressBar", rename_all = "camelCase")]
    AddProgressBar {
        node_id: String,
        flow_id: String,
        status: Status,
    },

    #[serde(rename = "node.updateProgressBarById", rename_all = "camelCase")]
    UpdateProgressBarById {
        node_id: String,
        flow_id: String,
        status: Status,
    },

    #[serde(rename = "node.setTracker", rename_all = "camelCase")]
    SetTracker {
        node_id: String,
        flow_id: String,
        status: Status,
    },

    /// Envelope carrying several messages at once
    #[serde(rename = "batch")]
    Batch { messages: Vec<StatusMessage> },
}

impl StatusMessage {
    /// Node the message is scoped to (`None` for batches)
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::AddStatus { node_id, .. }
            | Self::UpdateStatusById { node_id, .. }
            | Self::RemoveStatusById { node_id, .. }
            | Self::RemoveAllStatuses { node_id, .. }
            | Self::AddProgressBar { node_id, .. }
            | Self::UpdateProgressBarById { node_id, .. }
            | Self::SetTracker { node_id, .. } => Some(node_id),
            Self::Batch { .. } => None,
        }
    }

    /// Status payload, if the message carries one
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::AddStatus { status, .. }
            | Self::UpdateStatusById { status, .. }
            | Self::RemoveStatusById { status, .. }
            | Self::AddProgressBar { status, .. }
            | Self::UpdateProgressBarById { status, .. }
            | Self::SetTracker { status, .. } => Some(status),
            Self::RemoveAllStatuses { .. } | Self::Batch { .. } => None,
        }
    }
}

/// Buffers relayed status messages and forwards them as batches
///
/// Used on the controller side so a chatty worker does not produce one
/// observer notification per progress tick.
pub struct StatusRelay {
    sink: Arc<dyn EventSink>,
    pending: parking_lot::Mutex<Vec<StatusMessage>>,
}

impl StatusRelay {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            pending: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Queue a message for the next flush; nested batches are unpacked
    pub fn push(&self, message: StatusMessage) {
        let mut pending = self.pending.lock();
        match message {
            StatusMessage::Batch { messages } => pending.extend(messages),
            other => pending.push(other),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Forward everything queued as one batch envelope
    ///
    /// Returns the number of messages forwarded.
    pub fn flush(&self) -> usize {
        let messages = std::mem::take(&mut *self.pending.lock());
        let count = messages.len();
        if count == 0 {
            return 0;
        }
        if let Err(e) = self.sink.send(StatusMessage::Batch { messages }) {
            log::debug!("Dropped {} status messages: {}", count, e);
        }
        count
    }

    /// Flush periodically until the returned task is aborted
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                relay.flush();
            }
        })
    }
}

/// Milliseconds since the unix epoch, for `Status::start_date`
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VecEventSink;

    #[test]
    fn test_status_message_wire_shape() {
        let message = StatusMessage::AddProgressBar {
            node_id: "n1".to_string(),
            flow_id: "f1".to_string(),
            status: Status::progress(0.0).with_update_over_time(500),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["method"], "node.addProgressBar");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["flowId"], "f1");
        assert_eq!(json["status"]["updateOverTime"], 500);
        assert!(json["status"].get("_id").is_none());
    }

    #[test]
    fn test_status_is_empty() {
        assert!(Status::default().is_empty());
        assert!(!Status::message("x").is_empty());
        assert!(!Status::progress(0.0).is_empty());
    }

    #[test]
    fn test_relay_batches() {
        let sink = Arc::new(VecEventSink::new());
        let relay = StatusRelay::new(sink.clone());

        assert_eq!(relay.flush(), 0);
        assert!(sink.messages().is_empty());

        for i in 0..3 {
            relay.push(StatusMessage::RemoveAllStatuses {
                node_id: format!("n{}", i),
                flow_id: "f".to_string(),
            });
        }
        relay.push(StatusMessage::Batch {
            messages: vec![StatusMessage::RemoveAllStatuses {
                node_id: "n3".to_string(),
                flow_id: "f".to_string(),
            }],
        });
        assert_eq!(relay.pending(), 4);
        assert_eq!(relay.flush(), 4);

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            StatusMessage::Batch { messages } => assert_eq!(messages.len(), 4),
            other => panic!("Expected batch, got {:?}", other),
        }
    }
}
