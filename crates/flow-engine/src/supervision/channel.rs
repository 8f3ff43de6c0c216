//! Fire-and-forget message channel with an explicit lifecycle
//!
//! A worker may outlive its controller. Sends on a channel that is closing
//! or closed are logged no-ops, so node code never has to care whether
//! anybody is still listening.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::messages::WorkerMessage;
use crate::events::{EventError, EventSink};
use crate::status::StatusMessage;

/// Lifecycle of a [`Channel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// Close requested; queued messages are still delivered
    Closing,
    Closed,
}

enum Envelope<M> {
    Message(M),
    Close,
}

/// Sending half
pub struct Channel<M> {
    tx: mpsc::UnboundedSender<Envelope<M>>,
    state: Arc<RwLock<ChannelState>>,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Receiving half
pub struct ChannelReceiver<M> {
    rx: mpsc::UnboundedReceiver<Envelope<M>>,
    state: Arc<RwLock<ChannelState>>,
}

/// Create an open channel
pub fn channel<M>() -> (Channel<M>, ChannelReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(RwLock::new(ChannelState::Open));
    (
        Channel {
            tx,
            state: Arc::clone(&state),
        },
        ChannelReceiver { rx, state },
    )
}

impl<M> Channel<M> {
    /// A channel nobody listens to
    pub fn detached() -> Self {
        let (channel, _) = channel();
        *channel.state.write() = ChannelState::Closed;
        channel
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue a message; returns whether it was accepted
    pub fn send(&self, message: M) -> bool {
        if !self.is_open() {
            log::trace!("Dropping message on {:?} channel", self.state());
            return false;
        }
        if self.tx.send(Envelope::Message(message)).is_err() {
            log::debug!("Receiver gone, closing channel");
            *self.state.write() = ChannelState::Closed;
            return false;
        }
        true
    }

    /// Stop accepting messages; the receiver drains what is queued
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if *state != ChannelState::Open {
                return;
            }
            *state = ChannelState::Closing;
        }
        if self.tx.send(Envelope::Close).is_err() {
            *self.state.write() = ChannelState::Closed;
        }
    }
}

impl<M> ChannelReceiver<M> {
    /// Next message, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<M> {
        match self.rx.recv().await {
            Some(Envelope::Message(message)) => Some(message),
            Some(Envelope::Close) | None => {
                *self.state.write() = ChannelState::Closed;
                None
            }
        }
    }
}

/// Status sink relaying broadcasts to the controller
pub struct ChannelEventSink {
    channel: Channel<WorkerMessage>,
}

impl ChannelEventSink {
    pub fn new(channel: Channel<WorkerMessage>) -> Self {
        Self { channel }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, message: StatusMessage) -> Result<(), EventError> {
        if self.channel.send(WorkerMessage::BroadcastWebSocket { message }) {
            Ok(())
        } else {
            Err(EventError::channel_closed())
        }
    }
}
