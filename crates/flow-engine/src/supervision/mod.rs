//! Running a flow in an isolated worker process
//!
//! The controller and the worker exchange [`ControllerMessage`]s and
//! [`WorkerMessage`]s as JSON lines. The worker is driven by a small state
//! machine ([`WorkerFsm`]); any failure it cannot handle is reported as a
//! `stop` carrying the error, after which the worker exits.

pub mod channel;
pub mod controller;
pub mod messages;
pub mod worker;

pub use channel::{channel, Channel, ChannelEventSink, ChannelReceiver, ChannelState};
pub use controller::{WorkerLink, WorkerProcess};
pub use messages::{ControllerMessage, WorkerMessage};
pub use worker::{Worker, WorkerEvent, WorkerExit, WorkerFsm, WorkerState};
