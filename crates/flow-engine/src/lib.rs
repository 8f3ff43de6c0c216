//! Flow Engine - execution substrate for flow-based automation
//!
//! Users compose directed graphs of typed nodes connected by ports; this
//! crate executes them by propagating triggers and values along the
//! connections. It provides:
//!
//! - The node, port and connector data model
//! - Trigger propagation: fan-out with per-branch [`ExecutionState`]s and
//!   concurrent fan-in aggregation
//! - Best-effort status broadcasts (progress bars, badges, error trackers)
//! - A JSON-document secret [`Vault`]
//! - A supervision protocol for hosting a flow in a worker process
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::{Flow, FlowGraph, FlowOptions, NodeRegistry};
//!
//! let registry = NodeRegistry::with_builtins();
//! let flow = Flow::from_graph(&graph, &registry, FlowOptions::default())?;
//! flow.start()?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod node;
pub mod nodes;
pub mod port;
pub mod registry;
pub mod state;
pub mod status;
pub mod supervision;
pub mod typedef;
pub mod types;
pub mod vault;

// Re-export key types
pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind, NodeError, Result};
pub use events::{EventError, EventSink, FlowEvent, NodeEvent, NullEventSink, PortEvent, VecEventSink};
pub use flow::{Flow, FlowOptions, FlowState, GraphItem};
pub use node::{Node, NodeVault, PortSpec, WeakNode};
pub use port::{Connector, Direction, Input, InputHandler, Output, OutputHandler, Port, Pullable, Pushable};
pub use registry::{BuiltinNode, NodeConstructor, NodeRegistry};
pub use state::ExecutionState;
pub use status::{Status, StatusMessage, StatusRelay};
pub use typedef::{TypeDef, TypeRegistry};
pub use types::{FlowGraph, GraphConnector, GraphNode, NodeKind, NodeManifest, PortDefinition};
pub use vault::Vault;
