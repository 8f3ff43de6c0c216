//! Node type registry for resolving node implementations
//!
//! Maps node names to their manifest and to the constructor that wires a
//! freshly built [`Node`] (registering port handlers and lifecycle hooks).
//!
//! # Usage
//!
//! ```ignore
//! use flow_engine::{NodeRegistry, NodeManifest, NodeKind};
//!
//! let mut registry = NodeRegistry::with_builtins();
//! registry.register_fn(NodeManifest::new("my.node", NodeKind::Action), |node| {
//!     // register handlers on node ports
//!     Ok(())
//! });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::node::Node;
use crate::types::NodeManifest;

/// Wires the behavior of one node type into a node instance
pub trait NodeConstructor: Send + Sync {
    fn construct(&self, node: &Node) -> Result<()>;
}

impl<F> NodeConstructor for F
where
    F: Fn(&Node) -> Result<()> + Send + Sync,
{
    fn construct(&self, node: &Node) -> Result<()> {
        self(node)
    }
}

/// A node type compiled into the binary
///
/// Submitted at link time and picked up by [`NodeRegistry::with_builtins`]:
///
/// ```ignore
/// inventory::submit!(flow_engine::BuiltinNode {
///     manifest: my_manifest,
///     construct: my_construct,
/// });
/// ```
pub struct BuiltinNode {
    pub manifest: fn() -> NodeManifest,
    pub construct: fn(&Node) -> Result<()>,
}

inventory::collect!(BuiltinNode);

/// A registration entry combining a manifest with an optional constructor
struct RegistryEntry {
    manifest: NodeManifest,
    constructor: Option<Arc<dyn NodeConstructor>>,
}

/// Registry of node types with their manifests and constructors
pub struct NodeRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Create a registry holding every node type compiled into the binary
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for builtin in inventory::iter::<BuiltinNode> {
            let construct = builtin.construct;
            registry.register_fn((builtin.manifest)(), move |node: &Node| construct(node));
        }
        registry
    }

    /// Register a node type with a constructor
    pub fn register(&mut self, manifest: NodeManifest, constructor: Arc<dyn NodeConstructor>) {
        self.entries.insert(
            manifest.name.clone(),
            RegistryEntry {
                manifest,
                constructor: Some(constructor),
            },
        );
    }

    /// Register a node type using a plain function or closure
    pub fn register_fn<F>(&mut self, manifest: NodeManifest, constructor: F)
    where
        F: Fn(&Node) -> Result<()> + Send + Sync + 'static,
    {
        self.register(manifest, Arc::new(constructor));
    }

    /// Register a node type with its manifest only (no implementation)
    pub fn register_manifest(&mut self, manifest: NodeManifest) {
        self.entries.insert(
            manifest.name.clone(),
            RegistryEntry {
                manifest,
                constructor: None,
            },
        );
    }

    /// Get the manifest for a node name
    pub fn manifest(&self, name: &str) -> Option<&NodeManifest> {
        self.entries.get(name).map(|e| &e.manifest)
    }

    /// Check if a node name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// List all registered node names
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Find the loadable implementation for a manifest
    ///
    /// The manifest's `path`, when present, must exist, and a constructor
    /// must be registered under the manifest's name.
    pub fn resolve(&self, manifest: &NodeManifest) -> Result<Arc<dyn NodeConstructor>> {
        if let Some(path) = &manifest.path {
            if !path.exists() {
                return Err(EngineError::resolution(
                    &manifest.name,
                    format!("implementation path {:?} does not exist", path),
                ));
            }
        }

        self.entries
            .get(&manifest.name)
            .and_then(|e| e.constructor.clone())
            .ok_or_else(|| EngineError::resolution(&manifest.name, "no implementation registered"))
    }

    /// Merge another registry into this one
    ///
    /// Entries from `other` override entries in `self` if they share the same name.
    pub fn merge(&mut self, other: NodeRegistry) {
        self.entries.extend(other.entries);
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
