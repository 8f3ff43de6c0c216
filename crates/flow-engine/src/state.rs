//! Execution state tokens
//!
//! An [`ExecutionState`] travels along every trigger chain. Fan-out splits
//! it so that each branch owns an independent copy of the chain's scoped
//! context; fan-in passes the same state to every upstream source.

use std::collections::HashMap;

use uuid::Uuid;

/// Opaque per-branch execution context
///
/// Holds no shared mutable data: cloning or splitting produces a fully
/// independent value.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    id: Uuid,
    parent: Option<Uuid>,
    flow_id: String,
    depth: u32,
    scope: HashMap<String, serde_json::Value>,
}

impl ExecutionState {
    /// Create a root state for a flow
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: None,
            flow_id: flow_id.into(),
            depth: 0,
            scope: HashMap::new(),
        }
    }

    /// Derive an independent child state for one downstream branch
    pub fn split(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: Some(self.id),
            flow_id: self.flow_id.clone(),
            depth: self.depth + 1,
            scope: self.scope.clone(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the state this one was split from
    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Number of splits between this state and its root
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.scope.get(key)
    }

    /// Set a branch-scoped value; siblings split earlier never see it
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.scope.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.scope.remove(key)
    }

    /// Whether this state may drive ports of a node attached to `flow_id`
    pub fn belongs_to(&self, flow_id: Option<&str>) -> bool {
        flow_id.map_or(true, |id| id == self.flow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_yields_distinct_ids() {
        let root = ExecutionState::new("flow");
        let a = root.split();
        let b = root.split();

        assert_ne!(a.id(), root.id());
        assert_ne!(b.id(), root.id());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.parent(), Some(root.id()));
        assert_eq!(a.depth(), 1);
        assert_eq!(a.split().depth(), 2);
    }

    #[test]
    fn test_split_isolates_scope() {
        let mut root = ExecutionState::new("flow");
        root.set("guard", json!(1));

        let mut a = root.split();
        let b = root.split();
        a.set("guard", json!(2));
        a.set("only_a", json!(true));

        assert_eq!(b.get("guard"), Some(&json!(1)));
        assert!(b.get("only_a").is_none());
        assert_eq!(root.get("guard"), Some(&json!(1)));
    }

    #[test]
    fn test_belongs_to() {
        let state = ExecutionState::new("flow-a");
        assert!(state.belongs_to(Some("flow-a")));
        assert!(!state.belongs_to(Some("flow-b")));
        assert!(state.belongs_to(None));
    }
}
