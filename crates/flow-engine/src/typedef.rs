//! Port type definitions
//!
//! Node packages may declare semantic types that extend other types
//! (e.g. `glow.light` extends `object`). Connector compatibility uses the
//! registry to accept an origin whose type extends the destination type.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// A named semantic port type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Registry of known type definitions
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    defs: HashMap<String, TypeDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a type definition
    pub fn add(&mut self, def: TypeDef) -> Result<()> {
        if def.name.is_empty() {
            return Err(EngineError::argument("name"));
        }
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.defs.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &TypeDef> {
        self.defs.values()
    }

    /// Whether a value of type `from` may flow into a port of type `to`
    pub fn is_assignable(&self, from: &str, to: &str) -> bool {
        let mut current = from;
        // Bounded walk so that an accidental extends-cycle terminates
        for _ in 0..=self.defs.len() {
            if current == to {
                return true;
            }
            match self.defs.get(current).and_then(|d| d.extends.as_deref()) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, extends: Option<&str>) -> TypeDef {
        TypeDef {
            name: name.to_string(),
            extends: extends.map(String::from),
            description: None,
        }
    }

    #[test]
    fn test_assignable_through_chain() {
        let mut registry = TypeRegistry::new();
        registry.add(def("object", None)).unwrap();
        registry.add(def("glow.light", Some("object"))).unwrap();
        registry.add(def("glow.rgb", Some("glow.light"))).unwrap();

        assert!(registry.is_assignable("glow.rgb", "object"));
        assert!(registry.is_assignable("glow.light", "glow.light"));
        assert!(!registry.is_assignable("object", "glow.light"));
        assert!(!registry.is_assignable("unknown", "object"));
    }

    #[test]
    fn test_cycle_terminates() {
        let mut registry = TypeRegistry::new();
        registry.add(def("a", Some("b"))).unwrap();
        registry.add(def("b", Some("a"))).unwrap();
        assert!(!registry.is_assignable("a", "c"));
    }

    #[test]
    fn test_missing_name() {
        let mut registry = TypeRegistry::new();
        assert!(registry.add(def("", None)).is_err());
    }
}
