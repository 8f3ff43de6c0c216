//! Per-node secret store backed by a single JSON document
//!
//! The document maps node ids to arbitrary JSON values. It is reloaded
//! before every write and rewritten whole, so concurrent writers are
//! last-writer-wins; callers needing stronger guarantees across processes
//! must serialize writes themselves.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::Result;

type Document = Map<String, Value>;

/// Keyed secret store persisted at a fixed path
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    document: Mutex<Option<Document>>,
}

impl Vault {
    /// Create a vault backed by the given file; nothing is read until first use
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            document: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the entry stored for a node, loading the document on first use
    pub fn get(&self, node_id: Option<&str>) -> Option<Value> {
        let node_id = node_id?;
        let mut document = self.document.lock();
        if document.is_none() {
            *document = Some(self.load_or_empty());
        }
        document.as_ref().and_then(|d| d.get(node_id).cloned())
    }

    /// Replace the entry for a node and rewrite the whole document
    ///
    /// A node without an id is a no-op.
    pub fn set(&self, node_id: Option<&str>, value: Value) -> Result<()> {
        let Some(node_id) = node_id else {
            return Ok(());
        };

        let mut document = self.document.lock();
        // Always start from fresh contents to narrow the lost-update window
        let mut fresh = self.load()?;
        fresh.insert(node_id.to_string(), value);

        let content = serde_json::to_string(&fresh)?;
        std::fs::write(&self.path, content)?;
        log::debug!("Saved vault entry for node '{}' to {:?}", node_id, self.path);

        *document = Some(fresh);
        Ok(())
    }

    fn load(&self) -> Result<Document> {
        if !self.path.exists() {
            log::debug!("Creating new vault at {:?}", self.path);
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.path, "{}")?;
            return Ok(Document::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn load_or_empty(&self) -> Document {
        match self.load() {
            Ok(document) => document,
            Err(e) => {
                log::warn!("Could not open vault {:?}: {}", self.path, e);
                Document::new()
            }
        }
    }
}
