//! Typed handler registry
//!
//! Maps validated keys (action types, compensation types) to handler trait
//! objects. Keys are checked when a handler is registered rather than
//! discovered at dispatch time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::workflow::is_valid_key;

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Key is empty or not lowercase `[a-z0-9_]`
    #[error("invalid {kind} key: {key:?}")]
    InvalidKey { kind: &'static str, key: String },
}

/// Registry of handlers keyed by name
///
/// One handler per key; registering an existing key replaces the previous
/// handler (last write wins).
pub struct HandlerRegistry<H: ?Sized> {
    kind: &'static str,
    handlers: RwLock<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized + Send + Sync> HandlerRegistry<H> {
    /// Create an empty registry; `kind` names the keys in errors and logs
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, returning whether it replaced an existing one
    pub fn register(&self, key: &str, handler: Arc<H>) -> Result<bool, RegistryError> {
        if !is_valid_key(key) {
            return Err(RegistryError::InvalidKey {
                kind: self.kind,
                key: key.to_string(),
            });
        }

        let replaced = self
            .handlers
            .write()
            .insert(key.to_string(), handler)
            .is_some();

        if replaced {
            warn!(kind = self.kind, key, "replaced registered handler");
        } else {
            debug!(kind = self.kind, key, "registered handler");
        }
        Ok(replaced)
    }

    pub fn get(&self, key: &str) -> Option<Arc<H>> {
        self.handlers.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.read().contains_key(key)
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.handlers.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl<H: ?Sized> fmt::Debug for HandlerRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.handlers.read().keys().cloned().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("kind", &self.kind)
            .field("keys", &keys)
            .finish()
    }
}
