//! Session configuration.

use flushline_core::Result;
use serde::{Deserialize, Serialize};

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Whether to auto-begin a transaction when flushing outside one.
    pub auto_begin: bool,
    /// Order entity updates by entity name and id before executing them.
    pub order_updates: bool,
    /// Run identity-column inserts as soon as the entity is persisted, even
    /// outside a transaction, so its generated id is readable immediately.
    pub immediate_identity_access: bool,
    /// Statements sent per round trip for collection rows and stateless
    /// batch operations.
    pub batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            order_updates: false,
            immediate_identity_access: false,
            batch_size: 50,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set `auto_begin` (builder pattern).
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    /// Set `order_updates` (builder pattern).
    pub fn order_updates(mut self, value: bool) -> Self {
        self.order_updates = value;
        self
    }

    /// Set `immediate_identity_access` (builder pattern).
    pub fn immediate_identity_access(mut self, value: bool) -> Self {
        self.immediate_identity_access = value;
        self
    }

    /// Set `batch_size` (builder pattern). Zero is treated as one.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}
