//! Persisted autoscale types.

use serde::{Deserialize, Serialize};

use launchpad_core::ServiceKey;

/// Requests observed for one service since the last decision tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveRequestRecord {
    pub key: ServiceKey,
    /// Accumulated active requests in the current window.
    pub active_requests: u64,
    /// Unix timestamp of the last non-zero observation.
    pub last_active: u64,
    /// Unix timestamp of the last write.
    pub updated_at: u64,
}

impl ActiveRequestRecord {
    pub fn table_key(&self) -> String {
        self.key.unique_name()
    }
}
