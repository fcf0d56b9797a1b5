//! Engine configuration.

use std::time::Duration;

use chord_types::{RING_BITS, SUCCESSOR_LIST_LEN};

/// Configuration for a [`ChordNode`](crate::ChordNode).
#[derive(Debug, Clone)]
pub struct ChordNodeConfig {
    /// Interval between stabilization rounds.
    pub stabilize_interval: Duration,
    /// Interval between replica sync rounds.
    pub sync_interval: Duration,
    /// Interval between aggregation tree refreshes.
    pub tree_interval: Duration,
    /// Deadline for a single request/response exchange.
    pub request_timeout: Duration,
    /// Redirects a lookup follows before giving up.
    pub max_lookup_hops: usize,
    /// A tree child is evicted after `stabilize_interval * child_timeout_factor`
    /// without a refresh.
    pub child_timeout_factor: u32,
}

impl ChordNodeConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            stabilize_interval: Duration::from_millis(50),
            sync_interval: Duration::from_millis(100),
            tree_interval: Duration::from_millis(100),
            request_timeout: Duration::from_millis(500),
            max_lookup_hops: default_max_lookup_hops(),
            child_timeout_factor: 4,
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            stabilize_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(5),
            tree_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            max_lookup_hops: default_max_lookup_hops(),
            child_timeout_factor: 4,
        }
    }

    /// How long a tree child may go without refreshing.
    pub fn child_timeout(&self) -> Duration {
        self.stabilize_interval * self.child_timeout_factor
    }
}

impl Default for ChordNodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// `2 * RING_BITS + K`: enough for a finger walk plus a successor-list detour.
pub const fn default_max_lookup_hops() -> usize {
    2 * RING_BITS as usize + SUCCESSOR_LIST_LEN
}
