//! Synchronizer configuration.
//!
//! The retry delays are operationally significant: the I/O delay paces
//! recovery from node outages, the conflict delay paces serialization-
//! conflict retries against the store, and the wrong-chain delay is long
//! because that condition needs an operator, not a retry.

use std::time::Duration;

/// Configuration for the chain synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum blocks applied per store transaction.
    pub batch_size: usize,
    /// Delay before retrying after a transient node or store I/O failure.
    pub io_retry_delay: Duration,
    /// Delay before retrying after a store write conflict.
    pub conflict_retry_delay: Duration,
    /// Delay between resume attempts while the node is on the wrong chain.
    pub wrong_chain_delay: Duration,
    /// How far behind the node's tip an initial sync pins `first_height`,
    /// as a safety margin against shallow reorgs of the starting block.
    pub initial_sync_lag: u64,
    /// Capacity of the administrative command queue.
    pub command_queue_depth: usize,
    /// Expected inter-block interval; the tip notifier actively polls the
    /// node when no pushed event arrives within it.
    pub tip_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            io_retry_delay: Duration::from_secs(5),
            conflict_retry_delay: Duration::from_millis(250),
            wrong_chain_delay: Duration::from_secs(300),
            initial_sync_lag: 100,
            command_queue_depth: 16,
            tip_poll_interval: Duration::from_secs(60),
        }
    }
}
