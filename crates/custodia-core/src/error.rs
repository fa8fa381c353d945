//! Error types for the Custodia backend.
//!
//! Errors are grouped by the collaborator that produces them. Both the node
//! and store taxonomies distinguish transient failures (retried by the
//! synchronizer with a class-appropriate delay) from expected not-found
//! outcomes and from conditions that need an operator.
use thiserror::Error;

use crate::types::BlockHash;

/// Failure parsing a 32-byte hash from its hex form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashParseError {
    #[error("expected 64 hex characters, got {0}")] InvalidLength(usize),
    #[error("invalid hex: {0}")] InvalidHex(String),
}

/// Errors from the blockchain node RPC.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("node transport: {0}")] Transport(String),
    #[error("not found: {0}")] NotFound(String),
    #[error("invalid node response: {0}")] InvalidResponse(String),
}

impl NodeError {
    /// Whether the error is worth retrying after a short delay.
    ///
    /// Transport failures (timeouts, connection resets) are transient.
    /// `NotFound` and malformed responses are handled by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Transport(_))
    }
}

/// Errors from the wallet store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")] NotFound,
    #[error("write conflict: {0}")] Conflict(String),
    #[error("store unavailable: {0}")] Unavailable(String),
    #[error("corrupt store: {0}")] Corrupt(String),
}

impl StoreError {
    /// Whether the error is a transient condition the caller should retry.
    ///
    /// Serialization conflicts and availability blips are transient;
    /// `NotFound` is an expected outcome and `Corrupt` is fatal to the
    /// current operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_))
    }
}

/// Umbrella error for the chain synchronization engine.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)] Node(#[from] NodeError),
    #[error(transparent)] Store(#[from] StoreError),
    /// The node is serving a different chain than the one this database was
    /// initialized against. `actual` is `None` when the node could not serve
    /// the block-1 hash at all (pruned); both cases need an operator.
    #[error("wrong chain: database pinned to {pinned}, node reports {actual:?}")]
    WrongChain {
        pinned: BlockHash,
        actual: Option<BlockHash>,
    },
    /// Invariant violation in persisted state (e.g. missing chain-state row
    /// after initialization).
    #[error("inconsistent chain state: {0}")] Inconsistent(String),
}

impl SyncError {
    /// Whether the error is the operator-intervention wrong-chain condition.
    pub fn is_wrong_chain(&self) -> bool {
        matches!(self, SyncError::WrongChain { .. })
    }

    /// Whether the error should be retried with the short conflict delay
    /// rather than the I/O delay.
    pub fn is_store_conflict(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_transient())
    }

    /// Whether the error is transient at all (node transport or store
    /// conflict/availability) and should be retried instead of surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Node(e) => e.is_transient(),
            SyncError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
