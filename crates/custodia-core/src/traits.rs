//! Trait interfaces for the Custodia backend.
//!
//! These traits define the contracts between crates:
//! - [`NodeClient`] — read-only blockchain RPC (custodia-rpc implements)
//! - [`WalletStore`] / [`StoreTransaction`] — transactional wallet store
//!   (custodia-store implements in memory; a SQL engine in production)
//!
//! The chain synchronizer consumes both and must be able to distinguish
//! transient errors (retried) from not-found outcomes (handled locally);
//! see [`NodeError::is_transient`] and [`StoreError::is_transient`].

use async_trait::async_trait;

use crate::error::{NodeError, StoreError};
use crate::types::{
    AccountId, AddressInfo, AffectedAccounts, BlockHash, BlockHeaderInfo, BlockInfo, ChainState,
    NewUtxo, TxInfo, Txid,
};

/// Read-only blockchain RPC.
///
/// Contract: a negative `confirmations` value in returned headers/blocks
/// means the block is not on the currently-best chain. This is the sole
/// signal the synchronizer uses to detect forks.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch a full block with its transactions.
    async fn block(&self, hash: &BlockHash) -> Result<BlockInfo, NodeError>;

    /// Fetch a block header.
    async fn block_header(&self, hash: &BlockHash) -> Result<BlockHeaderInfo, NodeError>;

    /// Hash of the block at the given height on the best chain.
    async fn block_hash(&self, height: u64) -> Result<BlockHash, NodeError>;

    /// Height of the best chain's tip.
    async fn block_count(&self) -> Result<u64, NodeError>;

    /// Hash of the best chain's tip.
    async fn best_block_hash(&self) -> Result<BlockHash, NodeError>;

    /// Fetch a transaction by ID. Consumed by components downstream of the
    /// synchronizer (payment detection, audit); the sync engine itself works
    /// from block contents.
    async fn raw_transaction(&self, txid: &Txid) -> Result<TxInfo, NodeError>;
}

/// Handle to the transactional wallet store.
pub trait WalletStore: Send + Sync {
    /// Begin an atomic unit of work.
    ///
    /// Serializable isolation is expected: concurrent writers touching
    /// chain-derived rows must fail with [`StoreError::Conflict`] rather
    /// than interleave.
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// An atomic unit of work against the wallet store.
///
/// Exclusively owned by the synchronizer for its lifetime; dropped
/// transactions must be rolled back by the owner (see the sync engine's
/// transaction guard).
pub trait StoreTransaction: Send {
    /// Read the persisted chain-state record, if initialized.
    fn chain_state(&mut self) -> Result<Option<ChainState>, StoreError>;

    /// Upsert the chain-state record. `initial` marks the first write of a
    /// fresh database (initial sync).
    fn update_chain_state(&mut self, state: &ChainState, initial: bool) -> Result<(), StoreError>;

    /// Mark the UTXO `(txid, vout)` spent at `height`.
    ///
    /// Returns the owning account when the UTXO is tracked, `Ok(None)` when
    /// it is unknown to the wallet (expected for foreign inputs).
    fn mark_utxo_spent(
        &mut self,
        txid: &Txid,
        vout: u32,
        height: u64,
    ) -> Result<Option<AccountId>, StoreError>;

    /// Create a new UTXO row from a projected output.
    fn create_utxo(&mut self, utxo: &NewUtxo) -> Result<(), StoreError>;

    /// Resolve an address to its owning account via the address index.
    /// `Ok(None)` when no account owns the address.
    fn account_for_address(&mut self, address: &str) -> Result<Option<AddressInfo>, StoreError>;

    /// Bump the change-sequence counter of every account in the set, so
    /// balance projections know to re-read.
    fn bump_chain_seq(&mut self, accounts: &AffectedAccounts) -> Result<(), StoreError>;

    /// Bump the change-sequence counter of every account holding UTXOs or
    /// transactions above `height`, returning the affected account IDs.
    /// Used during rollback, before the revert operations.
    fn bump_accounts_above(&mut self, height: u64) -> Result<Vec<AccountId>, StoreError>;

    /// Nullify UTXO height markers above `height`. Rows are kept; reversal
    /// is height-scoped nullification, not deletion, so history survives a
    /// reorg that later re-confirms differently.
    fn revert_utxos_above(&mut self, height: u64) -> Result<(), StoreError>;

    /// Nullify transaction height markers above `height`.
    fn revert_txns_above(&mut self, height: u64) -> Result<(), StoreError>;

    /// Commit the unit of work.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Roll the unit of work back, discarding all writes.
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
