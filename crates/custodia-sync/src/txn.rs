//! Rollback-on-drop guard for store transactions.
//!
//! The synchronizer owns its store transaction for the lifetime of one
//! batch. Binding that lifetime to a guard means every exit path — early
//! return, command interrupt, error propagation — rolls the transaction
//! back unless it was explicitly committed, so no "current transaction"
//! field needs cleaning up.

use std::ops::{Deref, DerefMut};

use tracing::warn;

use custodia_core::error::StoreError;
use custodia_core::traits::{StoreTransaction, WalletStore};

/// A store transaction that rolls back on drop unless committed.
pub struct TxnGuard {
    txn: Option<Box<dyn StoreTransaction>>,
}

impl TxnGuard {
    /// Begin a transaction on the given store.
    pub fn begin(store: &dyn WalletStore) -> Result<Self, StoreError> {
        Ok(Self { txn: Some(store.begin()?) })
    }

    /// Commit the transaction, consuming the guard.
    pub fn commit(mut self) -> Result<(), StoreError> {
        match self.txn.take() {
            Some(txn) => txn.commit(),
            None => Ok(()),
        }
    }

    /// Roll the transaction back explicitly, consuming the guard.
    pub fn rollback(mut self) -> Result<(), StoreError> {
        match self.txn.take() {
            Some(txn) => txn.rollback(),
            None => Ok(()),
        }
    }
}

impl Deref for TxnGuard {
    type Target = dyn StoreTransaction;

    fn deref(&self) -> &Self::Target {
        // The Option is only None after commit/rollback consumed the guard.
        self.txn.as_deref().expect("transaction already consumed")
    }
}

impl DerefMut for TxnGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.txn.as_deref_mut().expect("transaction already consumed")
    }
}

impl Drop for TxnGuard {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.rollback() {
                warn!(error = %e, "failed to roll back abandoned store transaction");
            }
        }
    }
}
