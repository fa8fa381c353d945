//! # custodia-store — in-memory wallet store.
//!
//! Implements the [`custodia_core::traits::WalletStore`] seam with
//! snapshot-isolation transactions: a transaction clones the table state on
//! begin and replaces it on commit, failing with
//! [`custodia_core::error::StoreError::Conflict`] if another writer
//! committed in between. That mirrors the failure surface of a serializable
//! SQL backend closely enough for the sync engine's tests and the dev
//! daemon; the production custody stack swaps in a SQL implementation
//! behind the same traits.

pub mod memory;

pub use memory::{MemoryStore, TxRow, UtxoRow};
