//! In-memory [`WalletStore`] with snapshot-isolation transactions.
//!
//! Tables live behind a single `parking_lot::Mutex`. A transaction clones
//! the tables on begin and swaps them back on commit, with a version check
//! so two concurrent writers cannot both win: the loser gets
//! [`StoreError::Conflict`], exactly the class the synchronizer retries
//! with its short conflict delay.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use custodia_core::error::StoreError;
use custodia_core::traits::{StoreTransaction, WalletStore};
use custodia_core::types::{
    AccountId, AddressInfo, AffectedAccounts, ChainState, NewUtxo, Txid,
};

/// A stored UTXO row.
///
/// Height markers are nullable: rollback clears them instead of deleting
/// the row, so history survives a reorg that later re-confirms differently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoRow {
    /// Value in satoshis.
    pub value: u64,
    /// Script type reported by the node.
    pub script_type: String,
    /// Owning address.
    pub address: String,
    /// Owning account.
    pub account: AccountId,
    /// HD key derivation index.
    pub key_index: u32,
    /// Whether the address is on the internal (change) branch.
    pub internal: bool,
    /// Height the output was created at, or `None` after a rollback past it.
    pub added_height: Option<u64>,
    /// Height the output was spent at, or `None` while unspent (or after a
    /// rollback past the spend).
    pub spent_height: Option<u64>,
}

/// A stored wallet-transaction row. The synchronizer only reverts these;
/// creation is owned by downstream payment components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRow {
    /// Owning account, when the transaction touches a tracked account.
    pub account: Option<AccountId>,
    /// Confirmation height, or `None` after a rollback past it.
    pub height: Option<u64>,
}

#[derive(Clone, Default)]
struct Tables {
    version: u64,
    chain_state: Option<ChainState>,
    utxos: BTreeMap<(Txid, u32), UtxoRow>,
    txns: BTreeMap<Txid, TxRow>,
    addresses: HashMap<String, AddressInfo>,
    chain_seq: HashMap<AccountId, u64>,
}

/// In-memory wallet store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
    /// Pending injected commit failures, for exercising retry paths.
    injected_conflicts: Arc<Mutex<u64>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address as owned by an account (the address index).
    pub fn add_address(&self, address: impl Into<String>, info: AddressInfo) {
        self.inner.lock().addresses.insert(address.into(), info);
    }

    /// Seed a wallet-transaction row. Test/bootstrap helper; the sync
    /// engine only reverts these rows.
    pub fn add_tx_row(&self, txid: Txid, row: TxRow) {
        self.inner.lock().txns.insert(txid, row);
    }

    /// Current persisted chain state, if initialized.
    pub fn chain_state(&self) -> Option<ChainState> {
        self.inner.lock().chain_state.clone()
    }

    /// Look up a UTXO row.
    pub fn utxo(&self, txid: &Txid, vout: u32) -> Option<UtxoRow> {
        self.inner.lock().utxos.get(&(*txid, vout)).cloned()
    }

    /// Snapshot of all UTXO rows.
    pub fn utxos(&self) -> Vec<((Txid, u32), UtxoRow)> {
        self.inner
            .lock()
            .utxos
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Look up a wallet-transaction row.
    pub fn tx_row(&self, txid: &Txid) -> Option<TxRow> {
        self.inner.lock().txns.get(txid).cloned()
    }

    /// Change-sequence counter of an account (0 if never bumped).
    pub fn chain_seq(&self, account: AccountId) -> u64 {
        *self.inner.lock().chain_seq.get(&account).unwrap_or(&0)
    }

    /// Commit counter; bumps once per successful commit. Lets tests assert
    /// "no state-mutating calls" without enumerating tables.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Make the next `n` commits fail with [`StoreError::Conflict`].
    pub fn inject_commit_conflicts(&self, n: u64) {
        *self.injected_conflicts.lock() = n;
    }
}

impl WalletStore for MemoryStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tables = self.inner.lock();
        Ok(Box::new(MemoryTxn {
            store: Arc::clone(&self.inner),
            injected_conflicts: Arc::clone(&self.injected_conflicts),
            base_version: tables.version,
            snapshot: tables.clone(),
        }))
    }
}

struct MemoryTxn {
    store: Arc<Mutex<Tables>>,
    injected_conflicts: Arc<Mutex<u64>>,
    base_version: u64,
    snapshot: Tables,
}

impl StoreTransaction for MemoryTxn {
    fn chain_state(&mut self) -> Result<Option<ChainState>, StoreError> {
        Ok(self.snapshot.chain_state.clone())
    }

    fn update_chain_state(&mut self, state: &ChainState, initial: bool) -> Result<(), StoreError> {
        if initial && self.snapshot.chain_state.is_some() {
            return Err(StoreError::Conflict(
                "chain state already initialized".into(),
            ));
        }
        self.snapshot.chain_state = Some(state.clone());
        Ok(())
    }

    fn mark_utxo_spent(
        &mut self,
        txid: &Txid,
        vout: u32,
        height: u64,
    ) -> Result<Option<AccountId>, StoreError> {
        match self.snapshot.utxos.get_mut(&(*txid, vout)) {
            Some(row) => {
                row.spent_height = Some(height);
                Ok(Some(row.account))
            }
            None => Ok(None),
        }
    }

    fn create_utxo(&mut self, utxo: &NewUtxo) -> Result<(), StoreError> {
        self.snapshot.utxos.insert(
            (utxo.txid, utxo.vout),
            UtxoRow {
                value: utxo.value,
                script_type: utxo.script_type.clone(),
                address: utxo.address.clone(),
                account: utxo.account,
                key_index: utxo.key_index,
                internal: utxo.internal,
                added_height: Some(utxo.height),
                spent_height: None,
            },
        );
        Ok(())
    }

    fn account_for_address(&mut self, address: &str) -> Result<Option<AddressInfo>, StoreError> {
        Ok(self.snapshot.addresses.get(address).cloned())
    }

    fn bump_chain_seq(&mut self, accounts: &AffectedAccounts) -> Result<(), StoreError> {
        for account in accounts.iter() {
            *self.snapshot.chain_seq.entry(account).or_insert(0) += 1;
        }
        Ok(())
    }

    fn bump_accounts_above(&mut self, height: u64) -> Result<Vec<AccountId>, StoreError> {
        let mut affected = AffectedAccounts::new();
        for row in self.snapshot.utxos.values() {
            let touched = row.added_height.is_some_and(|h| h > height)
                || row.spent_height.is_some_and(|h| h > height);
            if touched {
                affected.insert(row.account);
            }
        }
        for row in self.snapshot.txns.values() {
            if row.height.is_some_and(|h| h > height) {
                if let Some(account) = row.account {
                    affected.insert(account);
                }
            }
        }
        self.bump_chain_seq(&affected)?;
        Ok(affected.iter().collect())
    }

    fn revert_utxos_above(&mut self, height: u64) -> Result<(), StoreError> {
        for row in self.snapshot.utxos.values_mut() {
            if row.spent_height.is_some_and(|h| h > height) {
                row.spent_height = None;
            }
            if row.added_height.is_some_and(|h| h > height) {
                row.added_height = None;
            }
        }
        Ok(())
    }

    fn revert_txns_above(&mut self, height: u64) -> Result<(), StoreError> {
        for row in self.snapshot.txns.values_mut() {
            if row.height.is_some_and(|h| h > height) {
                row.height = None;
            }
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        {
            let mut injected = self.injected_conflicts.lock();
            if *injected > 0 {
                *injected -= 1;
                return Err(StoreError::Conflict("injected".into()));
            }
        }
        let mut tables = self.store.lock();
        if tables.version != self.base_version {
            return Err(StoreError::Conflict(format!(
                "version moved from {} to {}",
                self.base_version, tables.version
            )));
        }
        self.snapshot.version = self.base_version + 1;
        *tables = std::mem::take(&mut self.snapshot);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Snapshot is simply dropped.
        Ok(())
    }
}
