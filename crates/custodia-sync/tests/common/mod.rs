//! Shared in-process node mock for synchronizer integration tests.
//!
//! Maintains an active chain plus an orphan set, so tests can stage reorgs
//! by moving blocks off the best chain the same way a real node reports
//! them: still retrievable, with negative confirmations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use custodia_core::error::NodeError;
use custodia_core::traits::NodeClient;
use custodia_core::types::{
    BlockHash, BlockHeaderInfo, BlockInfo, TxInfo, TxInput, TxOutput, Txid,
};

/// Deterministic hash of the block at `height` on branch `salt`.
pub fn block_hash_at(salt: u8, height: u64) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = salt;
    bytes[24..].copy_from_slice(&height.to_be_bytes());
    BlockHash::from_bytes(bytes)
}

pub fn txid(seed: u8) -> Txid {
    Txid::from_bytes([seed; 32])
}

/// A coinbase-funded transaction paying `value` to a single address.
pub fn pay_to(txid_seed: u8, value: u64, address: &str) -> TxInfo {
    TxInfo {
        txid: txid(txid_seed),
        inputs: vec![TxInput { prev_txid: None, prev_vout: 0 }],
        outputs: vec![TxOutput {
            value,
            script_type: "pubkeyhash".into(),
            addresses: vec![address.into()],
        }],
    }
}

#[derive(Clone)]
struct MockBlock {
    hash: BlockHash,
    height: u64,
    prev: Option<BlockHash>,
    transactions: Vec<TxInfo>,
}

#[derive(Default)]
struct Tables {
    /// Best chain; index `i` holds the block at height `i + 1`.
    active: Vec<MockBlock>,
    orphans: HashMap<BlockHash, MockBlock>,
    fail_next: u64,
}

/// Scriptable node double implementing [`NodeClient`].
pub struct MockNode {
    inner: Mutex<Tables>,
}

impl MockNode {
    /// A chain of empty blocks at heights `1..=height` on branch `salt`.
    pub fn with_height(salt: u8, height: u64) -> Arc<Self> {
        let node = Self { inner: Mutex::new(Tables::default()) };
        node.extend(salt, height);
        Arc::new(node)
    }

    /// Append `count` empty blocks on branch `salt`.
    pub fn extend(&self, salt: u8, count: u64) {
        for _ in 0..count {
            self.append(salt, Vec::new());
        }
    }

    /// Append one block carrying the given transactions.
    pub fn extend_with(&self, salt: u8, transactions: Vec<TxInfo>) {
        self.append(salt, transactions);
    }

    fn append(&self, salt: u8, transactions: Vec<TxInfo>) {
        let mut tables = self.inner.lock();
        let height = tables.active.len() as u64 + 1;
        let prev = tables.active.last().map(|b| b.hash);
        tables.active.push(MockBlock {
            hash: block_hash_at(salt, height),
            height,
            prev,
            transactions,
        });
    }

    /// Orphan every block above `fork_height`, then grow `extend_by` new
    /// blocks on branch `salt`.
    pub fn reorg(&self, fork_height: u64, salt: u8, extend_by: u64) {
        {
            let mut tables = self.inner.lock();
            while tables.active.len() as u64 > fork_height {
                let block = tables.active.pop().unwrap();
                tables.orphans.insert(block.hash, block);
            }
        }
        self.extend(salt, extend_by);
    }

    /// Make the next `n` RPC calls fail with a transport error.
    pub fn fail_next(&self, n: u64) {
        self.inner.lock().fail_next = n;
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.inner.lock().active.last().unwrap().hash
    }
}

fn check_fail(tables: &mut Tables) -> Result<(), NodeError> {
    if tables.fail_next > 0 {
        tables.fail_next -= 1;
        return Err(NodeError::Transport("injected failure".into()));
    }
    Ok(())
}

fn block_info(tables: &Tables, block: &MockBlock, orphan: bool) -> BlockInfo {
    let tip = tables.active.len() as u64;
    BlockInfo {
        hash: block.hash,
        height: block.height,
        confirmations: if orphan { -1 } else { (tip - block.height) as i64 },
        previous_block_hash: block.prev,
        next_block_hash: if orphan {
            None
        } else {
            tables.active.get(block.height as usize).map(|b| b.hash)
        },
        transactions: block.transactions.clone(),
    }
}

fn header_info(tables: &Tables, block: &MockBlock, orphan: bool) -> BlockHeaderInfo {
    let info = block_info(tables, block, orphan);
    BlockHeaderInfo {
        hash: info.hash,
        height: info.height,
        confirmations: info.confirmations,
        previous_block_hash: info.previous_block_hash,
        next_block_hash: info.next_block_hash,
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn block(&self, hash: &BlockHash) -> Result<BlockInfo, NodeError> {
        let mut tables = self.inner.lock();
        check_fail(&mut tables)?;
        if let Some(block) = tables.active.iter().find(|b| b.hash == *hash) {
            return Ok(block_info(&tables, block, false));
        }
        if let Some(block) = tables.orphans.get(hash) {
            return Ok(block_info(&tables, block, true));
        }
        Err(NodeError::NotFound(hash.to_string()))
    }

    async fn block_header(&self, hash: &BlockHash) -> Result<BlockHeaderInfo, NodeError> {
        let mut tables = self.inner.lock();
        check_fail(&mut tables)?;
        if let Some(block) = tables.active.iter().find(|b| b.hash == *hash) {
            return Ok(header_info(&tables, block, false));
        }
        if let Some(block) = tables.orphans.get(hash) {
            return Ok(header_info(&tables, block, true));
        }
        Err(NodeError::NotFound(hash.to_string()))
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash, NodeError> {
        let mut tables = self.inner.lock();
        check_fail(&mut tables)?;
        height
            .checked_sub(1)
            .and_then(|i| tables.active.get(i as usize))
            .map(|b| b.hash)
            .ok_or_else(|| NodeError::NotFound(format!("height {height}")))
    }

    async fn block_count(&self) -> Result<u64, NodeError> {
        let mut tables = self.inner.lock();
        check_fail(&mut tables)?;
        Ok(tables.active.len() as u64)
    }

    async fn best_block_hash(&self) -> Result<BlockHash, NodeError> {
        let mut tables = self.inner.lock();
        check_fail(&mut tables)?;
        tables
            .active
            .last()
            .map(|b| b.hash)
            .ok_or_else(|| NodeError::NotFound("empty chain".into()))
    }

    async fn raw_transaction(&self, txid: &Txid) -> Result<TxInfo, NodeError> {
        Err(NodeError::NotFound(txid.to_string()))
    }
}
