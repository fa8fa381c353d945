//! Core types: hashes, chain position, the persisted chain-state record,
//! UTXO descriptors, and the node-facing block/transaction views.
//!
//! The node RPC speaks hex, so hashes serialize as 64-character hex strings.
//! All monetary values are in satoshis.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::HashParseError;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The zero hash (32 zero bytes).
            pub const ZERO: Self = Self([0u8; 32]);

            /// Create from a byte array.
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Return the underlying bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = HashParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != 64 {
                    return Err(HashParseError::InvalidLength(s.len()));
                }
                let raw = hex::decode(s)
                    .map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&raw);
                Ok(Self(bytes))
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hash_newtype!(
    /// A block hash, as reported by the node.
    BlockHash
);

hash_newtype!(
    /// A transaction ID.
    Txid
);

/// Identifier of a wallet account in the store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The synchronizer's progress pointer.
///
/// Never persisted directly; derived from the persisted [`ChainState`] and
/// reconciled against the node on every resume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainPosition {
    /// Hash of the last block whose effects are reflected in the store.
    pub last_hash: BlockHash,
    /// Height of `last_hash`.
    pub last_height: u64,
    /// Hash of the block after `last_hash`, or `None` at the tip.
    pub next_hash: Option<BlockHash>,
}

impl ChainPosition {
    /// Whether the position is at the node's tip (no known next block).
    pub fn at_tip(&self) -> bool {
        self.next_hash.is_none()
    }
}

/// The persisted chain-state record: one logical row, read at startup and
/// upserted at every checkpoint.
///
/// Invariant: all effects of blocks from `first_height` through
/// `best_block_height` (along the chain ending at `best_block_hash`) are
/// durably reflected in the store before this record is updated. It is
/// mutated only by the synchronizer, inside the same transaction as the
/// block effects it checkpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChainState {
    /// Hash of block 1 of the chain this database was initialized against.
    /// A mismatch against the node at resume time means "wrong chain".
    pub root_hash: BlockHash,
    /// Height synchronization started from.
    pub first_height: u64,
    /// Hash of the last checkpointed block.
    pub best_block_hash: BlockHash,
    /// Height of the last checkpointed block.
    pub best_block_height: u64,
}

/// Account resolution for an address, from the store's address index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    /// Owning account.
    pub account: AccountId,
    /// HD key derivation index of the address.
    pub key_index: u32,
    /// Whether the address belongs to the internal (change) branch.
    pub internal: bool,
}

/// Descriptor for a UTXO created by block projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUtxo {
    /// Transaction containing the output.
    pub txid: Txid,
    /// Output index within the transaction.
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Script type reported by the node (e.g. "pubkeyhash", "witness_v0_keyhash").
    pub script_type: String,
    /// The single payee address of the output.
    pub address: String,
    /// Owning account, resolved via the address index.
    pub account: AccountId,
    /// HD key derivation index of the address.
    pub key_index: u32,
    /// Whether the address is on the internal (change) branch.
    pub internal: bool,
    /// Height of the block that created the output.
    pub height: u64,
}

/// Set of accounts touched by UTXO creation or spend within one batch.
///
/// Used to bump per-account change-sequence counters so balance projections
/// know to re-read. Iteration order carries no meaning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AffectedAccounts {
    accounts: BTreeSet<AccountId>,
}

impl AffectedAccounts {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an account as affected. Duplicates collapse.
    pub fn insert(&mut self, account: AccountId) {
        self.accounts.insert(account);
    }

    /// Whether no accounts were affected.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Number of distinct affected accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the given account is in the set.
    pub fn contains(&self, account: AccountId) -> bool {
        self.accounts.contains(&account)
    }

    /// Iterate over the affected accounts.
    pub fn iter(&self) -> impl Iterator<Item = AccountId> + '_ {
        self.accounts.iter().copied()
    }
}

impl Extend<AccountId> for AffectedAccounts {
    fn extend<T: IntoIterator<Item = AccountId>>(&mut self, iter: T) {
        self.accounts.extend(iter);
    }
}

/// A block header as reported by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeaderInfo {
    /// The header's block hash.
    pub hash: BlockHash,
    /// Block height.
    pub height: u64,
    /// Confirmation count. Negative means the block is not on the
    /// currently-best chain; this is the sole fork-detection signal.
    pub confirmations: i64,
    /// Hash of the previous block. `None` for the genesis block.
    pub previous_block_hash: Option<BlockHash>,
    /// Hash of the next block on the best chain, if known.
    pub next_block_hash: Option<BlockHash>,
}

impl BlockHeaderInfo {
    /// Whether the block is on the currently-best chain.
    pub fn on_best_chain(&self) -> bool {
        self.confirmations >= 0
    }
}

/// A full block with its transactions, as reported by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block hash.
    pub hash: BlockHash,
    /// Block height.
    pub height: u64,
    /// Confirmation count; negative means off-chain.
    pub confirmations: i64,
    /// Hash of the previous block. `None` for the genesis block.
    pub previous_block_hash: Option<BlockHash>,
    /// Hash of the next block on the best chain, if known.
    pub next_block_hash: Option<BlockHash>,
    /// The block's transactions, in block order.
    pub transactions: Vec<TxInfo>,
}

impl BlockInfo {
    /// Whether the block is on the currently-best chain.
    pub fn on_best_chain(&self) -> bool {
        self.confirmations >= 0
    }
}

/// A transaction as reported by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInfo {
    /// Transaction ID.
    pub txid: Txid,
    /// Inputs, in transaction order.
    pub inputs: Vec<TxInput>,
    /// Outputs, in transaction order.
    pub outputs: Vec<TxOutput>,
}

/// A transaction input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    /// The spent output's transaction. `None` for coinbase inputs.
    pub prev_txid: Option<Txid>,
    /// The spent output's index. Meaningless for coinbase inputs.
    pub prev_vout: u32,
}

impl TxInput {
    /// Whether this is a coinbase input (spends no previous output).
    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_none()
    }
}

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// Script type reported by the node.
    pub script_type: String,
    /// Payee addresses recognized in the output script. Standard
    /// single-payee scripts carry exactly one; non-standard scripts carry
    /// zero or several.
    pub addresses: Vec<String>,
}

impl TxOutput {
    /// The output's single payee address, or `None` if the script has no
    /// recognized address or more than one.
    pub fn sole_address(&self) -> Option<&str> {
        match self.addresses.as_slice() {
            [addr] => Some(addr.as_str()),
            _ => None,
        }
    }
}
