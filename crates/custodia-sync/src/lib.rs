//! # custodia-sync — chain synchronization engine.
//!
//! Walks the blockchain tip, detects and resolves reorganizations, and
//! transactionally projects block contents into the wallet store:
//! - [`notifier::TipNotifier`] — de-duplicated "tip changed" signal with a
//!   poll fallback
//! - [`command::SyncHandle`] — administrative re-sync/restart/stop channel
//! - [`synchronizer::ChainSynchronizer`] — the resume/follow/rollback state
//!   machine
//! - [`txn::TxnGuard`] — rollback-on-drop wrapper for store transactions
//!
//! The synchronizer is a single sequential worker: chain position is one
//! mutable pointer and concurrent walkers would race on rollback decisions.

pub mod command;
pub mod config;
pub mod notifier;
pub mod synchronizer;
pub mod txn;

pub use command::{Command, CommandReceiver, SyncHandle, SyncStopped, command_channel};
pub use config::SyncConfig;
pub use notifier::{TipNotifier, TipSubscription};
pub use synchronizer::ChainSynchronizer;
pub use txn::TxnGuard;
