//! The chain synchronization state machine.
//!
//! A single sequential worker that keeps the wallet store consistent with
//! the node's best chain. One loop iteration does exactly one of: apply a
//! batch of new blocks, roll back a fork, execute a pending re-sync, or
//! wait for a tip-change signal. Progress is checkpointed in the store's
//! chain-state record, inside the same transaction as the block effects it
//! covers, so a crash at any point resumes without gaps or double-applies.
//!
//! Error handling is deliberately monotonous: every failure maps to a
//! class-specific delay and another attempt. The engine never gives up on
//! its own; the worst outcome of a persistent failure is a stalled but
//! consistent store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use custodia_core::error::{NodeError, StoreError, SyncError};
use custodia_core::traits::{NodeClient, StoreTransaction, WalletStore};
use custodia_core::types::{
    AffectedAccounts, BlockHash, BlockHeaderInfo, BlockInfo, ChainPosition, ChainState, NewUtxo,
};

use crate::command::{Command, CommandReceiver};
use crate::config::SyncConfig;
use crate::notifier::TipSubscription;
use crate::txn::TxnGuard;

/// Why a sync loop ended.
enum LoopExit {
    /// Shut down for good.
    Stop,
    /// Re-enter the resume state and run a fresh loop.
    Restart,
}

/// Outcome of one batch of forward block application.
enum Advance {
    /// The batch committed (possibly empty). `rollback_from` names the
    /// block to start a rollback walk from when the batch ran into a fork.
    Applied {
        applied: usize,
        rollback_from: Option<BlockHash>,
    },
    /// A command interrupted the batch; the open transaction was rolled
    /// back and none of its blocks took effect.
    Interrupted(LoopExit),
}

/// What woke the worker while idle at the tip.
enum IdleEvent {
    /// Tip-change signal; `false` means the notifier is gone.
    Tip(bool),
    /// Administrative command; `None` means all handles are gone.
    Command(Option<Command>),
}

/// The chain synchronization worker.
///
/// Construct with [`new`](ChainSynchronizer::new) and drive with
/// [`run`](ChainSynchronizer::run), typically on its own task. Exactly one
/// instance may run against a given store.
pub struct ChainSynchronizer {
    node: Arc<dyn NodeClient>,
    store: Arc<dyn WalletStore>,
    config: SyncConfig,
    commands: CommandReceiver,
    tip: TipSubscription,
    /// The single pending re-sync request; a newer request supersedes it.
    pending_resync: Option<BlockHash>,
}

impl ChainSynchronizer {
    pub fn new(
        node: Arc<dyn NodeClient>,
        store: Arc<dyn WalletStore>,
        config: SyncConfig,
        commands: CommandReceiver,
        tip: TipSubscription,
    ) -> Self {
        Self {
            node,
            store,
            config,
            commands,
            tip,
            pending_resync: None,
        }
    }

    /// Run the worker until a stop command arrives or every command handle
    /// and the tip notifier are gone.
    pub async fn run(mut self) {
        loop {
            match self.sync_loop().await {
                LoopExit::Restart => info!("synchronizer restarting"),
                LoopExit::Stop => {
                    info!("synchronizer stopped");
                    return;
                }
            }
        }
    }

    /// One full resume-then-follow loop.
    async fn sync_loop(&mut self) -> LoopExit {
        let mut position = loop {
            match self.resume().await {
                Ok(position) => break position,
                Err(e) => {
                    if let Some(exit) = self.backoff(&e).await {
                        return exit;
                    }
                }
            }
        };
        info!(height = position.last_height, hash = %position.last_hash, "synchronizer resumed");

        loop {
            if let Some(exit) = self.poll_commands() {
                return exit;
            }

            if let Some(target) = self.pending_resync.take() {
                match self.resync(&mut position, target).await {
                    Ok(()) => {}
                    Err(SyncError::Node(NodeError::NotFound(_))) => {
                        warn!(%target, "re-sync target unknown to node, ignoring");
                    }
                    Err(e) => {
                        // Keep the request pending across the backoff; a
                        // newer request arriving meanwhile supersedes it.
                        self.pending_resync = Some(target);
                        if let Some(exit) = self.backoff(&e).await {
                            return exit;
                        }
                    }
                }
                continue;
            }

            if !position.at_tip() {
                match self.advance(&mut position).await {
                    Ok(Advance::Interrupted(exit)) => return exit,
                    Ok(Advance::Applied { rollback_from: Some(from), .. }) => {
                        match self.rollback_from(from).await {
                            Ok(new_position) => position = new_position,
                            Err(e) => {
                                if let Some(exit) = self.recover(&e).await {
                                    return exit;
                                }
                            }
                        }
                    }
                    Ok(Advance::Applied { .. }) => {}
                    Err(e) => {
                        if let Some(exit) = self.recover(&e).await {
                            return exit;
                        }
                    }
                }
                continue;
            }

            let event = tokio::select! {
                changed = self.tip.changed() => IdleEvent::Tip(changed),
                command = self.commands.recv() => IdleEvent::Command(command),
            };
            match event {
                IdleEvent::Tip(true) => {
                    if let Err(e) = self.reconcile(&mut position).await {
                        if let Some(exit) = self.recover(&e).await {
                            return exit;
                        }
                    }
                }
                IdleEvent::Tip(false) => {
                    warn!("tip notifier gone, stopping");
                    return LoopExit::Stop;
                }
                IdleEvent::Command(Some(command)) => {
                    if let Some(exit) = self.note_command(command) {
                        return exit;
                    }
                }
                IdleEvent::Command(None) => return LoopExit::Stop,
            }
        }
    }

    // ------------------------------------------------------------------
    // Resume
    // ------------------------------------------------------------------

    /// Derive the working position from the store, initializing a fresh
    /// database or reconciling an existing checkpoint against the node.
    async fn resume(&mut self) -> Result<ChainPosition, SyncError> {
        let state = {
            let mut txn = TxnGuard::begin(self.store.as_ref())?;
            let state = txn.chain_state()?;
            txn.rollback()?;
            state
        };
        match state {
            None => self.initial_sync().await,
            Some(state) => self.resume_existing(state).await,
        }
    }

    /// First start against an empty store: pin the starting block a safety
    /// margin behind the node's tip and record the chain identity.
    async fn initial_sync(&mut self) -> Result<ChainPosition, SyncError> {
        let tip_height = self.node.block_count().await?;
        let first_height = tip_height.saturating_sub(self.config.initial_sync_lag).max(1);
        let first_hash = self.node.block_hash(first_height).await?;
        let root_hash = self.node.block_hash(1).await?;

        let state = ChainState {
            root_hash,
            first_height,
            best_block_hash: first_hash,
            best_block_height: first_height,
        };
        let mut txn = TxnGuard::begin(self.store.as_ref())?;
        txn.update_chain_state(&state, true)?;
        txn.commit()?;
        info!(first_height, tip_height, hash = %first_hash, "initialized fresh store");

        let header = self.node.block_header(&first_hash).await?;
        Ok(ChainPosition {
            last_hash: first_hash,
            last_height: first_height,
            next_hash: header.next_block_hash,
        })
    }

    /// Resume against an initialized store: verify the chain identity pin,
    /// then either continue from the checkpoint or roll a fork back.
    async fn resume_existing(&mut self, state: ChainState) -> Result<ChainPosition, SyncError> {
        match self.node.block_hash(1).await {
            Ok(actual) if actual == state.root_hash => {}
            Ok(actual) => {
                return Err(SyncError::WrongChain {
                    pinned: state.root_hash,
                    actual: Some(actual),
                });
            }
            Err(NodeError::NotFound(_)) => {
                // A node that cannot serve block 1 cannot prove it is the
                // pinned chain; refuse to write until an operator decides.
                return Err(SyncError::WrongChain { pinned: state.root_hash, actual: None });
            }
            Err(e) => return Err(e.into()),
        }

        let header = self.node.block_header(&state.best_block_hash).await?;
        if header.on_best_chain() {
            debug!(height = state.best_block_height, hash = %state.best_block_hash, "checkpoint on best chain");
            Ok(ChainPosition {
                last_hash: state.best_block_hash,
                last_height: state.best_block_height,
                next_hash: header.next_block_hash,
            })
        } else {
            info!(height = state.best_block_height, hash = %state.best_block_hash, "checkpoint off best chain");
            self.rollback_from(state.best_block_hash).await
        }
    }

    // ------------------------------------------------------------------
    // Forward walk
    // ------------------------------------------------------------------

    /// Apply up to one batch of blocks from `position` forward, commit, and
    /// advance the position. Fork signals end the batch early and are
    /// reported for a rollback walk after the applied prefix commits.
    async fn advance(&mut self, position: &mut ChainPosition) -> Result<Advance, SyncError> {
        let mut txn = TxnGuard::begin(self.store.as_ref())?;
        let mut cursor = position.clone();
        let mut affected = AffectedAccounts::new();
        let mut applied = 0usize;
        let mut rollback_from = None;

        while applied < self.config.batch_size {
            if let Some(exit) = self.poll_commands() {
                // Guard drop rolls the partial batch back.
                return Ok(Advance::Interrupted(exit));
            }
            let Some(next) = cursor.next_hash else { break };
            let block = match self.node.block(&next).await {
                Ok(block) => block,
                Err(NodeError::NotFound(_)) => {
                    // The announced successor vanished: the node reorged
                    // between telling us about it and serving it.
                    rollback_from = Some(cursor.last_hash);
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if !block.on_best_chain() {
                rollback_from = Some(block.hash);
                break;
            }
            project_block(&mut *txn, &block, &mut affected)?;
            debug!(height = block.height, hash = %block.hash, txs = block.transactions.len(), "applied block");
            cursor = ChainPosition {
                last_hash: block.hash,
                last_height: block.height,
                next_hash: block.next_block_hash,
            };
            applied += 1;
        }

        if applied == 0 {
            // Nothing to checkpoint; never write an unchanged record.
            txn.rollback()?;
            return Ok(Advance::Applied { applied, rollback_from });
        }

        txn.bump_chain_seq(&affected)?;
        let Some(mut state) = txn.chain_state()? else {
            return Err(SyncError::Inconsistent(
                "chain state missing during batch commit".into(),
            ));
        };
        state.best_block_hash = cursor.last_hash;
        state.best_block_height = cursor.last_height;
        txn.update_chain_state(&state, false)?;
        txn.commit()?;
        info!(
            height = cursor.last_height,
            blocks = applied,
            accounts = affected.len(),
            "committed block batch"
        );
        *position = cursor;
        Ok(Advance::Applied { applied, rollback_from })
    }

    /// Re-check the current position against the node after a tip signal.
    async fn reconcile(&mut self, position: &mut ChainPosition) -> Result<(), SyncError> {
        let last_hash = position.last_hash;
        let header = self.node.block_header(&last_hash).await?;
        if header.on_best_chain() {
            position.next_hash = header.next_block_hash;
        } else {
            *position = self.rollback_from(last_hash).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Walk headers back from `from` to the nearest block still on the best
    /// chain, then revert the store to it.
    async fn rollback_from(&mut self, from: BlockHash) -> Result<ChainPosition, SyncError> {
        let mut cursor = self.node.block_header(&from).await?;
        while !cursor.on_best_chain() {
            let parent = cursor.previous_block_hash.ok_or_else(|| {
                SyncError::Inconsistent(format!("no on-chain ancestor walking back from {from}"))
            })?;
            cursor = self.node.block_header(&parent).await?;
        }
        self.rollback_to(&cursor)
    }

    /// Revert all block effects above `target` and move the checkpoint to
    /// it, in one transaction.
    fn rollback_to(&mut self, target: &BlockHeaderInfo) -> Result<ChainPosition, SyncError> {
        let mut txn = TxnGuard::begin(self.store.as_ref())?;
        let Some(mut state) = txn.chain_state()? else {
            return Err(SyncError::Inconsistent("chain state missing during rollback".into()));
        };
        let affected = txn.bump_accounts_above(target.height)?;
        txn.revert_utxos_above(target.height)?;
        txn.revert_txns_above(target.height)?;
        state.best_block_hash = target.hash;
        state.best_block_height = target.height;
        txn.update_chain_state(&state, false)?;
        txn.commit()?;
        warn!(
            height = target.height,
            hash = %target.hash,
            accounts = affected.len(),
            "rolled back to fork point"
        );
        Ok(ChainPosition {
            last_hash: target.hash,
            last_height: target.height,
            next_hash: target.next_block_hash,
        })
    }

    /// Execute a re-sync request: targets at the current position or ahead
    /// of it need no store work, targets behind it trigger a rollback.
    async fn resync(
        &mut self,
        position: &mut ChainPosition,
        target: BlockHash,
    ) -> Result<(), SyncError> {
        if target == position.last_hash {
            debug!(%target, "re-sync target is the current position");
            return Ok(());
        }
        let header = self.node.block_header(&target).await?;
        if header.height > position.last_height {
            debug!(%target, height = header.height, "re-sync target ahead, forward walk reaches it");
            return Ok(());
        }
        info!(%target, height = header.height, "re-syncing from requested block");
        *position = if header.on_best_chain() {
            self.rollback_to(&header)?
        } else {
            // An off-chain target degrades to its nearest on-chain ancestor.
            self.rollback_from(target).await?
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands and backoff
    // ------------------------------------------------------------------

    /// Drain queued commands without blocking.
    fn poll_commands(&mut self) -> Option<LoopExit> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if let Some(exit) = self.note_command(command) {
                        return Some(exit);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(LoopExit::Stop),
            }
        }
    }

    /// Record or act on a command.
    fn note_command(&mut self, command: Command) -> Option<LoopExit> {
        match command {
            Command::ReSync(target) => {
                info!(%target, "re-sync requested");
                if self.pending_resync.replace(target).is_some() {
                    debug!("superseding pending re-sync");
                }
                None
            }
            Command::Restart => {
                info!("restart requested");
                Some(LoopExit::Restart)
            }
            Command::Stop { deadline } => {
                info!(?deadline, "stop requested");
                Some(LoopExit::Stop)
            }
        }
    }

    /// Log an error and sleep its class-specific delay. Commands arriving
    /// during the sleep are handled; stop and restart cut it short.
    async fn backoff(&mut self, err: &SyncError) -> Option<LoopExit> {
        let delay = if err.is_wrong_chain() {
            error!(error = %err, "node is on a different chain, waiting for operator");
            self.config.wrong_chain_delay
        } else if err.is_store_conflict() {
            warn!(error = %err, "store write conflict, retrying");
            self.config.conflict_retry_delay
        } else {
            warn!(error = %err, "sync error, backing off");
            self.config.io_retry_delay
        };
        self.sleep_or_command(delay).await
    }

    /// Backoff for a mid-loop error. Non-transient errors additionally
    /// restart the loop so the position is re-derived from the store.
    async fn recover(&mut self, err: &SyncError) -> Option<LoopExit> {
        let recoverable = err.is_transient() || err.is_store_conflict();
        if let Some(exit) = self.backoff(err).await {
            return Some(exit);
        }
        if recoverable { None } else { Some(LoopExit::Restart) }
    }

    /// Sleep while staying responsive to commands. Re-sync requests are
    /// recorded and the sleep continues; stop and restart end it.
    async fn sleep_or_command(&mut self, delay: Duration) -> Option<LoopExit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(exit) = self.note_command(command) {
                            return Some(exit);
                        }
                    }
                    None => return Some(LoopExit::Stop),
                },
            }
        }
    }
}

/// Project one block's transactions into the store.
///
/// Inputs spending tracked UTXOs are marked spent; outputs paying a single
/// tracked address become new UTXO rows. Coinbase inputs, zero-value
/// outputs, scripts without exactly one address, and foreign addresses are
/// skipped. Owning accounts accumulate in `affected`.
fn project_block(
    txn: &mut dyn StoreTransaction,
    block: &BlockInfo,
    affected: &mut AffectedAccounts,
) -> Result<(), StoreError> {
    for tx in &block.transactions {
        for input in &tx.inputs {
            let Some(prev_txid) = input.prev_txid else { continue };
            if let Some(account) = txn.mark_utxo_spent(&prev_txid, input.prev_vout, block.height)? {
                affected.insert(account);
            }
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.value == 0 {
                continue;
            }
            let Some(address) = output.sole_address() else { continue };
            let Some(info) = txn.account_for_address(address)? else { continue };
            txn.create_utxo(&NewUtxo {
                txid: tx.txid,
                vout: vout as u32,
                value: output.value,
                script_type: output.script_type.clone(),
                address: address.to_string(),
                account: info.account,
                key_index: info.key_index,
                internal: info.internal,
                height: block.height,
            })?;
            affected.insert(info.account);
        }
    }
    Ok(())
}
