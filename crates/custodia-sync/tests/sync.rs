//! End-to-end synchronizer scenarios against a scriptable node mock and
//! the in-memory store: initial sync, resume, reorg, re-sync commands,
//! failure injection, and shutdown behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use custodia_core::traits::{NodeClient, WalletStore};
use custodia_core::types::{AccountId, AddressInfo, BlockHash, ChainState};
use custodia_store::MemoryStore;
use custodia_sync::{ChainSynchronizer, SyncConfig, SyncHandle, TipNotifier, command_channel};

use common::{MockNode, block_hash_at, pay_to, txid};

fn test_config() -> SyncConfig {
    SyncConfig {
        batch_size: 10,
        io_retry_delay: Duration::from_millis(20),
        conflict_retry_delay: Duration::from_millis(10),
        wrong_chain_delay: Duration::from_millis(200),
        initial_sync_lag: 100,
        command_queue_depth: 16,
        // Tests drive tip changes explicitly; keep the poll out of the way.
        tip_poll_interval: Duration::from_secs(3600),
    }
}

struct Harness {
    handle: SyncHandle,
    tip_events: mpsc::Sender<BlockHash>,
    sync_task: JoinHandle<()>,
}

fn start(node: &Arc<MockNode>, store: &MemoryStore) -> Harness {
    let config = test_config();
    let (mut notifier, tip_events) =
        TipNotifier::new(Arc::clone(node) as Arc<dyn NodeClient>, config.tip_poll_interval);
    let tip = notifier.subscribe(false);
    tokio::spawn(notifier.run());

    let (handle, commands) = command_channel(config.command_queue_depth);
    let sync = ChainSynchronizer::new(
        Arc::clone(node) as Arc<dyn NodeClient>,
        Arc::new(store.clone()),
        config,
        commands,
        tip,
    );
    let sync_task = tokio::spawn(sync.run());
    Harness { handle, tip_events, sync_task }
}

async fn shutdown(harness: Harness) {
    let _ = harness.handle.stop(Duration::from_secs(2)).await;
    timeout(Duration::from_secs(2), harness.sync_task)
        .await
        .expect("synchronizer did not stop in time")
        .unwrap();
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_best(store: &MemoryStore, height: u64) {
    wait_for(&format!("best height {height}"), || {
        store.chain_state().is_some_and(|s| s.best_block_height == height)
    })
    .await;
}

#[tokio::test]
async fn initial_sync_pins_start_behind_tip() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    let state = store.chain_state().unwrap();
    assert_eq!(state.first_height, 400);
    assert_eq!(state.root_hash, block_hash_at(1, 1));
    assert_eq!(state.best_block_hash, block_hash_at(1, 500));

    shutdown(harness).await;
}

#[tokio::test]
async fn initial_sync_starts_at_genesis_on_short_chain() {
    let node = MockNode::with_height(1, 50);
    let store = MemoryStore::new();
    let harness = start(&node, &store);

    wait_for_best(&store, 50).await;
    let state = store.chain_state().unwrap();
    assert_eq!(state.first_height, 1);
    assert_eq!(state.root_hash, block_hash_at(1, 1));

    shutdown(harness).await;
}

#[tokio::test]
async fn resumes_from_checkpoint_after_restart() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();

    let harness = start(&node, &store);
    wait_for_best(&store, 500).await;
    shutdown(harness).await;

    // New blocks arrive while the worker is down.
    node.extend(1, 5);
    let harness = start(&node, &store);

    wait_for_best(&store, 505).await;
    let state = store.chain_state().unwrap();
    // Resume continues from the checkpoint; the start pin never moves.
    assert_eq!(state.first_height, 400);
    assert_eq!(state.best_block_hash, block_hash_at(1, 505));

    shutdown(harness).await;
}

#[tokio::test]
async fn reorg_rolls_back_and_follows_new_branch() {
    let node = MockNode::with_height(1, 497);
    node.extend_with(1, vec![pay_to(0xC1, 8_000, "hot")]); // height 498
    node.extend(1, 2); // heights 499, 500

    let store = MemoryStore::new();
    store.add_address(
        "hot",
        AddressInfo { account: AccountId(3), key_index: 0, internal: false },
    );
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    assert_eq!(store.utxo(&txid(0xC1), 0).unwrap().added_height, Some(498));
    let seq_before = store.chain_seq(AccountId(3));

    // The node reorganizes: fork at 495, longer empty branch to 505.
    node.reorg(495, 2, 10);
    harness.tip_events.send(node.tip_hash()).await.unwrap();

    wait_for_best(&store, 505).await;
    let state = store.chain_state().unwrap();
    assert_eq!(state.best_block_hash, block_hash_at(2, 505));
    // The orphaned deposit is unwound, not deleted, and its account told.
    assert_eq!(store.utxo(&txid(0xC1), 0).unwrap().added_height, None);
    assert!(store.chain_seq(AccountId(3)) > seq_before);

    shutdown(harness).await;
}

#[tokio::test]
async fn resync_to_current_position_writes_nothing() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    let version = store.version();

    harness.handle.resync(node.tip_hash()).await.unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(store.version(), version, "no store commit expected");

    shutdown(harness).await;
}

#[tokio::test]
async fn resync_replays_from_historical_block() {
    let node = MockNode::with_height(1, 449);
    node.extend_with(1, vec![pay_to(0xA1, 5_000, "cold")]); // height 450
    node.extend(1, 19); // through 469
    node.extend_with(1, vec![pay_to(0xA2, 6_000, "cold")]); // height 470
    node.extend(1, 30); // through 500

    let store = MemoryStore::new();
    store.add_address(
        "cold",
        AddressInfo { account: AccountId(8), key_index: 1, internal: false },
    );
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    assert_eq!(store.utxo(&txid(0xA1), 0).unwrap().added_height, Some(450));
    assert_eq!(store.utxo(&txid(0xA2), 0).unwrap().added_height, Some(470));
    let seq_before = store.chain_seq(AccountId(8));

    harness.handle.resync(block_hash_at(1, 460)).await.unwrap();

    // The rollback bumps the account, the replay bumps it again.
    wait_for("replay past the deposit", || {
        store.chain_seq(AccountId(8)) >= seq_before + 2
    })
    .await;
    wait_for_best(&store, 500).await;
    // The deposit below the target is untouched, the one above re-applied.
    assert_eq!(store.utxo(&txid(0xA1), 0).unwrap().added_height, Some(450));
    assert_eq!(store.utxo(&txid(0xA2), 0).unwrap().added_height, Some(470));

    shutdown(harness).await;
}

#[tokio::test]
async fn wrong_chain_stalls_without_writes_and_stops_cleanly() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();

    // Database pinned to a different chain's block 1.
    let mut txn = store.begin().unwrap();
    txn.update_chain_state(
        &ChainState {
            root_hash: block_hash_at(9, 1),
            first_height: 400,
            best_block_hash: block_hash_at(9, 500),
            best_block_height: 500,
        },
        true,
    )
    .unwrap();
    txn.commit().unwrap();
    let version = store.version();

    let harness = start(&node, &store);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(store.version(), version, "wrong chain must not mutate the store");
    assert_eq!(store.chain_state().unwrap().root_hash, block_hash_at(9, 1));

    // Stop must cut the long wrong-chain backoff short.
    shutdown(harness).await;
}

#[tokio::test]
async fn transient_node_failures_are_retried() {
    let node = MockNode::with_height(1, 500);
    node.fail_next(3);
    let store = MemoryStore::new();
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    shutdown(harness).await;
}

#[tokio::test]
async fn store_conflicts_are_retried() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();
    store.inject_commit_conflicts(2);
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    shutdown(harness).await;
}

#[tokio::test]
async fn stop_during_conflict_retries_leaves_store_untouched() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();
    // Every commit fails; the worker is stuck in conflict retries.
    store.inject_commit_conflicts(u64::MAX);
    let harness = start(&node, &store);

    sleep(Duration::from_millis(100)).await;
    shutdown(harness).await;

    // Nothing ever committed; the open transaction was unwound on stop.
    assert_eq!(store.version(), 0);
    assert_eq!(store.chain_state(), None);
}

#[tokio::test]
async fn restart_command_rederives_position() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    node.extend(1, 3);
    harness.handle.restart().await.unwrap();

    // No tip signal needed: resume sees the successor in the checkpoint
    // block's header and walks forward.
    wait_for_best(&store, 503).await;
    shutdown(harness).await;
}

#[tokio::test]
async fn stop_leaves_checkpoint_consistent() {
    let node = MockNode::with_height(1, 500);
    let store = MemoryStore::new();
    let harness = start(&node, &store);

    wait_for_best(&store, 500).await;
    shutdown(harness).await;

    let state = store.chain_state().unwrap();
    assert_eq!(state.best_block_hash, block_hash_at(1, 500));
    assert_eq!(state.best_block_height, 500);
}
