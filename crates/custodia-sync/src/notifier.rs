//! Tip-change notifier.
//!
//! Receives block-observed events from the node transport, de-duplicates
//! on the block id, and republishes a coalesced "tip changed" signal. If no
//! pushed event arrives within the expected inter-block interval it
//! actively polls the node's best-block hash, bounding staleness even if
//! the push transport silently drops messages.
//!
//! The signal is a pure dirty flag: subscribers re-derive real progress
//! from their own state, so duplicate or missed deliveries are safe and no
//! ordering or exactly-once guarantee is provided. Non-blocking
//! subscribers get a depth-1 buffer where a pending signal absorbs new
//! ones; blocking subscribers make the notifier await their capacity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use custodia_core::traits::NodeClient;
use custodia_core::types::BlockHash;

/// A subscription to tip-change signals.
pub struct TipSubscription {
    rx: mpsc::Receiver<()>,
}

impl TipSubscription {
    /// Wait for the next tip-change signal. Returns `false` when the
    /// notifier has shut down.
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

enum Delivery {
    Blocking,
    NonBlocking,
}

struct Subscriber {
    tx: mpsc::Sender<()>,
    delivery: Delivery,
}

/// De-duplicating tip-change notifier.
///
/// Subscribe before calling [`run`](TipNotifier::run); the notifier is
/// then consumed by its event loop. Block-observed events are fed through
/// the sender returned by [`new`](TipNotifier::new).
pub struct TipNotifier {
    node: Arc<dyn NodeClient>,
    poll_interval: Duration,
    events: mpsc::Receiver<BlockHash>,
    subscribers: Vec<Subscriber>,
    last: Option<BlockHash>,
}

impl TipNotifier {
    /// Create a notifier polling the given node as fallback. The returned
    /// sender feeds block-observed events from the push transport; only
    /// the block id matters.
    pub fn new(node: Arc<dyn NodeClient>, poll_interval: Duration) -> (Self, mpsc::Sender<BlockHash>) {
        let (tx, rx) = mpsc::channel(64);
        let notifier = Self {
            node,
            poll_interval,
            events: rx,
            subscribers: Vec::new(),
            last: None,
        };
        (notifier, tx)
    }

    /// Register a subscriber. Blocking subscribers make the notifier await
    /// delivery; non-blocking subscribers get depth-1 drop-on-full
    /// semantics.
    pub fn subscribe(&mut self, blocking: bool) -> TipSubscription {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.push(Subscriber {
            tx,
            delivery: if blocking { Delivery::Blocking } else { Delivery::NonBlocking },
        });
        TipSubscription { rx }
    }

    /// Run the notifier event loop. Exits when the transport feed closes.
    pub async fn run(mut self) {
        loop {
            let observed = tokio::select! {
                event = self.events.recv() => match event {
                    Some(hash) => Some(hash),
                    None => {
                        debug!("tip event feed closed, notifier exiting");
                        return;
                    }
                },
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.node.best_block_hash().await {
                        Ok(hash) => Some(hash),
                        Err(e) => {
                            debug!(error = %e, "tip poll failed");
                            None
                        }
                    }
                }
            };
            if let Some(hash) = observed {
                self.observe(hash).await;
            }
        }
    }

    async fn observe(&mut self, hash: BlockHash) {
        if self.last == Some(hash) {
            return;
        }
        self.last = Some(hash);
        debug!(%hash, "tip changed");
        for subscriber in &self.subscribers {
            match subscriber.delivery {
                Delivery::Blocking => {
                    // Ignore gone subscribers; the signal carries no value.
                    let _ = subscriber.tx.send(()).await;
                }
                Delivery::NonBlocking => {
                    // Full means a signal is already pending; that is enough.
                    let _ = subscriber.tx.try_send(());
                }
            }
        }
    }
}
