//! Administrative command protocol for the synchronizer.
//!
//! Commands travel over a bounded mpsc channel so bursts of operator
//! commands are queued rather than silently dropped. The synchronizer
//! polls the channel at every loop boundary; a `ReSync` that arrives while
//! it is busy elsewhere is remembered as the single pending re-sync
//! (last request wins — a re-sync issued while another is pending silently
//! supersedes it).

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use custodia_core::types::BlockHash;

/// An administrative command to the chain synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Re-scan from the given block. Targets ahead of the current position
    /// are reached by the normal forward walk; targets at or before it
    /// trigger a rollback to that exact block.
    ReSync(BlockHash),
    /// Abandon the current loop iteration, roll back any open transaction,
    /// and re-enter the resume state.
    Restart,
    /// Shut down. The worker observes the request within one loop
    /// iteration; `deadline` is the wall-clock budget the embedding
    /// process grants before giving up on the join.
    Stop { deadline: Duration },
}

/// Receiving end of the command channel, consumed by the synchronizer.
pub type CommandReceiver = mpsc::Receiver<Command>;

/// The synchronizer is gone; the command was not delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("synchronizer stopped")]
pub struct SyncStopped;

/// Create a bounded command channel of the given depth.
pub fn command_channel(depth: usize) -> (SyncHandle, CommandReceiver) {
    let (tx, rx) = mpsc::channel(depth);
    (SyncHandle { tx }, rx)
}

/// Operator-facing handle for sending commands to the synchronizer.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<Command>,
}

impl SyncHandle {
    /// Request a re-scan from the given block.
    pub async fn resync(&self, hash: BlockHash) -> Result<(), SyncStopped> {
        self.tx.send(Command::ReSync(hash)).await.map_err(|_| SyncStopped)
    }

    /// Request a restart (re-enter the resume state).
    pub async fn restart(&self) -> Result<(), SyncStopped> {
        self.tx.send(Command::Restart).await.map_err(|_| SyncStopped)
    }

    /// Request shutdown with the given deadline.
    pub async fn stop(&self, deadline: Duration) -> Result<(), SyncStopped> {
        self.tx.send(Command::Stop { deadline }).await.map_err(|_| SyncStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(seed: u8) -> BlockHash {
        BlockHash::from_bytes([seed; 32])
    }

    #[tokio::test]
    async fn commands_arrive_in_order() {
        let (handle, mut rx) = command_channel(16);
        handle.resync(hash(1)).await.unwrap();
        handle.restart().await.unwrap();
        handle.stop(Duration::from_secs(2)).await.unwrap();

        assert_eq!(rx.recv().await, Some(Command::ReSync(hash(1))));
        assert_eq!(rx.recv().await, Some(Command::Restart));
        assert_eq!(
            rx.recv().await,
            Some(Command::Stop { deadline: Duration::from_secs(2) })
        );
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_fails() {
        let (handle, rx) = command_channel(16);
        drop(rx);
        assert_eq!(handle.restart().await, Err(SyncStopped));
    }

    #[tokio::test]
    async fn bounded_queue_buffers_bursts() {
        let (handle, mut rx) = command_channel(10);
        // A burst up to the queue depth is absorbed without a receiver.
        for i in 0..10 {
            handle.resync(hash(i)).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await, Some(Command::ReSync(hash(i))));
        }
    }
}
