use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BlockData, ChainReader};

/// Event pushed by the poller. `None` is the terminal sentinel: the reader
/// has stopped, either on request or because the node became unusable.
pub type BlockEvent = Option<BlockData>;

/// Polls the node for new blocks and pushes them, in ascending order, onto a channel.
pub struct Poller<R> {
    reader: Arc<R>,
    tx: mpsc::Sender<BlockEvent>,
    interval: Duration,
}

impl<R: ChainReader + 'static> Poller<R> {
    /// Create a poller that ticks every `interval`.
    pub fn new(reader: Arc<R>, tx: mpsc::Sender<BlockEvent>, interval: Duration) -> Self {
        Self {
            reader,
            tx,
            interval,
        }
    }

    /// Spawn the poll loop on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run the poll loop until cancelled or until the node fails.
    ///
    /// Every exit path pushes the sentinel exactly once.
    pub async fn run(self, cancel: CancellationToken) {
        let mut next = match self.reader.current_height().await {
            Ok(height) => height,
            Err(e) => {
                error!(error = %e, "reading block number failed");
                self.finish().await;
                return;
            }
        };

        debug!(next, "block reader starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish().await;
                    info!("exiting block reader");
                    return;
                }
                _ = ticker.tick() => {
                    let height = match self.reader.current_height().await {
                        Ok(height) => height,
                        Err(e) => {
                            error!(error = %e, "reading block number failed");
                            self.finish().await;
                            return;
                        }
                    };

                    match self.catch_up(&mut next, height, &cancel).await {
                        CatchUp::Continue => {}
                        CatchUp::Stop => return,
                    }
                }
            }
        }
    }

    /// Fetch every block in `next..=height`, advancing `next` past each one delivered.
    async fn catch_up(&self, next: &mut u64, height: u64, cancel: &CancellationToken) -> CatchUp {
        while *next <= height {
            if cancel.is_cancelled() {
                // The select loop handles the shutdown on its next turn.
                return CatchUp::Continue;
            }

            debug!(block = *next, height, "reading block");

            match self.reader.get_block(*next).await {
                Ok(block) => {
                    if self.tx.send(Some(block)).await.is_err() {
                        debug!("block receiver dropped, exiting block reader");
                        return CatchUp::Stop;
                    }
                    *next += 1;
                }
                Err(e) if e.is_not_found() => {
                    warn!(block = *next, error = %e, "block not available yet, retrying next tick");
                    return CatchUp::Continue;
                }
                Err(e) => {
                    error!(block = *next, error = %e, "reading block failed");
                    self.finish().await;
                    return CatchUp::Stop;
                }
            }
        }

        CatchUp::Continue
    }

    async fn finish(&self) {
        // A closed receiver means the aggregator already stopped.
        let _ = self.tx.send(None).await;
    }
}

enum CatchUp {
    Continue,
    Stop,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::chain::ChainError;

    /// In-memory chain whose height grows by one on every height query.
    struct GrowingChain {
        height: AtomicU64,
        max_height: u64,
        missing_once: Mutex<HashSet<u64>>,
        fail_height_after: Option<u64>,
        fail_block: Option<u64>,
    }

    impl GrowingChain {
        fn new(start: u64, max_height: u64) -> Self {
            Self {
                height: AtomicU64::new(start),
                max_height,
                missing_once: Mutex::new(HashSet::new()),
                fail_height_after: None,
                fail_block: None,
            }
        }
    }

    impl ChainReader for GrowingChain {
        async fn current_height(&self) -> Result<u64, ChainError> {
            let h = self.height.load(Ordering::SeqCst);
            if let Some(limit) = self.fail_height_after {
                if h >= limit {
                    return Err(ChainError::Decode {
                        what: "block height".to_string(),
                        reason: "bad".to_string(),
                    });
                }
            }
            if h < self.max_height {
                self.height.store(h + 1, Ordering::SeqCst);
            }
            Ok(h)
        }

        async fn get_block(&self, number: u64) -> Result<BlockData, ChainError> {
            if self.missing_once.lock().remove(&number) {
                return Err(ChainError::BlockNotFound(number));
            }
            if self.fail_block == Some(number) {
                return Err(ChainError::Decode {
                    what: "gasUsed".to_string(),
                    reason: "bad".to_string(),
                });
            }
            Ok(BlockData {
                number,
                timestamp: number,
                txn_count: 1,
                ..Default::default()
            })
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<BlockEvent>, n: usize) -> Vec<BlockEvent> {
        let mut out = Vec::new();
        while out.len() < n {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ev)) => out.push(ev),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_poller_delivers_blocks_in_order() {
        let chain = Arc::new(GrowingChain::new(5, 9));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = Poller::new(chain, tx, Duration::from_millis(10)).spawn(cancel.clone());

        let events = collect(&mut rx, 5).await;
        let numbers: Vec<u64> = events
            .iter()
            .map(|ev| ev.expect("block event").number)
            .collect();
        assert_eq!(numbers, vec![5, 6, 7, 8, 9]);

        cancel.cancel();
        let last = collect(&mut rx, 1).await;
        assert_eq!(last, vec![None]);
        handle.await.expect("poller task");
    }

    #[tokio::test]
    async fn test_poller_retries_missing_block() {
        let chain = GrowingChain::new(1, 4);
        chain.missing_once.lock().insert(2);
        let chain = Arc::new(chain);

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = Poller::new(chain, tx, Duration::from_millis(10)).spawn(cancel.clone());

        let events = collect(&mut rx, 4).await;
        let numbers: Vec<u64> = events
            .iter()
            .map(|ev| ev.expect("block event").number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);

        cancel.cancel();
        handle.await.expect("poller task");
    }

    #[tokio::test]
    async fn test_poller_height_failure_sends_sentinel() {
        let mut chain = GrowingChain::new(1, 10);
        chain.fail_height_after = Some(3);
        let chain = Arc::new(chain);

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = Poller::new(chain, tx, Duration::from_millis(10)).spawn(cancel);

        let mut events = Vec::new();
        while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            let done = ev.is_none();
            events.push(ev);
            if done {
                break;
            }
        }

        assert_eq!(events.last(), Some(&None));
        let delivered: Vec<u64> = events.iter().flatten().map(|b| b.number).collect();
        assert_eq!(delivered, vec![1, 2]);
        handle.await.expect("poller task");
    }

    #[tokio::test]
    async fn test_poller_block_failure_sends_sentinel() {
        let mut chain = GrowingChain::new(1, 10);
        chain.fail_block = Some(2);
        let chain = Arc::new(chain);

        let (tx, mut rx) = mpsc::channel(1);
        let handle =
            Poller::new(chain, tx, Duration::from_millis(10)).spawn(CancellationToken::new());

        let events = collect(&mut rx, 2).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].map(|b| b.number), Some(1));
        assert_eq!(events[1], None);
        handle.await.expect("poller task");
    }
}
