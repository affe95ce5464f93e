//! Per-chain ingestion driver.
//!
//! The driver alternates between parallel catch-up over a historical range
//! and strictly ordered live polling at the head. After a fixed number of
//! live blocks it takes a checkpoint and starts over from that snapshot
//! alone, so no state accumulates across a long-running chain.

use futures::StreamExt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::adapters::ChainAdapter;
use crate::chain::ChainRuntime;
use crate::config::SchedulerConfig;
use crate::db::{CursorStatus, SchedulerMode, Store};
use crate::indexer::runner::{TaskOptions, TaskRunner};
use crate::indexer::types::FetchOptions;
use crate::indexer::watermark::Watermark;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    CatchUp,
    Live,
}

/// A gap of exactly `threshold` blocks still counts as live.
pub fn decide_mode(cursor: i64, latest: u64, threshold: u64) -> Mode {
    let gap = latest as i64 - cursor;
    if gap > threshold as i64 {
        Mode::CatchUp
    } else {
        Mode::Live
    }
}

/// Split `[from, to]` into consecutive ranges of at most `size` blocks.
pub fn partition(from: u64, to: u64, size: u64) -> Vec<RangeInclusive<u64>> {
    let size = size.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = std::cmp::min(start.saturating_add(size - 1), to);
        ranges.push(start..=end);
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

/// Snapshot handed from one live run to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub chain_id: i64,
    pub cursor: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LiveExit {
    Checkpoint(Checkpoint),
    FellBehind(i64),
    Cancelled(i64),
}

pub struct ChainScheduler {
    chain: Arc<ChainRuntime>,
    adapter: ChainAdapter,
    store: Arc<dyn Store>,
    settings: SchedulerConfig,
    runner: TaskRunner,
    shutdown: CancellationToken,
}

impl ChainScheduler {
    pub fn new(
        chain: Arc<ChainRuntime>,
        adapter: ChainAdapter,
        store: Arc<dyn Store>,
        settings: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chain,
            adapter,
            store,
            settings,
            runner: TaskRunner::new(shutdown.clone()),
            shutdown,
        }
    }

    /// Run until cancelled or until a unit of work exhausts its retries.
    pub async fn run(&self) -> eyre::Result<()> {
        let chain_id = self.chain.chain_id();
        let cursor = self
            .store
            .get_cursor(chain_id)
            .await?
            .ok_or_else(|| eyre::eyre!("No cursor for chain {}", chain_id))?;

        let mut checkpoint = Checkpoint {
            chain_id,
            cursor: cursor.last_indexed_block,
        };
        tracing::info!(
            chain = %self.chain.name(),
            cursor = checkpoint.cursor,
            "Starting ingestion"
        );

        while !self.shutdown.is_cancelled() {
            match self.step(checkpoint).await? {
                Some(next) => checkpoint = next,
                None => break,
            }
        }

        tracing::info!(chain = %self.chain.name(), "Ingestion stopped");
        Ok(())
    }

    /// One mode decision and the work it leads to. `None` means cancelled.
    async fn step(&self, checkpoint: Checkpoint) -> eyre::Result<Option<Checkpoint>> {
        let chain_id = checkpoint.chain_id;
        let latest = self.latest_height().await?;

        match decide_mode(checkpoint.cursor, latest, self.settings.catchup_threshold) {
            Mode::CatchUp => {
                self.set_mode(SchedulerMode::CatchingUp).await?;
                let cursor = self.catch_up(checkpoint.cursor, latest).await?;
                Ok(Some(Checkpoint { chain_id, cursor }))
            }
            Mode::Live => {
                self.set_mode(SchedulerMode::Polling).await?;
                match self.live(checkpoint.cursor).await? {
                    LiveExit::Checkpoint(next) => {
                        tracing::info!(
                            chain = %self.chain.name(),
                            cursor = next.cursor,
                            "Live checkpoint reached, continuing as new"
                        );
                        Ok(Some(next))
                    }
                    LiveExit::FellBehind(cursor) => {
                        tracing::info!(
                            chain = %self.chain.name(),
                            cursor,
                            "Fell behind head, switching to catch-up"
                        );
                        Ok(Some(Checkpoint { chain_id, cursor }))
                    }
                    LiveExit::Cancelled(_) => Ok(None),
                }
            }
        }
    }

    async fn set_mode(&self, mode: SchedulerMode) -> eyre::Result<()> {
        self.store
            .set_status(self.chain.chain_id(), CursorStatus::Running, Some(mode), None)
            .await
    }

    async fn latest_height(&self) -> eyre::Result<u64> {
        let options = TaskOptions::block(&self.settings);
        self.runner
            .execute("latest_height", &options, |_| {
                self.adapter.latest_height(&self.chain)
            })
            .await
    }

    // ============================================================
    // Catch-up
    // ============================================================

    /// Index `[cursor + 1, latest]` in parallel batches and return the
    /// contiguous height reached.
    pub async fn catch_up(&self, cursor: i64, latest: u64) -> eyre::Result<i64> {
        let from = (cursor + 1).max(0) as u64;
        if from > latest {
            return Ok(cursor);
        }

        let parallel = self
            .chain
            .config
            .catchup_parallel_batches
            .unwrap_or(self.settings.catchup_parallel_batches)
            .max(1);
        let ranges = partition(from, latest, self.settings.catchup_batch_size);

        tracing::info!(
            chain = %self.chain.name(),
            from,
            to = latest,
            batches = ranges.len(),
            parallel,
            "Catching up"
        );

        let watermark = Mutex::new(Watermark::new(cursor));
        let results: Vec<eyre::Result<()>> = futures::stream::iter(ranges)
            .map(|range| self.run_batch(range, &watermark))
            .buffer_unordered(parallel)
            .collect()
            .await;

        let height = watermark.lock().await.height();
        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err);
        }

        tracing::info!(chain = %self.chain.name(), cursor = height, "Catch-up pass complete");
        Ok(height)
    }

    async fn run_batch(
        &self,
        range: RangeInclusive<u64>,
        watermark: &Mutex<Watermark>,
    ) -> eyre::Result<()> {
        let name = format!("batch-{}-{}", range.start(), range.end());
        let options = TaskOptions::batch(&self.settings);

        self.runner
            .execute(&name, &options, |heartbeat| {
                let range = range.clone();
                async move {
                    for number in range {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        if watermark.lock().await.is_done(number as i64) {
                            continue;
                        }
                        self.index_block(number, FetchOptions::CATCH_UP).await?;

                        let advanced = watermark.lock().await.complete(number as i64);
                        if let Some(height) = advanced {
                            self.store.advance_cursor(self.chain.chain_id(), height).await?;
                        }
                        heartbeat.beat();
                    }
                    Ok(())
                }
            })
            .await
    }

    // ============================================================
    // Live
    // ============================================================

    /// Follow the head one block at a time, strictly in order.
    pub async fn live(&self, cursor: i64) -> eyre::Result<LiveExit> {
        let chain_id = self.chain.chain_id();
        let poll_interval = Duration::from_secs(self.chain.config.poll_interval_secs);
        let per_poll = self.chain.config.blocks_per_batch.max(1);
        let mut cursor = cursor;
        let mut processed = 0u64;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(LiveExit::Cancelled(cursor));
            }

            let latest = self.latest_height().await?;
            if decide_mode(cursor, latest, self.settings.catchup_threshold) == Mode::CatchUp {
                return Ok(LiveExit::FellBehind(cursor));
            }

            let next = (cursor + 1).max(0) as u64;
            if next <= latest {
                let end = std::cmp::min(latest, next + per_poll - 1);
                for number in next..=end {
                    if self.shutdown.is_cancelled() {
                        return Ok(LiveExit::Cancelled(cursor));
                    }

                    let options = TaskOptions::block(&self.settings);
                    let name = format!("block-{}", number);
                    self.runner
                        .execute(&name, &options, |_| async move {
                            self.index_block(number, FetchOptions::LIVE).await?;
                            self.store.advance_cursor(chain_id, number as i64).await
                        })
                        .await?;

                    cursor = number as i64;
                    processed += 1;
                    if processed >= self.settings.live_checkpoint_blocks {
                        return Ok(LiveExit::Checkpoint(Checkpoint { chain_id, cursor }));
                    }
                }
                if end < latest {
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.shutdown.cancelled() => {
                    tracing::info!(chain = %self.chain.name(), "Shutdown received, stopping poller");
                    return Ok(LiveExit::Cancelled(cursor));
                }
            }
        }
    }

    /// Fetch, decode and persist one block. The cursor is left to the caller.
    async fn index_block(&self, number: u64, options: FetchOptions) -> eyre::Result<()> {
        let bundle = self
            .adapter
            .fetch_and_extract(&self.chain, self.store.as_ref(), number, options)
            .await?;

        tracing::debug!(
            chain = %self.chain.name(),
            block = number,
            transactions = bundle.transactions.len(),
            transfers = bundle.transfers.len(),
            "Persisting block"
        );
        self.store.persist_block(&bundle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainType, RetryConfig};
    use crate::db::MemoryStore;
    use crate::decoders::DecoderRegistry;
    use crate::rpc::testing::{chain_config, endpoints, ScriptedTransport};
    use crate::rpc::RpcError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};

    const CHAIN: u64 = 9000;

    /// Synthetic UTXO node: block `n` holds a single coinbase.
    struct Node {
        head: Arc<AtomicU64>,
        fail_at: Arc<AtomicU64>,
    }

    fn block(n: u64) -> Value {
        json!({
            "hash": format!("h{}", n),
            "height": n,
            "previousblockhash": format!("h{}", n.saturating_sub(1)),
            "time": 1_700_000_000u64 + n,
            "tx": [{
                "txid": format!("cb{}", n),
                "vin": [{"coinbase": "00"}],
                "vout": [{"n": 0, "value": 1.0, "scriptPubKey": {"type": "pubkeyhash", "address": "miner"}}]
            }]
        })
    }

    fn settings() -> SchedulerConfig {
        SchedulerConfig {
            catchup_threshold: 10,
            catchup_batch_size: 7,
            catchup_parallel_batches: 3,
            live_checkpoint_blocks: 1000,
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff_ms: 10,
                max_backoff_ms: 100,
            },
            ..SchedulerConfig::default()
        }
    }

    async fn setup(url: &str, head: u64, settings: SchedulerConfig) -> (ChainScheduler, Arc<MemoryStore>, Node) {
        let node = Node {
            head: Arc::new(AtomicU64::new(head)),
            fail_at: Arc::new(AtomicU64::new(u64::MAX)),
        };
        let (head, fail_at) = (node.head.clone(), node.fail_at.clone());
        let transport = Arc::new(ScriptedTransport::rpc(move |_, method, params| {
            match method {
                "getblockcount" => Ok(json!(head.load(Ordering::SeqCst))),
                "getblockhash" => Ok(json!(format!("h{}", params[0].as_u64().unwrap_or_default()))),
                "getblock" => {
                    let n: u64 = params[0].as_str().unwrap_or("h0")[1..].parse().unwrap_or_default();
                    if n == fail_at.load(Ordering::SeqCst) {
                        Err(RpcError::Rpc { code: -1, message: "corrupt block".into() })
                    } else {
                        Ok(block(n))
                    }
                }
                _ => Err(RpcError::Rpc { code: -32601, message: "Method not found".into() }),
            }
        }));

        let config = chain_config(CHAIN, ChainType::Utxo, endpoints(&[url]));
        let store = Arc::new(MemoryStore::new());
        store.seed_chain(&config).await.unwrap();
        store.init_cursor(CHAIN as i64, -1).await.unwrap();

        let chain = Arc::new(ChainRuntime::new(config));
        let registry = Arc::new(DecoderRegistry::standard().unwrap());
        let adapter = ChainAdapter::build(&chain, transport, registry);
        let scheduler = ChainScheduler::new(
            chain,
            adapter,
            store.clone(),
            settings,
            CancellationToken::new(),
        );
        (scheduler, store, node)
    }

    async fn cursor(store: &MemoryStore) -> i64 {
        store.get_cursor(CHAIN as i64).await.unwrap().unwrap().last_indexed_block
    }

    #[test]
    fn test_decide_mode_boundary_is_live() {
        assert_eq!(decide_mode(100, 150, 50), Mode::Live);
        assert_eq!(decide_mode(100, 151, 50), Mode::CatchUp);
        assert_eq!(decide_mode(-1, 50, 50), Mode::CatchUp);
        assert_eq!(decide_mode(200, 150, 50), Mode::Live);
    }

    #[test]
    fn test_partition_covers_range_without_overlap() {
        let ranges = partition(10, 34, 10);
        assert_eq!(ranges, vec![10..=19, 20..=29, 30..=34]);
        assert_eq!(partition(5, 5, 50), vec![5..=5]);
        assert!(partition(6, 5, 50).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_indexes_every_block_and_moves_cursor_to_head() {
        let (scheduler, store, _node) = setup("http://sched-catchup", 60, settings()).await;

        let height = scheduler.catch_up(-1, 60).await.unwrap();

        assert_eq!(height, 60);
        assert_eq!(cursor(&store).await, 60);
        let counts = store.counts(CHAIN as i64).await;
        assert_eq!(counts.blocks, 61);
        assert_eq!(counts.transfers, 61);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_failure_keeps_cursor_below_gap() {
        let (scheduler, store, node) = setup("http://sched-catchup-fail", 40, settings()).await;
        node.fail_at.store(9, Ordering::SeqCst);

        let result = scheduler.catch_up(-1, 40).await;

        assert!(result.is_err());
        assert_eq!(cursor(&store).await, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_takes_checkpoint() {
        let mut settings = settings();
        settings.live_checkpoint_blocks = 5;
        let (scheduler, store, _node) = setup("http://sched-checkpoint", 8, settings).await;

        let exit = scheduler.live(-1).await.unwrap();

        assert_eq!(
            exit,
            LiveExit::Checkpoint(Checkpoint { chain_id: CHAIN as i64, cursor: 4 })
        );
        assert_eq!(cursor(&store).await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_hands_back_when_gap_exceeds_threshold() {
        let (scheduler, store, _node) = setup("http://sched-behind", 500, settings()).await;

        let exit = scheduler.live(-1).await.unwrap();

        assert_eq!(exit, LiveExit::FellBehind(-1));
        assert_eq!(store.counts(CHAIN as i64).await.blocks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_catches_up_then_polls_until_cancelled() {
        let (scheduler, store, node) = setup("http://sched-run", 45, settings()).await;
        let shutdown = scheduler.shutdown.clone();
        let scheduler = Arc::new(scheduler);
        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        while cursor(&store).await < 45 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        node.head.store(48, Ordering::SeqCst);
        while cursor(&store).await < 48 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let status = store.chain_status(CHAIN as i64).await.unwrap().unwrap();
        assert_eq!(status.mode, Some(SchedulerMode::Polling));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(store.counts(CHAIN as i64).await.blocks, 49);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_live_block_stops_run_with_error() {
        let (scheduler, store, node) = setup("http://sched-live-fail", 5, settings()).await;
        node.fail_at.store(3, Ordering::SeqCst);

        let err = scheduler.run().await.unwrap_err();

        assert!(format!("{:#}", err).contains("corrupt block"));
        assert_eq!(cursor(&store).await, 2);
    }
}
