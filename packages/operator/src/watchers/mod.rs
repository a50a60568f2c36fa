//! Ledger watchers
//!
//! One `PollLoop` per ledger observes the tip, classifies `(watermark, tip]` and
//! dispatches every event to the subscribers in order. The watermark only advances
//! after the whole range was dispatched, so a failure replays the range next cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use bridge_core::{Chain, LedgerEvent};
use eyre::{Result, WrapErr};
use futures::FutureExt;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::db;
use crate::metrics;
use crate::writers::retry::RetryConfig;

pub mod ckb;
pub mod evm;

pub use ckb::CkbEventSource;
pub use evm::EvmEventSource;

// ============================================================================
// Event Sources
// ============================================================================

/// Classified view of one ledger
#[async_trait]
pub trait EventSource: Send + Sync {
    fn chain(&self) -> Chain;

    /// Highest height considered final
    async fn tip(&self) -> Result<u64>;

    /// Events of blocks `from..=to`, ordered by `(height, tx_index)`
    async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEvent>>;
}

// ============================================================================
// Subscribers
// ============================================================================

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Must be idempotent: a failed batch is dispatched again
    async fn on_event(&self, event: &LedgerEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Handle-based subscriber list. Dispatch follows registration order.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn EventSubscriber>)>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().await.push((id, subscriber));
        id
    }

    /// Returns false if the handle was not registered
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Deliver one event to every subscriber. The first error aborts delivery.
    pub async fn dispatch(&self, event: &LedgerEvent) -> Result<()> {
        // Snapshot so subscribers may (un)subscribe without deadlocking
        let subscribers: Vec<_> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for subscriber in subscribers {
            subscriber.on_event(event).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Watermarks
// ============================================================================

/// One operator's watermarks.
///
/// Every operator signs each event itself, so operators sharing a database must not
/// share progress: one operator's advance would skip the range for the others.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Last height fully classified and dispatched
    async fn get(&self, chain: Chain) -> Result<Option<u64>>;

    /// Never moves a watermark backwards
    async fn advance(&self, chain: Chain, height: u64) -> Result<()>;
}

/// In-memory watermarks. Views made with `for_operator` share one map.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    heights: Arc<Mutex<HashMap<(Address, Chain), u64>>>,
    operator: Address,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another operator's view of the same map
    pub fn for_operator(&self, operator: Address) -> Self {
        Self {
            heights: Arc::clone(&self.heights),
            operator,
        }
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, chain: Chain) -> Result<Option<u64>> {
        Ok(self.heights.lock().await.get(&(self.operator, chain)).copied())
    }

    async fn advance(&self, chain: Chain, height: u64) -> Result<()> {
        let mut heights = self.heights.lock().await;
        let entry = heights.entry((self.operator, chain)).or_insert(height);
        *entry = (*entry).max(height);
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgWatermarkStore {
    pool: PgPool,
    operator: Address,
}

impl PgWatermarkStore {
    pub fn new(pool: PgPool, operator: Address) -> Self {
        Self { pool, operator }
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore {
    async fn get(&self, chain: Chain) -> Result<Option<u64>> {
        db::get_watermark(&self.pool, &self.operator, chain).await
    }

    async fn advance(&self, chain: Chain, height: u64) -> Result<()> {
        if !db::advance_watermark(&self.pool, &self.operator, chain, height).await? {
            warn!(
                operator = %self.operator,
                chain = %chain,
                height,
                "Refused to move watermark backwards"
            );
        }
        Ok(())
    }
}

// ============================================================================
// Poll Loop
// ============================================================================

/// Result of a single poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing new above the watermark
    Idle { watermark: u64 },
    /// `from..=to` was dispatched and the watermark moved to `to`
    Advanced { from: u64, to: u64, events: usize },
}

pub struct PollLoop {
    source: Arc<dyn EventSource>,
    subscribers: Arc<SubscriberRegistry>,
    watermarks: Arc<dyn WatermarkStore>,
    /// Watermark used when none is stored
    start_height: u64,
    poll_interval: Duration,
    max_blocks_per_batch: Option<u64>,
    retry: RetryConfig,
}

impl PollLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        subscribers: Arc<SubscriberRegistry>,
        watermarks: Arc<dyn WatermarkStore>,
        start_height: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            subscribers,
            watermarks,
            start_height,
            poll_interval,
            max_blocks_per_batch: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_max_blocks_per_batch(mut self, max: Option<u64>) -> Self {
        self.max_blocks_per_batch = max.filter(|m| *m > 0);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn chain(&self) -> Chain {
        self.source.chain()
    }

    /// Run one cycle
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let chain = self.source.chain();
        let watermark = self
            .watermarks
            .get(chain)
            .await
            .wrap_err("Failed to read watermark")?
            .unwrap_or(self.start_height);

        let tip = self.source.tip().await.wrap_err("Failed to read ledger tip")?;
        if tip <= watermark {
            return Ok(PollOutcome::Idle { watermark });
        }

        let from = watermark + 1;
        let to = match self.max_blocks_per_batch {
            Some(max) => tip.min(watermark.saturating_add(max)),
            None => tip,
        };

        debug!(chain = %chain, from, to, tip, "Classifying block range");

        let events = self
            .source
            .events_in_range(from, to)
            .await
            .wrap_err_with(|| format!("Failed to classify {} blocks {}..={}", chain, from, to))?;

        for event in &events {
            metrics::record_event(chain.as_str(), event.event.kind());
            self.subscribers.dispatch(event).await.wrap_err_with(|| {
                format!(
                    "Subscriber failed on {} at height {}",
                    event.event.kind(),
                    event.block_number
                )
            })?;
        }

        self.watermarks
            .advance(chain, to)
            .await
            .wrap_err("Failed to advance watermark")?;

        metrics::record_blocks_processed(chain.as_str(), from, to);
        metrics::set_watermark(chain.as_str(), to);

        if !events.is_empty() {
            info!(chain = %chain, from, to, events = events.len(), "Dispatched bridge events");
        }

        Ok(PollOutcome::Advanced {
            from,
            to,
            events: events.len(),
        })
    }

    /// A capped batch left blocks behind it
    async fn has_backlog(&self, outcome: &PollOutcome) -> bool {
        match (outcome, self.max_blocks_per_batch) {
            (PollOutcome::Advanced { to, .. }, Some(_)) => {
                self.source.tip().await.map(|t| t > *to).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Poll until `stop` turns true. Stop is checked only between cycles.
    pub async fn run(self, stop: watch::Receiver<bool>) -> Result<()> {
        let chain = self.source.chain();
        let mut failures: u32 = 0;
        info!(chain = %chain, interval = ?self.poll_interval, "Poll loop started");

        loop {
            if *stop.borrow() {
                info!(chain = %chain, "Poll loop stopped");
                return Ok(());
            }

            let delay = match self.poll_once().await {
                Ok(outcome) => {
                    failures = 0;
                    metrics::record_successful_poll(chain.as_str());
                    if self.has_backlog(&outcome).await {
                        Duration::ZERO
                    } else {
                        self.poll_interval
                    }
                }
                Err(e) => {
                    let backoff = self.retry.backoff_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    metrics::record_error(&format!("{}_poll", chain), "cycle_failed");
                    error!(
                        chain = %chain,
                        failures,
                        ?backoff,
                        error = %format!("{:#}", e),
                        "Poll cycle failed, range will be retried"
                    );
                    backoff
                }
            };
            metrics::set_consecutive_failures(chain.as_str(), failures);

            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// A long-running task that stops cooperatively
pub type StoppableTask =
    Box<dyn FnOnce(watch::Receiver<bool>) -> futures::future::BoxFuture<'static, Result<()>> + Send>;

/// Runs the poll loops and queue consumers
pub struct WatcherManager {
    tasks: Vec<(String, StoppableTask)>,
}

impl WatcherManager {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn add_poll_loop(&mut self, poll_loop: PollLoop) {
        let name = format!("{}-watcher", poll_loop.chain());
        self.add_task(name, Box::new(|stop| poll_loop.run(stop).boxed()));
    }

    pub fn add_task(&mut self, name: String, task: StoppableTask) {
        self.tasks.push((name, task));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run all tasks concurrently.
    /// Returns when any task fails or after a graceful stop on shutdown.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut join_set = tokio::task::JoinSet::new();

        for (name, task) in self.tasks {
            let stop = stop_rx.clone();
            join_set.spawn(async move { (name, task(stop).await) });
        }
        info!(tasks = join_set.len(), "Watcher manager started");

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers at the next cycle boundary");
                let _ = stop_tx.send(true);
                while let Some(joined) = join_set.join_next().await {
                    if let Ok((name, Err(e))) = joined {
                        warn!(task = %name, error = %format!("{:#}", e), "Task failed during shutdown");
                    }
                }
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                let _ = stop_tx.send(true);
                match maybe_done {
                    Some(Ok((name, Ok(())))) => {
                        error!(task = %name, "A watcher exited unexpectedly without error");
                        Err(eyre::eyre!("{} exited unexpectedly", name))
                    }
                    Some(Ok((name, Err(e)))) => {
                        error!(task = %name, "A watcher stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A watcher task panicked: {:?}", e);
                        Err(eyre::eyre!("watcher task panicked: {}", e))
                    }
                    None => {
                        error!("All watcher tasks exited unexpectedly");
                        Err(eyre::eyre!("all watcher tasks exited unexpectedly"))
                    }
                }
            }
        }
    }
}

impl Default for WatcherManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};
    use bridge_core::{Account, BridgeEvent, Deposit};
    use eyre::eyre;
    use std::sync::atomic::AtomicBool;

    /// Scripted source: one NewDeposit per block, optional failure switch
    struct ScriptedSource {
        tip: AtomicU64,
        fail: AtomicBool,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl ScriptedSource {
        fn new(tip: u64) -> Self {
            Self {
                tip: AtomicU64::new(tip),
                fail: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    fn deposit_event(height: u64) -> LedgerEvent {
        LedgerEvent {
            chain: Chain::Ckb,
            block_number: height,
            tx_index: 0,
            tx_hash: B256::with_last_byte(height as u8),
            event: BridgeEvent::NewDeposit(Deposit {
                depositor: Account::from_evm(Address::repeat_byte(0x01)),
                amount: U256::from(height),
                recipient: None,
            }),
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        fn chain(&self) -> Chain {
            Chain::Ckb
        }

        async fn tip(&self) -> Result<u64> {
            Ok(self.tip.load(Ordering::SeqCst))
        }

        async fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEvent>> {
            self.calls.lock().await.push((from, to));
            if self.fail.load(Ordering::SeqCst) {
                return Err(eyre!("connection refused"));
            }
            Ok((from..=to).map(deposit_event).collect())
        }
    }

    #[derive(Default)]
    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, u64)>>>,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        async fn on_event(&self, event: &LedgerEvent) -> Result<()> {
            if self.fail_at == Some(event.block_number) {
                return Err(eyre!("subscriber {} failed", self.label));
            }
            self.seen.lock().await.push((self.label, event.block_number));
            Ok(())
        }
    }

    fn poll_loop(source: Arc<ScriptedSource>, subscribers: Arc<SubscriberRegistry>) -> (PollLoop, Arc<MemoryWatermarkStore>) {
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        let poll = PollLoop::new(
            source,
            subscribers,
            watermarks.clone(),
            0,
            Duration::from_secs(30),
        );
        (poll, watermarks)
    }

    #[tokio::test]
    async fn test_dispatch_follows_registration_order() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            registry
                .subscribe(Arc::new(Recorder {
                    label,
                    seen: seen.clone(),
                    fail_at: None,
                }))
                .await;
        }

        registry.dispatch(&deposit_event(7)).await.unwrap();
        assert_eq!(
            *seen.lock().await,
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_by_handle() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = registry
            .subscribe(Arc::new(Recorder {
                label: "a",
                seen: seen.clone(),
                fail_at: None,
            }))
            .await;
        registry
            .subscribe(Arc::new(Recorder {
                label: "b",
                seen: seen.clone(),
                fail_at: None,
            }))
            .await;

        assert!(registry.unsubscribe(a).await);
        assert!(!registry.unsubscribe(a).await);
        assert_eq!(registry.len().await, 1);

        registry.dispatch(&deposit_event(1)).await.unwrap();
        assert_eq!(*seen.lock().await, vec![("b", 1)]);
    }

    #[tokio::test]
    async fn test_subscriber_error_aborts_dispatch() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry
            .subscribe(Arc::new(Recorder {
                label: "failing",
                seen: seen.clone(),
                fail_at: Some(3),
            }))
            .await;
        registry
            .subscribe(Arc::new(Recorder {
                label: "after",
                seen: seen.clone(),
                fail_at: None,
            }))
            .await;

        assert!(registry.dispatch(&deposit_event(3)).await.is_err());
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_poll_once_advances_to_tip() {
        let source = Arc::new(ScriptedSource::new(3));
        let registry = Arc::new(SubscriberRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry
            .subscribe(Arc::new(Recorder {
                label: "r",
                seen: seen.clone(),
                fail_at: None,
            }))
            .await;
        let (poll, watermarks) = poll_loop(source.clone(), registry);

        let outcome = poll.poll_once().await.unwrap();
        assert_eq!(outcome, PollOutcome::Advanced { from: 1, to: 3, events: 3 });
        assert_eq!(watermarks.get(Chain::Ckb).await.unwrap(), Some(3));
        assert_eq!(*seen.lock().await, vec![("r", 1), ("r", 2), ("r", 3)]);

        assert_eq!(
            poll.poll_once().await.unwrap(),
            PollOutcome::Idle { watermark: 3 }
        );
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_watermark_and_replays() {
        let source = Arc::new(ScriptedSource::new(3));
        let registry = Arc::new(SubscriberRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let flaky = registry
            .subscribe(Arc::new(Recorder {
                label: "flaky",
                seen: seen.clone(),
                fail_at: Some(2),
            }))
            .await;
        let (poll, watermarks) = poll_loop(source.clone(), registry.clone());

        assert!(poll.poll_once().await.is_err());
        assert_eq!(watermarks.get(Chain::Ckb).await.unwrap(), None);

        registry.unsubscribe(flaky).await;
        registry
            .subscribe(Arc::new(Recorder {
                label: "fixed",
                seen: seen.clone(),
                fail_at: None,
            }))
            .await;

        let outcome = poll.poll_once().await.unwrap();
        assert_eq!(outcome, PollOutcome::Advanced { from: 1, to: 3, events: 3 });
        assert_eq!(*source.calls.lock().await, vec![(1, 3), (1, 3)]);
        // Height 1 reached the subscriber twice; subscribers must tolerate replays
        assert_eq!(
            *seen.lock().await,
            vec![("flaky", 1), ("fixed", 1), ("fixed", 2), ("fixed", 3)]
        );
    }

    #[tokio::test]
    async fn test_classification_failure_leaves_watermark() {
        let source = Arc::new(ScriptedSource::new(5));
        source.fail.store(true, Ordering::SeqCst);
        let (poll, watermarks) = poll_loop(source.clone(), Arc::new(SubscriberRegistry::new()));

        assert!(poll.poll_once().await.is_err());
        assert_eq!(watermarks.get(Chain::Ckb).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_max_blocks_per_batch_caps_range() {
        let source = Arc::new(ScriptedSource::new(10));
        let (poll, watermarks) = poll_loop(source.clone(), Arc::new(SubscriberRegistry::new()));
        let poll = poll.with_max_blocks_per_batch(Some(4));

        assert_eq!(
            poll.poll_once().await.unwrap(),
            PollOutcome::Advanced { from: 1, to: 4, events: 4 }
        );
        assert_eq!(
            poll.poll_once().await.unwrap(),
            PollOutcome::Advanced { from: 5, to: 8, events: 4 }
        );
        assert_eq!(
            poll.poll_once().await.unwrap(),
            PollOutcome::Advanced { from: 9, to: 10, events: 2 }
        );
        assert_eq!(watermarks.get(Chain::Ckb).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_memory_watermark_never_moves_backwards() {
        let store = MemoryWatermarkStore::new();
        store.advance(Chain::Evm, 10).await.unwrap();
        store.advance(Chain::Evm, 4).await.unwrap();
        assert_eq!(store.get(Chain::Evm).await.unwrap(), Some(10));
        assert_eq!(store.get(Chain::Ckb).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_operators_sharing_a_store_keep_their_own_progress() {
        let shared = MemoryWatermarkStore::new();
        let first = shared.for_operator(Address::repeat_byte(0x01));
        let second = shared.for_operator(Address::repeat_byte(0x02));

        let source = Arc::new(ScriptedSource::new(5));
        let registry = Arc::new(SubscriberRegistry::new());
        let first_loop = PollLoop::new(
            source.clone(),
            registry.clone(),
            Arc::new(first),
            0,
            Duration::from_secs(30),
        );
        first_loop.poll_once().await.unwrap();

        // The second operator has not signed anything yet and must see the whole range
        assert_eq!(second.get(Chain::Ckb).await.unwrap(), None);
        let second = Arc::new(second);
        let second_loop = PollLoop::new(
            source.clone(),
            registry,
            second.clone(),
            0,
            Duration::from_secs(30),
        );
        assert_eq!(
            second_loop.poll_once().await.unwrap(),
            PollOutcome::Advanced { from: 1, to: 5, events: 5 }
        );
        assert_eq!(second.get(Chain::Ckb).await.unwrap(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_at_cycle_boundary() {
        let source = Arc::new(ScriptedSource::new(2));
        let (poll, watermarks) = poll_loop(source.clone(), Arc::new(SubscriberRegistry::new()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(poll.run(stop_rx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(watermarks.get(Chain::Ckb).await.unwrap(), Some(2));

        stop_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        handle.await.unwrap().unwrap();
        assert_eq!(source.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_stops_tasks_on_shutdown() {
        let mut manager = WatcherManager::new();
        manager.add_task(
            "idle".to_string(),
            Box::new(|mut stop: watch::Receiver<bool>| {
                async move {
                    while !*stop.borrow() {
                        if stop.changed().await.is_err() {
                            break;
                        }
                    }
                    Ok(())
                }
                .boxed()
            }),
        );
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(manager.run(rx));
        tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
