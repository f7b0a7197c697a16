// =============================================================================
// Aggregation Engine — ingest queue, cascade cycle, purge timer
// =============================================================================
//
// One engine per trading pair. Two cooperating tasks share the cache:
//   - the cycle loop (`run`): swaps out the ingest queue, folds trades into
//     minute windows, cascades minute → hour → day → month → year, flushes
//     every changed table, then fires completion callbacks.
//   - the purge timer (`run_purge_timer`): evicts expired windows.
//
// Exclusion is a single `ready` flag. Whoever flips it from true to false
// owns the cache until it flips it back; a task that loses the race sleeps
// one poll interval and retries instead of blocking. The gate is reopened as
// soon as the synchronous merge is done; storage writes run after that and
// are awaited before the next cycle. `add` only touches the queue and never
// waits on the gate.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bucket::{history_window, CascadeStep, PeriodUnit, Resolution, CASCADE};
use crate::config::AggregatorConfig;
use crate::error::{AggregatorResult, StorageError};
use crate::reducer::{reduce_rows, DustFilter};
use crate::storage::{HistoryQuery, HistoryRows, StorageGateway};
use crate::types::{ExchangeEvent, ReducedRow, TradingPair};
use crate::window_cache::{EvictionStats, WindowCache};

/// Callback fired once the cycle that consumed an event has flushed (or
/// tried to).
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    event: ExchangeEvent,
    on_done: Option<Completion>,
}

/// Rows changed during one cycle, per output table, keyed by window start.
#[derive(Debug, Default)]
struct CycleUpdates {
    tables: BTreeMap<Resolution, BTreeMap<DateTime<Utc>, ReducedRow>>,
}

impl CycleUpdates {
    fn rows(&self, table: Resolution) -> Option<&BTreeMap<DateTime<Utc>, ReducedRow>> {
        self.tables.get(&table)
    }

    fn set(&mut self, table: Resolution, rows: BTreeMap<DateTime<Utc>, ReducedRow>) {
        self.tables.insert(table, rows);
    }

    fn changed_starts(&self, table: Resolution) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.rows(table).into_iter().flat_map(|rows| rows.keys().copied())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub events: usize,
    pub rejected: usize,
    pub rows: BTreeMap<Resolution, usize>,
    pub failed_tables: Vec<Resolution>,
}

pub struct AggregationEngine {
    pair: TradingPair,
    dust: DustFilter,
    poll_interval: Duration,
    purge_interval: Duration,
    storage: Arc<dyn StorageGateway>,
    incoming: Mutex<Vec<Pending>>,
    cache: Mutex<WindowCache>,
    ready: AtomicBool,
}

impl AggregationEngine {
    /// Create an engine in the bootstrap state. Nothing is aggregated until
    /// [`bootstrap`](Self::bootstrap) completes.
    pub fn new(config: &AggregatorConfig, storage: Arc<dyn StorageGateway>) -> Self {
        Self {
            pair: config.pair.clone(),
            dust: config.dust_filter(),
            poll_interval: config.poll_interval(),
            purge_interval: config.purge_interval(),
            storage,
            incoming: Mutex::new(Vec::new()),
            cache: Mutex::new(WindowCache::new(Utc::now())),
            ready: AtomicBool::new(false),
        }
    }

    pub fn pair(&self) -> &TradingPair {
        &self.pair
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Number of queued events not yet picked up by a cycle.
    pub fn pending(&self) -> usize {
        self.incoming.lock().len()
    }

    /// Enqueue an event. Never waits on aggregation or storage.
    pub fn add(&self, event: ExchangeEvent, on_done: Option<Completion>) {
        self.incoming.lock().push(Pending { event, on_done });
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    fn close_gate(&self) -> Option<MutexGuard<'_, WindowCache>> {
        self.ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(self.cache.lock())
    }

    fn open_gate(&self) {
        self.ready.store(true, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    /// Seed the cache from storage around `now` and open the gate.
    ///
    /// `earliest` becomes the start of the current minute. A failed history
    /// read leaves that tier partially seeded; the engine still starts.
    pub async fn bootstrap(&self, now: DateTime<Utc>) {
        self.ready.store(false, Ordering::Release);
        *self.cache.lock() = WindowCache::new(now);

        for period in PeriodUnit::ALL {
            match self.load_history(period, now).await {
                Ok(count) => debug!(pair = %self.pair, period = %period, rows = count, "history loaded"),
                Err(e) => error!(pair = %self.pair, period = %period, error = %e, "history load failed"),
            }
        }

        let earliest = self.cache.lock().earliest();
        info!(pair = %self.pair, earliest = %earliest, "aggregation engine ready");
        self.open_gate();
    }

    /// Read the history needed to rebuild in-flight windows of `period`.
    ///
    /// Minutes reload raw trades; every coarser period reloads the 1× rows of
    /// the next finer tier, which are what its windows are built from.
    pub async fn load_history(&self, period: PeriodUnit, now: DateTime<Utc>) -> AggregatorResult<usize> {
        let (start, end) = history_window(period, now);
        let interval = period.finer().map(Resolution::base);
        let query = HistoryQuery {
            pair: self.pair.clone(),
            start,
            end,
            interval,
        };

        let rows = self.storage.get_exchanges(query).await?;
        let count = rows.len();

        let mut cache = self.cache.lock();
        match (rows, interval) {
            (HistoryRows::Exchanges(events), None) => {
                for event in &events {
                    cache.seed_trade(event);
                }
            }
            (HistoryRows::Aggregates(rows), Some(table)) => {
                for row in rows {
                    cache.seed_reduced(table.unit, row);
                }
            }
            (_, interval) => {
                return Err(StorageError::Malformed(format!(
                    "unexpected row kind for {period} history (interval {interval:?})"
                ))
                .into());
            }
        }

        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// Run one aggregation cycle if there is queued work and the gate is
    /// open. Returns `None` when nothing ran.
    pub async fn run_cycle(&self) -> Option<CycleSummary> {
        let (batch, updates, rejected) = self.merge_batch()?;

        let failed_tables = self.flush(&updates).await;

        let events = batch.len();
        for pending in batch {
            if let Some(on_done) = pending.on_done {
                on_done();
            }
        }

        let summary = CycleSummary {
            events,
            rejected,
            rows: updates
                .tables
                .iter()
                .map(|(table, rows)| (*table, rows.len()))
                .collect(),
            failed_tables,
        };
        debug!(pair = %self.pair, events, rejected, "aggregation cycle complete");
        Some(summary)
    }

    /// Synchronous part of a cycle, run with the gate closed.
    fn merge_batch(&self) -> Option<(Vec<Pending>, CycleUpdates, usize)> {
        if self.incoming.lock().is_empty() {
            return None;
        }
        let mut cache = self.close_gate()?;
        let batch = std::mem::take(&mut *self.incoming.lock());

        let rejected = batch
            .iter()
            .filter(|pending| !cache.upsert_trade(&pending.event))
            .count();
        let updates = self.cascade(&mut cache);

        drop(cache);
        self.open_gate();
        Some((batch, updates, rejected))
    }

    /// Reduce dirty minutes, then every derived resolution in stage order.
    fn cascade(&self, cache: &mut WindowCache) -> CycleUpdates {
        let mut updates = CycleUpdates::default();
        updates.set(
            Resolution::base(PeriodUnit::Minute),
            cache.reduce_dirty_minutes(&self.dust),
        );

        for stage in CASCADE {
            for step in stage {
                let rows = self.aggregate_step(cache, step, &updates);
                updates.set(step.target, rows);
            }
        }
        updates
    }

    fn aggregate_step(
        &self,
        cache: &mut WindowCache,
        step: &CascadeStep,
        updates: &CycleUpdates,
    ) -> BTreeMap<DateTime<Utc>, ReducedRow> {
        let starts: BTreeSet<DateTime<Utc>> = updates
            .changed_starts(Resolution::base(step.source))
            .map(|t| step.target.aligned_start(t))
            .collect();

        let mut reduced_rows = BTreeMap::new();
        for start in starts {
            let end = step.target.window_end(start);
            let inputs = cache.materialize(step.source, start, end);

            match reduce_rows(inputs.values()) {
                Some(mut row) => {
                    row.start = start;
                    if step.feeds_cache() {
                        cache.store(step.target.unit, row.clone());
                    }
                    reduced_rows.insert(start, row);
                }
                None => {
                    error!(
                        table = %step.target,
                        key = %self.pair.row_key(start),
                        inputs = inputs.len(),
                        "window not reduced"
                    );
                }
            }
        }
        reduced_rows
    }

    /// Write every non-empty table. Returns the tables whose write failed.
    async fn flush(&self, updates: &CycleUpdates) -> Vec<Resolution> {
        let writes = updates
            .tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(table, rows)| {
                let keyed: BTreeMap<String, ReducedRow> = rows
                    .values()
                    .map(|row| (self.pair.row_key(row.start), row.clone()))
                    .collect();
                let table = *table;
                let storage = Arc::clone(&self.storage);
                async move { (table, storage.put_rows(table, keyed).await) }
            });

        let mut failed = Vec::new();
        for (table, result) in join_all(writes).await {
            if let Err(e) = result {
                error!(pair = %self.pair, table = %table, error = %e, "failed to persist rows");
                failed.push(table);
            }
        }
        failed
    }

    // -------------------------------------------------------------------------
    // Purge
    // -------------------------------------------------------------------------

    /// Evict expired windows if the gate is open. Returns `None` when a
    /// cycle currently holds the gate.
    pub fn purge(&self, now: DateTime<Utc>) -> Option<EvictionStats> {
        let mut cache = self.close_gate()?;
        let stats = cache.evict(now);
        let earliest = cache.earliest();
        drop(cache);
        self.open_gate();

        info!(
            pair = %self.pair,
            evicted = stats.total(),
            earliest = %earliest,
            "cache purged"
        );
        Some(stats)
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    /// Cycle loop. Runs back-to-back while there is work, otherwise sleeps
    /// one poll interval. After `shutdown` flips to true (or its sender is
    /// dropped) the queue is drained and the loop returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(pair = %self.pair, poll_ms = self.poll_interval.as_millis() as u64, "aggregation loop started");
        let mut stopping = *shutdown.borrow();

        loop {
            if let Some(summary) = self.run_cycle().await {
                if !summary.failed_tables.is_empty() {
                    warn!(
                        pair = %self.pair,
                        failed = summary.failed_tables.len(),
                        "cycle finished with unpersisted tables"
                    );
                }
                continue;
            }

            if stopping && self.pending() == 0 && self.is_ready() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed(), if !stopping => {
                    stopping = changed.is_err() || *shutdown.borrow();
                }
            }
        }

        info!(pair = %self.pair, "aggregation loop stopped");
    }

    /// Periodic purge. Retries every poll interval while a cycle holds the
    /// gate.
    pub async fn run_purge_timer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.purge_interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            while self.purge(Utc::now()).is_none() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
