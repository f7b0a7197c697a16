// =============================================================================
// Storage Gateway — history reads and row writes for the aggregation engine
// =============================================================================
//
// The engine reads history and writes reduced rows through the
// `StorageGateway` trait. The real key-value store lives outside this crate;
// `MemoryStore` implements the same contract in memory and can persist itself
// as a JSON snapshot, which is what the binary and the tests run against.
//
// Contract:
//   - `get_exchanges` returns rows of one table whose window start lies in
//     `[start, end)`, ordered by window start. Without an interval it returns
//     raw exchange events instead, ordered by sort key.
//   - `put_rows` upserts rows keyed by `pair|YYYYMMDDHHmmss`. Writing the
//     same key with the same content twice has no further effect.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bucket::Resolution;
use crate::error::StorageError;
use crate::types::{ExchangeEvent, ReducedRow, TradingPair};

/// A bounded history read.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub pair: TradingPair,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Table to read; `None` reads raw exchanges.
    pub interval: Option<Resolution>,
}

/// Rows returned by a history read.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryRows {
    Exchanges(Vec<ExchangeEvent>),
    Aggregates(Vec<ReducedRow>),
}

impl HistoryRows {
    pub fn len(&self) -> usize {
        match self {
            HistoryRows::Exchanges(rows) => rows.len(),
            HistoryRows::Aggregates(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn get_exchanges(&self, query: HistoryQuery) -> Result<HistoryRows, StorageError>;

    async fn put_rows(
        &self,
        table: Resolution,
        rows: BTreeMap<String, ReducedRow>,
    ) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// On-disk form of a [`MemoryStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    tables: BTreeMap<String, BTreeMap<String, ReducedRow>>,
    /// Raw exchanges keyed by pair identifier.
    #[serde(default)]
    exchanges: BTreeMap<String, Vec<ExchangeEvent>>,
}

/// In-memory storage gateway.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Resolution, BTreeMap<String, ReducedRow>>>,
    /// Raw exchanges per pair identifier, keyed by trade key.
    exchanges: RwLock<HashMap<String, BTreeMap<String, ExchangeEvent>>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record raw exchanges as the ledger importer would.
    pub fn record_exchanges(&self, pair: &TradingPair, events: impl IntoIterator<Item = ExchangeEvent>) {
        let mut map = self.exchanges.write();
        let stored = map.entry(pair.key_base()).or_default();
        for event in events {
            stored.insert(event.trade_key.clone(), event);
        }
    }

    pub fn row(&self, table: Resolution, key: &str) -> Option<ReducedRow> {
        self.tables.read().get(&table).and_then(|rows| rows.get(key).cloned())
    }

    /// All rows of a table, ordered by key.
    pub fn rows(&self, table: Resolution) -> Vec<(String, ReducedRow)> {
        self.tables
            .read()
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Number of successful `put_rows` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Load a store previously written by [`MemoryStore::save_snapshot`].
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot from {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot from {}", path.display()))?;

        let mut tables = HashMap::new();
        for (label, rows) in snapshot.tables {
            let table: Resolution = label
                .parse()
                .with_context(|| format!("unknown table {label} in {}", path.display()))?;
            tables.insert(table, rows);
        }

        info!(
            path = %path.display(),
            tables = tables.len(),
            pairs = snapshot.exchanges.len(),
            "storage snapshot loaded"
        );

        Ok(Self {
            tables: RwLock::new(tables),
            exchanges: RwLock::new(
                snapshot
                    .exchanges
                    .into_iter()
                    .map(|(pair, events)| {
                        let keyed = events
                            .into_iter()
                            .map(|event| (event.trade_key.clone(), event))
                            .collect();
                        (pair, keyed)
                    })
                    .collect(),
            ),
            writes: AtomicU64::new(0),
        })
    }

    /// Persist the store to `path` using an atomic write (write to `.tmp`,
    /// then rename).
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let snapshot = Snapshot {
            tables: self
                .tables
                .read()
                .iter()
                .map(|(table, rows)| (table.label(), rows.clone()))
                .collect(),
            exchanges: self
                .exchanges
                .read()
                .iter()
                .map(|(pair, events)| (pair.clone(), events.values().cloned().collect()))
                .collect(),
        };

        let content = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialise storage snapshot to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        info!(path = %path.display(), "storage snapshot saved (atomic)");
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for MemoryStore {
    async fn get_exchanges(&self, query: HistoryQuery) -> Result<HistoryRows, StorageError> {
        let key_base = query.pair.key_base();
        let in_range = |t: DateTime<Utc>| query.start <= t && t < query.end;

        match query.interval {
            None => {
                let mut events: Vec<ExchangeEvent> = self
                    .exchanges
                    .read()
                    .get(&key_base)
                    .map(|events| {
                        events
                            .values()
                            .filter(|e| in_range(e.timestamp))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                events.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
                Ok(HistoryRows::Exchanges(events))
            }
            Some(table) => {
                let prefix = format!("{key_base}|");
                let mut rows: Vec<ReducedRow> = self
                    .tables
                    .read()
                    .get(&table)
                    .map(|rows| {
                        rows.iter()
                            .filter(|(key, row)| key.starts_with(&prefix) && in_range(row.start))
                            .map(|(_, row)| row.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                rows.sort_by_key(|row| row.start);
                Ok(HistoryRows::Aggregates(rows))
            }
        }
    }

    async fn put_rows(
        &self,
        table: Resolution,
        rows: BTreeMap<String, ReducedRow>,
    ) -> Result<(), StorageError> {
        self.tables.write().entry(table).or_default().extend(rows);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::PeriodUnit;
    use crate::types::Currency;
    use chrono::{TimeDelta, TimeZone};
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new(Currency::native("XRP"), Currency::issued("USD", "rGate"))
    }

    fn hour_row(start: DateTime<Utc>) -> ReducedRow {
        let ev = ExchangeEvent::from_ledger("A", 1, 0, 0, start, dec!(1), dec!(2), dec!(2));
        ReducedRow::from_trade(&ev, start)
    }

    #[tokio::test]
    async fn range_read_returns_pair_rows_in_window_order() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2015, 6, 1, 10, 0, 0).unwrap();
        let other = TradingPair::new(Currency::native("XRP"), Currency::issued("EUR", "rGate"));
        let table = Resolution::base(PeriodUnit::Hour);

        let mut rows = BTreeMap::new();
        for h in [2, 0, 1, 5] {
            let start = t0 + TimeDelta::hours(h);
            rows.insert(pair().row_key(start), hour_row(start));
        }
        rows.insert(other.row_key(t0), hour_row(t0));
        store.put_rows(table, rows).await.unwrap();

        let query = HistoryQuery {
            pair: pair(),
            start: t0,
            end: t0 + TimeDelta::hours(3),
            interval: Some(table),
        };
        let HistoryRows::Aggregates(found) = store.get_exchanges(query).await.unwrap() else {
            panic!("expected aggregates");
        };
        let starts: Vec<_> = found.iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![t0, t0 + TimeDelta::hours(1), t0 + TimeDelta::hours(2)]);
    }

    #[tokio::test]
    async fn put_rows_is_idempotent_by_key() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2015, 6, 1, 10, 0, 0).unwrap();
        let table = Resolution::base(PeriodUnit::Minute);
        let rows: BTreeMap<_, _> = [(pair().row_key(t0), hour_row(t0))].into_iter().collect();

        store.put_rows(table, rows.clone()).await.unwrap();
        store.put_rows(table, rows).await.unwrap();
        assert_eq!(store.rows(table).len(), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn raw_read_filters_by_time_and_pair() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2015, 6, 1, 10, 0, 0).unwrap();
        let events = [
            ExchangeEvent::from_ledger("A", 2, 0, 0, t0 + TimeDelta::seconds(10), dec!(1), dec!(1), dec!(1)),
            ExchangeEvent::from_ledger("B", 1, 0, 0, t0 + TimeDelta::seconds(20), dec!(1), dec!(1), dec!(1)),
            ExchangeEvent::from_ledger("C", 3, 0, 0, t0 + TimeDelta::minutes(5), dec!(1), dec!(1), dec!(1)),
        ];
        store.record_exchanges(&pair(), events);

        let query = HistoryQuery {
            pair: pair(),
            start: t0,
            end: t0 + TimeDelta::minutes(1),
            interval: None,
        };
        let HistoryRows::Exchanges(found) = store.get_exchanges(query).await.unwrap() else {
            panic!("expected exchanges");
        };
        let keys: Vec<_> = found.iter().map(|e| e.trade_key.as_str()).collect();
        assert_eq!(keys, vec!["B|0", "A|0"]);
    }

    #[tokio::test]
    async fn recording_a_known_trade_key_replaces_the_event() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2015, 6, 1, 10, 0, 0).unwrap();
        let first = ExchangeEvent::from_ledger("A", 2, 0, 0, t0, dec!(1), dec!(1), dec!(1));
        let corrected = ExchangeEvent::from_ledger("A", 2, 0, 0, t0, dec!(4), dec!(8), dec!(2));
        let other = ExchangeEvent::from_ledger("A", 2, 0, 1, t0, dec!(1), dec!(1), dec!(1));

        store.record_exchanges(&pair(), [first]);
        store.record_exchanges(&pair(), [corrected.clone(), other]);
        store.record_exchanges(&pair(), [corrected.clone()]);

        let query = HistoryQuery {
            pair: pair(),
            start: t0,
            end: t0 + TimeDelta::minutes(1),
            interval: None,
        };
        let HistoryRows::Exchanges(found) = store.get_exchanges(query).await.unwrap() else {
            panic!("expected exchanges");
        };
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], corrected);
        assert_eq!(found[1].trade_key, "A|1");
    }

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = std::env::temp_dir().join(format!("exagg-snapshot-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.json");

        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2015, 6, 1, 10, 0, 0).unwrap();
        let table = Resolution::new(4, PeriodUnit::Hour);
        store
            .tables
            .write()
            .entry(table)
            .or_default()
            .insert(pair().row_key(t0), hour_row(t0));
        let event = ExchangeEvent::from_ledger("A", 1, 0, 0, t0, dec!(1), dec!(2), dec!(2));
        store.record_exchanges(&pair(), [event.clone()]);
        store.save_snapshot(&path).unwrap();

        let loaded = MemoryStore::load_snapshot(&path).unwrap();
        assert_eq!(loaded.row(table, &pair().row_key(t0)), Some(hour_row(t0)));
        assert_eq!(loaded.exchanges.read()[&pair().key_base()]["A|0"], event);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
