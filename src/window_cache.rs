// =============================================================================
// Window Cache — per-tier cached windows owned by the aggregation engine
// =============================================================================
//
// Four base tiers keyed by window start:
//   - minute: raw formatted trades (by trade key) + last reduced row + dirty
//   - hour / day / month: reduced rows only
//
// Multiples (5-minute, 2-hour, ...) are never cached; they are materialized
// from their base tier on demand. `earliest` is the oldest minute a new trade
// may land in; anything older would need history that is no longer cached.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::bucket::{aligned_start, is_supported, retention_floor, PeriodUnit};
use crate::reducer::{reduce_trades, DustFilter};
use crate::types::{ExchangeEvent, ReducedRow};

/// Cached state of one minute window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MinuteWindow {
    /// Formatted single-trade rows keyed by trade key.
    pub raw_trades: BTreeMap<String, ReducedRow>,
    pub reduced: Option<ReducedRow>,
    /// Set when a new trade arrived since the last reduction.
    pub dirty: bool,
}

/// Entries dropped by one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub minutes: usize,
    pub hours: usize,
    pub days: usize,
    pub months: usize,
}

impl EvictionStats {
    pub fn total(&self) -> usize {
        self.minutes + self.hours + self.days + self.months
    }
}

#[derive(Debug, Clone)]
pub struct WindowCache {
    earliest: DateTime<Utc>,
    minutes: BTreeMap<DateTime<Utc>, MinuteWindow>,
    hours: BTreeMap<DateTime<Utc>, ReducedRow>,
    days: BTreeMap<DateTime<Utc>, ReducedRow>,
    months: BTreeMap<DateTime<Utc>, ReducedRow>,
}

impl WindowCache {
    pub fn new(earliest: DateTime<Utc>) -> Self {
        Self {
            earliest: aligned_start(earliest, PeriodUnit::Minute, 1),
            minutes: BTreeMap::new(),
            hours: BTreeMap::new(),
            days: BTreeMap::new(),
            months: BTreeMap::new(),
        }
    }

    pub fn earliest(&self) -> DateTime<Utc> {
        self.earliest
    }

    /// Fold a live trade into its minute window and mark it dirty.
    ///
    /// Returns `false` (and logs) when the trade precedes `earliest` or its
    /// timestamp is outside the supported range.
    pub fn upsert_trade(&mut self, event: &ExchangeEvent) -> bool {
        if !is_supported(event.timestamp) {
            warn!(
                trade = %event.trade_key,
                timestamp = %event.timestamp,
                "trade timestamp out of range, dropping"
            );
            return false;
        }
        let start = aligned_start(event.timestamp, PeriodUnit::Minute, 1);
        if start < self.earliest {
            info!(
                trade = %event.trade_key,
                window = %start,
                earliest = %self.earliest,
                "trade precedes cached data, dropping"
            );
            return false;
        }

        let window = self.minutes.entry(start).or_default();
        window
            .raw_trades
            .insert(event.trade_key.clone(), ReducedRow::from_trade(event, start));
        window.dirty = true;
        true
    }

    /// Seed a trade read back from storage. Not subject to `earliest` and
    /// not marked dirty.
    pub fn seed_trade(&mut self, event: &ExchangeEvent) {
        if !is_supported(event.timestamp) {
            warn!(
                trade = %event.trade_key,
                timestamp = %event.timestamp,
                "stored trade timestamp out of range, skipping"
            );
            return;
        }
        let start = aligned_start(event.timestamp, PeriodUnit::Minute, 1);
        self.minutes
            .entry(start)
            .or_default()
            .raw_trades
            .insert(event.trade_key.clone(), ReducedRow::from_trade(event, start));
    }

    /// Seed a reduced row read back from storage into a base tier. Raw
    /// trades already cached for the same minute are kept.
    pub fn seed_reduced(&mut self, tier: PeriodUnit, row: ReducedRow) {
        let start = aligned_start(row.start, tier, 1);
        match tier {
            PeriodUnit::Minute => {
                self.minutes.entry(start).or_default().reduced = Some(ReducedRow { start, ..row });
            }
            _ => self.store(tier, ReducedRow { start, ..row }),
        }
    }

    /// Reduce every dirty minute window, clearing dirtiness, and return the
    /// rows that changed keyed by window start.
    pub fn reduce_dirty_minutes(&mut self, dust: &DustFilter) -> BTreeMap<DateTime<Utc>, ReducedRow> {
        let mut changed = BTreeMap::new();

        for (start, window) in self.minutes.iter_mut().filter(|(_, w)| w.dirty) {
            window.dirty = false;
            match reduce_trades(window.raw_trades.values(), dust) {
                Some(mut row) => {
                    row.start = *start;
                    window.reduced = Some(row.clone());
                    changed.insert(*start, row);
                }
                None => {
                    // Every trade in the window was below the dust threshold.
                    error!(
                        window = %start,
                        trades = window.raw_trades.len(),
                        "minute window not reduced"
                    );
                }
            }
        }

        changed
    }

    /// Collect the reduced rows of `source` whose start lies in
    /// `[start, end)`. Missing windows are skipped.
    pub fn materialize(
        &self,
        source: PeriodUnit,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BTreeMap<DateTime<Utc>, ReducedRow> {
        if start >= end {
            return BTreeMap::new();
        }
        match source {
            PeriodUnit::Minute => self
                .minutes
                .range(start..end)
                .filter_map(|(t, w)| w.reduced.clone().map(|row| (*t, row)))
                .collect(),
            _ => match self.tier(source) {
                Some(rows) => rows
                    .range(start..end)
                    .map(|(t, row)| (*t, row.clone()))
                    .collect(),
                None => BTreeMap::new(),
            },
        }
    }

    /// Write a freshly reduced 1× row back into its base tier so later
    /// cascade stages can read it. Years are terminal and never cached.
    pub fn store(&mut self, tier: PeriodUnit, row: ReducedRow) {
        match tier {
            PeriodUnit::Minute => {
                let start = row.start;
                self.minutes.entry(start).or_default().reduced = Some(row);
            }
            PeriodUnit::Hour => {
                self.hours.insert(row.start, row);
            }
            PeriodUnit::Day => {
                self.days.insert(row.start, row);
            }
            PeriodUnit::Month => {
                self.months.insert(row.start, row);
            }
            PeriodUnit::Year => {
                debug!(start = %row.start, "year rows are not cached");
            }
        }
    }

    /// Drop entries older than each tier's retention floor at `now` and
    /// advance `earliest` to the minute floor when that is newer.
    pub fn evict(&mut self, now: DateTime<Utc>) -> EvictionStats {
        fn drop_before<V>(map: &mut BTreeMap<DateTime<Utc>, V>, floor: DateTime<Utc>) -> usize {
            let kept = map.split_off(&floor);
            let dropped = map.len();
            *map = kept;
            dropped
        }

        let minute_floor = retention_floor(PeriodUnit::Minute, now);
        let stats = EvictionStats {
            minutes: drop_before(&mut self.minutes, minute_floor),
            hours: drop_before(&mut self.hours, retention_floor(PeriodUnit::Hour, now)),
            days: drop_before(&mut self.days, retention_floor(PeriodUnit::Day, now)),
            months: drop_before(&mut self.months, retention_floor(PeriodUnit::Month, now)),
        };

        if minute_floor > self.earliest {
            self.earliest = minute_floor;
        }
        stats
    }

    pub fn minute(&self, start: DateTime<Utc>) -> Option<&MinuteWindow> {
        self.minutes.get(&start)
    }

    pub fn len(&self, tier: PeriodUnit) -> usize {
        match tier {
            PeriodUnit::Minute => self.minutes.len(),
            _ => self.tier(tier).map_or(0, BTreeMap::len),
        }
    }

    fn tier(&self, tier: PeriodUnit) -> Option<&BTreeMap<DateTime<Utc>, ReducedRow>> {
        match tier {
            PeriodUnit::Hour => Some(&self.hours),
            PeriodUnit::Day => Some(&self.days),
            PeriodUnit::Month => Some(&self.months),
            PeriodUnit::Minute | PeriodUnit::Year => None,
        }
    }
}
