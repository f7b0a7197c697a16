// =============================================================================
// OHLCV Reducer — folds trades or sub-window rows into one summary row
// =============================================================================
//
// Two entry points share one fold:
//   - `reduce_trades` for formatted raw trades of a minute window. Dust on
//     the native leg is dropped first.
//   - `reduce_rows` for already-reduced rows of a finer tier. Those rows
//     passed the dust filter once and are never filtered again.
//
// Inputs are keyed maps iterated in key order, so the first retained row
// seeding the accumulator is deterministic.
// =============================================================================

use rust_decimal::Decimal;

use crate::types::{ReducedRow, TradingPair};

/// Drops rounding-artifact trades whose native-asset leg is too small.
#[derive(Debug, Clone, PartialEq)]
pub struct DustFilter {
    base_is_native: bool,
    counter_is_native: bool,
    threshold: Decimal,
}

impl DustFilter {
    pub fn new(pair: &TradingPair, native_currency: &str, threshold: Decimal) -> Self {
        Self {
            base_is_native: pair.base.currency == native_currency && pair.base.issuer.is_none(),
            counter_is_native: pair.counter.currency == native_currency
                && pair.counter.issuer.is_none(),
            threshold,
        }
    }

    /// Filter that never drops anything (pairs without a native leg).
    pub fn disabled() -> Self {
        Self {
            base_is_native: false,
            counter_is_native: false,
            threshold: Decimal::ZERO,
        }
    }

    pub fn is_dust(&self, row: &ReducedRow) -> bool {
        (self.base_is_native && row.base_volume <= self.threshold)
            || (self.counter_is_native && row.counter_volume <= self.threshold)
    }
}

/// Reduce the formatted trades of one minute window.
///
/// Returns `None` when every trade was dust or the fold has no base volume.
pub fn reduce_trades<'a, I>(trades: I, dust: &DustFilter) -> Option<ReducedRow>
where
    I: IntoIterator<Item = &'a ReducedRow>,
{
    fold_rows(trades.into_iter().filter(|row| !dust.is_dust(row)))
}

/// Reduce already-reduced rows of a finer tier into one coarser row.
pub fn reduce_rows<'a, I>(rows: I) -> Option<ReducedRow>
where
    I: IntoIterator<Item = &'a ReducedRow>,
{
    fold_rows(rows.into_iter())
}

fn fold_rows<'a>(mut rows: impl Iterator<Item = &'a ReducedRow>) -> Option<ReducedRow> {
    let mut reduced = rows.next()?.clone();

    for row in rows {
        merge_open_close(&mut reduced, row);

        if row.high > reduced.high {
            reduced.high = row.high;
        }
        if row.low < reduced.low {
            reduced.low = row.low;
        }

        reduced.base_volume += row.base_volume;
        reduced.counter_volume += row.counter_volume;
        reduced.count += row.count;
    }

    if reduced.base_volume <= Decimal::ZERO {
        return None;
    }
    reduced.vwap = reduced.counter_volume.checked_div(reduced.base_volume)?;
    Some(reduced)
}

/// Sort keys decide open/close when both sides carry them; rows read back
/// without sort keys fall back to their open/close times.
fn merge_open_close(reduced: &mut ReducedRow, row: &ReducedRow) {
    match (
        &reduced.sort_open,
        &reduced.sort_close,
        &row.sort_open,
        &row.sort_close,
    ) {
        (Some(acc_open), Some(acc_close), Some(open), Some(close)) => {
            if open < acc_open {
                reduced.sort_open = Some(open.clone());
                reduced.open_time = row.open_time;
                reduced.open = row.open;
            }
            if close > acc_close {
                reduced.sort_close = Some(close.clone());
                reduced.close_time = row.close_time;
                reduced.close = row.close;
            }
        }
        _ => {
            if row.open_time < reduced.open_time {
                reduced.open_time = row.open_time;
                reduced.open = row.open;
                reduced.sort_open = row.sort_open.clone();
            }
            if row.close_time > reduced.close_time {
                reduced.close_time = row.close_time;
                reduced.close = row.close;
                reduced.sort_close = row.sort_close.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Currency, ExchangeEvent};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn minute() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 6, 1, 12, 30, 0).unwrap()
    }

    fn trade(ledger: u64, secs: i64, base: Decimal, rate: Decimal) -> ReducedRow {
        let ev = ExchangeEvent::from_ledger(
            &format!("TX{ledger}"),
            ledger,
            0,
            0,
            minute() + TimeDelta::seconds(secs),
            base,
            base * rate,
            rate,
        );
        ReducedRow::from_trade(&ev, minute())
    }

    fn xrp_usd() -> TradingPair {
        TradingPair::new(Currency::native("XRP"), Currency::issued("USD", "rGate"))
    }

    #[test]
    fn sort_key_order_decides_open_and_close() {
        // Same timestamp; ledger order is 2, 1, 3 in insertion order.
        let trades = [
            trade(2, 10, dec!(10), dec!(1.0)),
            trade(1, 10, dec!(10), dec!(1.2)),
            trade(3, 10, dec!(10), dec!(0.9)),
        ];
        let row = reduce_trades(&trades, &DustFilter::disabled()).unwrap();
        assert_eq!(row.open, dec!(1.2));
        assert_eq!(row.close, dec!(0.9));
        assert_eq!(row.high, dec!(1.2));
        assert_eq!(row.low, dec!(0.9));
        assert_eq!(row.count, 3);
    }

    #[test]
    fn bounds_and_sums_hold() {
        let trades = [
            trade(5, 1, dec!(3), dec!(2.0)),
            trade(6, 2, dec!(4), dec!(2.5)),
            trade(7, 3, dec!(5), dec!(1.5)),
        ];
        let row = reduce_trades(&trades, &DustFilter::disabled()).unwrap();
        assert!(row.low <= row.open && row.open <= row.high);
        assert!(row.low <= row.close && row.close <= row.high);
        assert_eq!(row.base_volume, dec!(12));
        assert_eq!(row.counter_volume, dec!(6) + dec!(10) + dec!(7.5));
        assert_eq!(row.vwap, row.counter_volume / row.base_volume);
    }

    #[test]
    fn dust_on_native_leg_is_dropped_from_trades_only() {
        let dust = DustFilter::new(&xrp_usd(), "XRP", dec!(0.0001));
        let tiny = trade(1, 0, dec!(0.00005), dec!(0.02));
        let real = trade(2, 5, dec!(100), dec!(0.01));

        let row = reduce_trades([&tiny, &real], &dust).unwrap();
        assert_eq!(row.count, 1);
        assert_eq!(row.open, dec!(0.01));

        assert!(reduce_trades([&tiny], &dust).is_none());
        // The same row arriving as an already-reduced input is kept.
        let coarse = reduce_rows([&tiny]).unwrap();
        assert_eq!(coarse.base_volume, dec!(0.00005));
    }

    #[test]
    fn dust_applies_to_counter_leg_when_counter_is_native() {
        let pair = TradingPair::new(Currency::issued("USD", "rGate"), Currency::native("XRP"));
        let dust = DustFilter::new(&pair, "XRP", dec!(0.0001));
        let mut row = trade(1, 0, dec!(1), dec!(0.00005));
        row.counter_volume = dec!(0.00005);
        assert!(dust.is_dust(&row));
        row.counter_volume = dec!(0.01);
        assert!(!dust.is_dust(&row));
    }

    #[test]
    fn zero_base_volume_yields_no_row() {
        let row = trade(1, 0, dec!(0), dec!(1));
        assert!(reduce_rows([&row]).is_none());
    }

    #[test]
    fn reducing_own_output_is_idempotent() {
        let trades = [trade(2, 0, dec!(3), dec!(1.1)), trade(4, 9, dec!(7), dec!(0.7))];
        let row = reduce_trades(&trades, &DustFilter::disabled()).unwrap();
        assert_eq!(reduce_rows([&row]).unwrap(), row);

        // Keyed input: re-inserting the same window replaces it.
        let mut keyed = BTreeMap::new();
        keyed.insert(row.start, row.clone());
        keyed.insert(row.start, row.clone());
        assert_eq!(reduce_rows(keyed.values()).unwrap(), row);
    }

    #[test]
    fn rows_missing_sort_keys_fall_back_to_times() {
        let keyed = trade(5, 20, dec!(10), dec!(1.0));
        let mut legacy = trade(9, 0, dec!(10), dec!(2.0));
        legacy.sort_open = None;
        legacy.sort_close = None;
        legacy.open_time = minute() + TimeDelta::seconds(5);
        legacy.close_time = minute() + TimeDelta::seconds(50);

        // Keyed row first: the legacy row wins both ends on time alone,
        // although its ledger position is later.
        let row = reduce_rows([&keyed, &legacy]).unwrap();
        assert_eq!(row.open, dec!(2.0));
        assert_eq!(row.close, dec!(2.0));
        assert_eq!(row.sort_open, None);
        assert_eq!(row.sort_close, None);
        assert_eq!(row.count, 2);

        // Legacy row first: a later keyed close replaces it and brings its key.
        legacy.close_time = minute() + TimeDelta::seconds(10);
        let row = reduce_rows([&legacy, &keyed]).unwrap();
        assert_eq!(row.open, dec!(2.0));
        assert_eq!(row.close, dec!(1.0));
        assert_eq!(row.sort_open, None);
        assert_eq!(row.sort_close, keyed.sort_close);
    }

    #[test]
    fn coarse_rows_without_sort_keys_use_times() {
        let hour = |h: i64, open: Decimal, close: Decimal, high: Decimal, low: Decimal| {
            let start = minute() + TimeDelta::hours(h);
            ReducedRow {
                start,
                open_time: start + TimeDelta::minutes(1),
                close_time: start + TimeDelta::minutes(58),
                open,
                close,
                high,
                low,
                base_volume: dec!(10),
                counter_volume: dec!(10),
                count: 2,
                vwap: dec!(1),
                sort_open: None,
                sort_close: None,
            }
        };
        let mut rows = BTreeMap::new();
        for row in [
            hour(2, dec!(1.3), dec!(1.1), dec!(1.5), dec!(1.0)),
            hour(0, dec!(1.0), dec!(1.2), dec!(1.2), dec!(0.95)),
            hour(3, dec!(1.1), dec!(0.8), dec!(1.15), dec!(0.7)),
            hour(1, dec!(1.2), dec!(1.3), dec!(1.4), dec!(1.1)),
        ] {
            rows.insert(row.start, row);
        }

        let two_hour = reduce_rows(rows.values()).unwrap();
        assert_eq!(two_hour.open, dec!(1.0));
        assert_eq!(two_hour.close, dec!(0.8));
        assert_eq!(two_hour.high, dec!(1.5));
        assert_eq!(two_hour.low, dec!(0.7));
        assert_eq!(two_hour.count, 8);
        assert_eq!(two_hour.start, minute());
    }
}
