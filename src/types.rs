// =============================================================================
// Shared types used across the exchange aggregator
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Zero-padding width for the ledger index part of a [`SortKey`].
const LEDGER_INDEX_PAD: usize = 12;
/// Zero-padding width for the tx and node index parts of a [`SortKey`].
const INDEX_PAD: usize = 5;

/// One leg of a trading pair. The chain-native asset has no issuer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

impl Currency {
    pub fn native(code: impl Into<String>) -> Self {
        Self {
            currency: code.into(),
            issuer: None,
        }
    }

    pub fn issued(code: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            currency: code.into(),
            issuer: Some(issuer.into()),
        }
    }

    /// Parse `CUR` or `CUR.issuer`.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.split_once('.') {
            Some((code, issuer)) if !code.is_empty() && !issuer.is_empty() => {
                Some(Self::issued(code.to_uppercase(), issuer))
            }
            Some(_) => None,
            None => Some(Self::native(spec.to_uppercase())),
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.issuer {
            Some(issuer) => write!(f, "{}.{}", self.currency, issuer),
            None => write!(f, "{}", self.currency),
        }
    }
}

/// The pair an engine instance aggregates. One engine per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: Currency,
    pub counter: Currency,
}

impl TradingPair {
    pub fn new(base: Currency, counter: Currency) -> Self {
        Self { base, counter }
    }

    /// Pair identifier used as the prefix of every persisted row key.
    pub fn key_base(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.base.currency,
            self.base.issuer.as_deref().unwrap_or(""),
            self.counter.currency,
            self.counter.issuer.as_deref().unwrap_or(""),
        )
    }

    /// Full row key for a window start: `pair|YYYYMMDDHHmmss`.
    pub fn row_key(&self, start: DateTime<Utc>) -> String {
        format!("{}|{}", self.key_base(), start.format("%Y%m%d%H%M%S"))
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.counter)
    }
}

/// Lexicographically sortable position of a trade in the ledger history:
/// ledger index, transaction index, node index, zero-padded.
///
/// This order, not the wall-clock timestamp, decides which trade of a window
/// is first or last.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey(String);

impl SortKey {
    pub fn new(ledger_index: u64, tx_index: u32, node_index: u32) -> Self {
        Self(format!(
            "{:0lw$}|{:0iw$}|{:0iw$}",
            ledger_index,
            tx_index,
            node_index,
            lw = LEDGER_INDEX_PAD,
            iw = INDEX_PAD,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A matched trade extracted from ledger data by the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEvent {
    /// Unique per trade (`tx_hash|node_index`).
    pub trade_key: String,
    pub timestamp: DateTime<Utc>,
    pub base_amount: Decimal,
    pub counter_amount: Decimal,
    pub rate: Decimal,
    pub sort_key: SortKey,
}

impl ExchangeEvent {
    /// Build an event from the coordinates the ledger decoder reports.
    #[allow(clippy::too_many_arguments)]
    pub fn from_ledger(
        tx_hash: &str,
        ledger_index: u64,
        tx_index: u32,
        node_index: u32,
        timestamp: DateTime<Utc>,
        base_amount: Decimal,
        counter_amount: Decimal,
        rate: Decimal,
    ) -> Self {
        Self {
            trade_key: format!("{tx_hash}|{node_index}"),
            timestamp,
            base_amount,
            counter_amount,
            rate,
            sort_key: SortKey::new(ledger_index, tx_index, node_index),
        }
    }
}

/// One OHLCV summary row. Also used for a single formatted trade before
/// reduction (count = 1, all prices equal to the rate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedRow {
    /// Start of the window this row summarises.
    pub start: DateTime<Utc>,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub base_volume: Decimal,
    pub counter_volume: Decimal,
    pub count: u64,
    /// `counter_volume / base_volume`.
    pub vwap: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_open: Option<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_close: Option<SortKey>,
}

impl ReducedRow {
    /// Format a raw trade as a single-trade row anchored at `window_start`.
    pub fn from_trade(event: &ExchangeEvent, window_start: DateTime<Utc>) -> Self {
        Self {
            start: window_start,
            open_time: event.timestamp,
            close_time: event.timestamp,
            open: event.rate,
            close: event.rate,
            high: event.rate,
            low: event.rate,
            base_volume: event.base_amount,
            counter_volume: event.counter_amount,
            count: 1,
            vwap: event.rate,
            sort_open: Some(event.sort_key.clone()),
            sort_close: Some(event.sort_key.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn sort_key_is_fixed_width_and_ordered() {
        let a = SortKey::new(9_999, 3, 12);
        let b = SortKey::new(10_000, 0, 0);
        assert_eq!(a.as_str(), "000000009999|00003|00012");
        assert!(a < b);
        assert!(SortKey::new(10_000, 0, 2) < SortKey::new(10_000, 1, 0));
    }

    #[test]
    fn row_key_uses_pair_and_compact_timestamp() {
        let pair = TradingPair::new(
            Currency::native("XRP"),
            Currency::issued("USD", "rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B"),
        );
        let start = Utc.with_ymd_and_hms(2015, 4, 10, 13, 12, 0).unwrap();
        assert_eq!(
            pair.row_key(start),
            "XRP||USD|rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B|20150410131200"
        );
    }

    #[test]
    fn currency_parse_handles_native_and_issued() {
        assert_eq!(Currency::parse("xrp"), Some(Currency::native("XRP")));
        assert_eq!(
            Currency::parse("USD.rIssuer"),
            Some(Currency::issued("USD", "rIssuer"))
        );
        assert_eq!(Currency::parse(""), None);
        assert_eq!(Currency::parse("USD."), None);
    }

    #[test]
    fn formatted_trade_is_single_count_row() {
        let ts = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 30).unwrap();
        let ev = ExchangeEvent::from_ledger("ABC", 1, 2, 3, ts, dec!(10), dec!(25), dec!(2.5));
        assert_eq!(ev.trade_key, "ABC|3");
        let row = ReducedRow::from_trade(&ev, ts);
        assert_eq!(row.count, 1);
        assert_eq!(row.open, dec!(2.5));
        assert_eq!(row.low, row.high);
        assert_eq!(row.sort_open, Some(SortKey::new(1, 2, 3)));
    }
}
