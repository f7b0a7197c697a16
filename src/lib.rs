// =============================================================================
// Exchange Aggregator — OHLCV cascade over a stream of ledger trades
// =============================================================================
//
// One `AggregationEngine` per trading pair turns matched-trade events into
// twelve resolutions of OHLCV rows (1 minute .. 1 year) and hands every
// changed row to a `StorageGateway`.
// =============================================================================

pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod reducer;
pub mod storage;
pub mod types;
pub mod window_cache;

pub use bucket::{PeriodUnit, Resolution, OUTPUT_RESOLUTIONS};
pub use config::AggregatorConfig;
pub use engine::{AggregationEngine, Completion, CycleSummary};
pub use error::{AggregatorError, AggregatorResult, StorageError};
pub use storage::{HistoryQuery, HistoryRows, MemoryStore, StorageGateway};
pub use types::{Currency, ExchangeEvent, ReducedRow, SortKey, TradingPair};
