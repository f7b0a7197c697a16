// =============================================================================
// Aggregator Configuration — JSON file with env overrides and atomic save
// =============================================================================
//
// Every field carries `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. Persistence uses an atomic tmp +
// rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::reducer::DustFilter;
use crate::types::{Currency, TradingPair};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_pair() -> TradingPair {
    TradingPair::new(
        Currency::native("XRP"),
        Currency::issued("USD", "rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B"),
    )
}

fn default_native_currency() -> String {
    "XRP".to_string()
}

fn default_dust_threshold() -> Decimal {
    Decimal::new(1, 4)
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_purge_interval_secs() -> u64 {
    60 * 60
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("aggregator_snapshot.json")
}

// =============================================================================
// AggregatorConfig
// =============================================================================

/// Settings for one aggregation engine instance (one trading pair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Pair this instance aggregates.
    #[serde(default = "default_pair")]
    pub pair: TradingPair,

    /// Currency code of the chain-native asset, used by the dust filter.
    #[serde(default = "default_native_currency")]
    pub native_currency: String,

    /// Trades whose native leg is at or below this amount are dropped.
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: Decimal,

    /// Delay before re-checking an empty queue or a closed gate.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Period of the cache purge timer.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Where the binary keeps its storage snapshot between runs.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            pair: default_pair(),
            native_currency: default_native_currency(),
            dust_threshold: default_dust_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            purge_interval_secs: default_purge_interval_secs(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read aggregator config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse aggregator config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pair = %config.pair,
            "aggregator config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise aggregator config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "aggregator config saved (atomic)");
        Ok(())
    }

    /// Apply `EXAGG_BASE` / `EXAGG_COUNTER` overrides (`CUR` or `CUR.issuer`).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, leg) in [
            ("EXAGG_BASE", &mut self.pair.base),
            ("EXAGG_COUNTER", &mut self.pair.counter),
        ] {
            let Some(value) = lookup(var) else { continue };
            match Currency::parse(&value) {
                Some(currency) => *leg = currency,
                None => warn!(var, value = %value, "ignoring malformed currency override"),
            }
        }
    }

    pub fn dust_filter(&self) -> DustFilter {
        DustFilter::new(&self.pair, &self.native_currency, self.dust_threshold)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AggregatorConfig::default();
        assert_eq!(cfg.pair.base, Currency::native("XRP"));
        assert_eq!(cfg.native_currency, "XRP");
        assert_eq!(cfg.dust_threshold, dec!(0.0001));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(200));
        assert_eq!(cfg.purge_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AggregatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, AggregatorConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "pair": { "base": { "currency": "USD", "issuer": "rA" }, "counter": { "currency": "XRP" } }, "poll_interval_ms": 50 }"#;
        let cfg: AggregatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.pair.counter, Currency::native("XRP"));
        assert_eq!(cfg.poll_interval_ms, 50);
        assert_eq!(cfg.purge_interval_secs, 3600);
    }

    #[test]
    fn env_overrides_replace_pair_legs() {
        let mut cfg = AggregatorConfig::default();
        cfg.apply_overrides(|var| match var {
            "EXAGG_BASE" => Some("eur.rIssuer".to_string()),
            "EXAGG_COUNTER" => Some(".".to_string()),
            _ => None,
        });
        assert_eq!(cfg.pair.base, Currency::issued("EUR", "rIssuer"));
        assert_eq!(cfg.pair.counter, default_pair().counter);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("exagg-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = AggregatorConfig::default();
        cfg.native_currency = "ETH".to_string();
        cfg.save(&path).unwrap();
        assert_eq!(AggregatorConfig::load(&path).unwrap(), cfg);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
