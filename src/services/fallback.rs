//! Synthetic market data for when every real path is down.
//!
//! Consumers receive clearly labeled `DataSource::Fallback` snapshots rather
//! than an opaque failure, so dashboards can degrade gracefully. The walk is
//! a small bounded random step around a per-symbol baseline.

use dashmap::DashMap;
use rand::Rng;

use crate::types::{DataSource, MarketData};

/// Maximum single step, as a fraction of the current price.
const MAX_STEP: f64 = 0.003;

/// Baseline prices for well-known symbols; anything else starts at 100.
const BASELINES: &[(&str, f64)] = &[
    ("BTCUSDT", 50_000.0),
    ("ETHUSDT", 3_000.0),
    ("SOLUSDT", 150.0),
    ("XRPUSDT", 0.60),
    ("DOGEUSDT", 0.15),
    ("ADAUSDT", 0.45),
    ("AVAXUSDT", 30.0),
    ("DOTUSDT", 6.0),
    ("LINKUSDT", 15.0),
    ("LTCUSDT", 80.0),
];

struct WalkState {
    open: f64,
    price: f64,
    high: f64,
    low: f64,
}

/// Last-resort synthetic price feed.
pub struct FallbackFeed {
    state: DashMap<String, WalkState>,
}

impl FallbackFeed {
    pub fn new() -> Self {
        Self {
            state: DashMap::new(),
        }
    }

    /// Produce the next synthetic snapshot for a symbol.
    pub fn next(&self, symbol: &str) -> MarketData {
        let mut entry = self.state.entry(symbol.to_string()).or_insert_with(|| {
            let baseline = baseline_price(symbol);
            WalkState {
                open: baseline,
                price: baseline,
                high: baseline,
                low: baseline,
            }
        });

        let step = rand::thread_rng().gen_range(-MAX_STEP..=MAX_STEP);
        entry.price *= 1.0 + step;
        entry.high = entry.high.max(entry.price);
        entry.low = entry.low.min(entry.price);

        MarketData::new(
            symbol.to_string(),
            entry.price,
            entry.open,
            entry.high,
            entry.low,
            0.0,
            None,
            DataSource::Fallback,
        )
    }
}

impl Default for FallbackFeed {
    fn default() -> Self {
        Self::new()
    }
}

fn baseline_price(symbol: &str) -> f64 {
    BASELINES
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, p)| *p)
        .unwrap_or(100.0)
}
