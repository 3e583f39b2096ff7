//! Candle history store and candlestick entry filters.
//!
//! The supervisor backfills ~300 bars of the configured timeframe at
//! startup (paginated, newest-first pages) and the entry evaluator applies
//! range filters to the latest bar. No data defaults to pass so a candle
//! outage never blocks trading by itself.

use crate::config::CandleConditionConfig;
use okto_rest::Candle;
use rust_decimal::Decimal;

/// Bars to backfill at startup.
pub const BACKFILL_BARS: usize = 300;
/// Page size the history endpoint allows.
pub const BACKFILL_PAGE_LIMIT: u32 = 100;

/// Map a config timeframe to the exchange bar code.
pub fn okx_bar_code(timeframe: &str) -> Option<&'static str> {
    Some(match timeframe {
        "1m" => "1m",
        "3m" => "3m",
        "5m" => "5m",
        "15m" => "15m",
        "30m" => "30m",
        "1h" => "1H",
        "2h" => "2H",
        "4h" => "4H",
        "6h" => "6H",
        "8h" => "8H",
        "12h" => "12H",
        "1d" => "1D",
        "1w" => "1W",
        "1M" => "1M",
        _ => return None,
    })
}

/// Timeframe length in seconds.
pub fn bar_seconds(timeframe: &str) -> Option<u64> {
    Some(match timeframe {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1800,
        "1h" => 3600,
        "2h" => 7200,
        "4h" => 14400,
        "6h" => 21600,
        "8h" => 28800,
        "12h" => 43200,
        "1d" => 86400,
        "1w" => 604800,
        "1M" => 2592000,
        _ => return None,
    })
}

/// In-memory bar history for one timeframe, oldest first.
#[derive(Debug, Default)]
pub struct CandleStore {
    pub timeframe: String,
    bars: Vec<Candle>,
}

impl CandleStore {
    pub fn new(timeframe: impl Into<String>) -> Self {
        Self {
            timeframe: timeframe.into(),
            bars: Vec::new(),
        }
    }

    /// Merge a batch of bars (any order), deduplicating by timestamp and
    /// dropping rows with inverted ranges.
    pub fn merge(&mut self, batch: Vec<Candle>) {
        for candle in batch {
            if candle.low > candle.high {
                continue;
            }
            match self.bars.binary_search_by_key(&candle.ts_ms, |c| c.ts_ms) {
                Ok(pos) => self.bars[pos] = candle,
                Err(pos) => self.bars.insert(pos, candle),
            }
        }
        // Bound memory: keep the most recent window only.
        if self.bars.len() > BACKFILL_BARS * 2 {
            let excess = self.bars.len() - BACKFILL_BARS;
            self.bars.drain(..excess);
        }
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.bars.last()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }
}

/// Evaluate the configured candlestick range filters against a bar.
///
/// Returns the overall verdict plus a status string for the entry log.
/// With no bar available the filters pass by default.
pub fn evaluate_candle_conditions(
    config: &CandleConditionConfig,
    candle: Option<&Candle>,
) -> (bool, String) {
    if !config.enabled {
        return (true, "skipped".to_string());
    }
    let Some(candle) = candle else {
        return (true, "no data (default pass)".to_string());
    };

    let mut parts = Vec::new();
    let mut all_passed = true;

    let mut check = |label: &str, used: bool, value: Decimal, min: Decimal, max: Decimal| {
        if !used {
            return;
        }
        let passed = min <= value && value <= max;
        all_passed &= passed;
        parts.push(format!(
            "{label}={}",
            if passed { "passed" } else { "fail" }
        ));
    };

    check(
        "open-close",
        config.use_chg_open_close,
        (candle.open - candle.close).abs(),
        config.min_chg_open_close,
        config.max_chg_open_close,
    );
    check(
        "high-low",
        config.use_chg_high_low,
        candle.high - candle.low,
        config.min_chg_high_low,
        config.max_chg_high_low,
    );
    check(
        "high-close",
        config.use_chg_high_close,
        (candle.high - candle.close).abs(),
        config.min_chg_high_close,
        config.max_chg_high_close,
    );

    let status = if parts.is_empty() {
        "skipped".to_string()
    } else {
        parts.join("; ")
    };
    (all_passed, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(ts: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            ts_ms: ts,
            open,
            high,
            low,
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn test_store_merges_sorted_and_deduped() {
        let mut store = CandleStore::new("1m");
        store.merge(vec![
            candle(2000, dec!(10), dec!(12), dec!(9), dec!(11)),
            candle(1000, dec!(9), dec!(11), dec!(8), dec!(10)),
            // Duplicate timestamp replaces in place.
            candle(2000, dec!(10), dec!(13), dec!(9), dec!(12)),
            // Inverted range dropped.
            candle(3000, dec!(10), dec!(9), dec!(11), dec!(10)),
        ]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().unwrap().high, dec!(13));
    }

    #[test]
    fn test_bar_codes() {
        assert_eq!(okx_bar_code("1h"), Some("1H"));
        assert_eq!(okx_bar_code("1m"), Some("1m"));
        assert_eq!(okx_bar_code("7m"), None);
        assert_eq!(bar_seconds("5m"), Some(300));
    }

    #[test]
    fn test_conditions_pass_without_data() {
        let config = CandleConditionConfig {
            use_chg_open_close: true,
            max_chg_open_close: dec!(5),
            ..Default::default()
        };
        let (passed, status) = evaluate_candle_conditions(&config, None);
        assert!(passed);
        assert!(status.contains("no data"));
    }

    #[test]
    fn test_conditions_respect_bounds() {
        let config = CandleConditionConfig {
            use_chg_open_close: true,
            min_chg_open_close: dec!(1),
            max_chg_open_close: dec!(5),
            use_chg_high_low: true,
            min_chg_high_low: dec!(0),
            max_chg_high_low: dec!(10),
            ..Default::default()
        };
        // |open-close| = 3 in [1,5], high-low = 6 in [0,10]
        let bar = candle(1, dec!(100), dec!(104), dec!(98), dec!(103));
        let (passed, status) = evaluate_candle_conditions(&config, Some(&bar));
        assert!(passed);
        assert!(status.contains("open-close=passed"));

        // |open-close| = 8 outside [1,5]
        let bar = candle(2, dec!(100), dec!(109), dec!(98), dec!(108));
        let (passed, status) = evaluate_candle_conditions(&config, Some(&bar));
        assert!(!passed);
        assert!(status.contains("open-close=fail"));
    }

    #[test]
    fn test_conditions_disabled_skips() {
        let config = CandleConditionConfig {
            enabled: false,
            use_chg_open_close: true,
            ..Default::default()
        };
        let bar = candle(1, dec!(100), dec!(200), dec!(50), dec!(150));
        let (passed, status) = evaluate_candle_conditions(&config, Some(&bar));
        assert!(passed);
        assert_eq!(status, "skipped");
    }
}
