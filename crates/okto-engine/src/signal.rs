//! Entry-signal evaluation.
//!
//! An entry requires, in order: remaining capacity above the minimum, the
//! safety-line check for the direction, and the candlestick filters. Both
//! directions are evaluated in one pass when the configured direction is
//! `both`.

use crate::candles::evaluate_candle_conditions;
use crate::capital::CapitalSnapshot;
use crate::config::{CapitalConfig, EntryConfig};
use okto_core::{PosSide, Price, TradeDirection};
use okto_rest::Candle;
use rust_decimal::Decimal;
use tracing::info;

/// One accepted entry signal.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub side: PosSide,
    /// +1 long, -1 short.
    pub signal: i8,
    /// First batch member's limit price.
    pub limit_price: Price,
}

/// Evaluate entry conditions against the latest price.
pub fn check_entry_conditions(
    entry: &EntryConfig,
    capital: &CapitalConfig,
    direction: TradeDirection,
    market: Price,
    snapshot: &CapitalSnapshot,
    candle: Option<&Candle>,
) -> Vec<EntrySignal> {
    if snapshot.remaining_notional < capital.min_order_amount {
        info!(
            remaining = %snapshot.remaining_notional,
            min = %capital.min_order_amount,
            "entry capacity check: not passed"
        );
        return Vec::new();
    }

    let (candles_passed, candle_status) = evaluate_candle_conditions(&entry.candles, candle);

    let mut signals = Vec::new();
    for side in direction.sides() {
        let (passed, safety_line) = match side {
            PosSide::Long => {
                let line = entry.long_safety_line_price;
                (line.is_some_and(|l| market.inner() < l), line)
            }
            PosSide::Short => {
                let line = entry.short_safety_line_price;
                (line.is_some_and(|l| market.inner() > l), line)
            }
        };
        info!(
            side = %side,
            market = %market,
            safety = ?safety_line,
            passed,
            "entry safety-line check"
        );
        if !passed {
            continue;
        }
        if !candles_passed {
            info!(side = %side, status = %candle_status, "entry candle check: not passed");
            continue;
        }

        let signal = side.sign();
        let offset = entry.entry_price_offset * Decimal::from(signal);
        signals.push(EntrySignal {
            side: *side,
            signal,
            limit_price: market.offset_by(-offset),
        });
    }

    if !signals.is_empty() {
        info!(
            remaining = %snapshot.remaining_notional,
            target = %capital.target_order_amount,
            status = %candle_status,
            "entry checks passed"
        );
    }
    signals
}

/// Limit price for batch member `index`, staggered away from the first
/// member's price in the entry direction.
pub fn batch_limit_price(
    initial: Price,
    signal: i8,
    index: u32,
    batch_offset: Decimal,
) -> Price {
    if index == 0 {
        return initial;
    }
    let step = batch_offset * Decimal::from(index) * Decimal::from(signal);
    initial.offset_by(-step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot_with_remaining(remaining: Decimal) -> CapitalSnapshot {
        CapitalSnapshot {
            remaining_notional: remaining,
            ..Default::default()
        }
    }

    fn entry_config() -> EntryConfig {
        EntryConfig {
            entry_price_offset: dec!(2),
            long_safety_line_price: Some(dec!(3000)),
            short_safety_line_price: Some(dec!(3100)),
            ..Default::default()
        }
    }

    #[test]
    fn test_long_entry_offset_below_market() {
        // market 2980, offset 2 -> limit 2978
        let signals = check_entry_conditions(
            &entry_config(),
            &CapitalConfig::default(),
            TradeDirection::Long,
            Price::new(dec!(2980)),
            &snapshot_with_remaining(dec!(5000)),
            None,
        );
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, PosSide::Long);
        assert_eq!(signals[0].limit_price.inner(), dec!(2978));
    }

    #[test]
    fn test_short_entry_offset_above_market() {
        let signals = check_entry_conditions(
            &entry_config(),
            &CapitalConfig::default(),
            TradeDirection::Short,
            Price::new(dec!(3150)),
            &snapshot_with_remaining(dec!(5000)),
            None,
        );
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal, -1);
        assert_eq!(signals[0].limit_price.inner(), dec!(3152));
    }

    #[test]
    fn test_safety_lines_gate_each_side() {
        // Market above the long line: no long entry.
        let signals = check_entry_conditions(
            &entry_config(),
            &CapitalConfig::default(),
            TradeDirection::Long,
            Price::new(dec!(3050)),
            &snapshot_with_remaining(dec!(5000)),
            None,
        );
        assert!(signals.is_empty());

        // Direction both at 3050: long fails (>= 3000), short fails (< 3100).
        let signals = check_entry_conditions(
            &entry_config(),
            &CapitalConfig::default(),
            TradeDirection::Both,
            Price::new(dec!(3050)),
            &snapshot_with_remaining(dec!(5000)),
            None,
        );
        assert!(signals.is_empty());

        // At 2990 only the long side passes under direction both.
        let signals = check_entry_conditions(
            &entry_config(),
            &CapitalConfig::default(),
            TradeDirection::Both,
            Price::new(dec!(2990)),
            &snapshot_with_remaining(dec!(5000)),
            None,
        );
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, PosSide::Long);
    }

    #[test]
    fn test_unset_safety_line_disables_side() {
        let config = EntryConfig {
            long_safety_line_price: None,
            short_safety_line_price: None,
            ..entry_config()
        };
        let signals = check_entry_conditions(
            &config,
            &CapitalConfig::default(),
            TradeDirection::Both,
            Price::new(dec!(2980)),
            &snapshot_with_remaining(dec!(5000)),
            None,
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn test_capacity_below_minimum_blocks_entries() {
        let signals = check_entry_conditions(
            &entry_config(),
            &CapitalConfig::default(),
            TradeDirection::Long,
            Price::new(dec!(2980)),
            &snapshot_with_remaining(dec!(50)),
            None,
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn test_batch_limit_prices() {
        // Long: member 1 at batch_offset 5 sits 5 below the initial 2978.
        let initial = Price::new(dec!(2978));
        assert_eq!(batch_limit_price(initial, 1, 0, dec!(5)), initial);
        assert_eq!(
            batch_limit_price(initial, 1, 1, dec!(5)).inner(),
            dec!(2973)
        );
        assert_eq!(
            batch_limit_price(initial, 1, 2, dec!(5)).inner(),
            dec!(2968)
        );
        // Short: staggered upward.
        assert_eq!(
            batch_limit_price(Price::new(dec!(3010)), -1, 1, dec!(5)).inner(),
            dec!(3015)
        );
    }
}
