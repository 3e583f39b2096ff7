//! Capital accounting: notional capacity, fees, and automatic exit/add
//! decisions.
//!
//! Everything here is pure computation over exchange-sourced figures; the
//! supervisor recomputes a snapshot each sync cycle and acts on the rule
//! evaluations. Every profit/loss threshold is measured against the
//! round-trip fee (both legs), never the single-leg fee.

use crate::config::{AutoAddConfig, AutoExitConfig, CapitalConfig};
use okto_core::{PosSide, Price};
use rust_decimal::Decimal;
use std::fmt;

/// Raw inputs for one snapshot computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapitalInputs {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    /// Live position notional (positions only).
    pub position_notional: Decimal,
    /// Pending entry notional (session-scoped).
    pub pending_notional: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Derived capital snapshot. Recomputed each cycle, never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapitalSnapshot {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    /// Configured margin cap clamped to equity.
    pub max_allowed_margin: Decimal,
    /// Margin cap divided by the rate divisor.
    pub max_amount_margin: Decimal,
    /// Notional ceiling: `max_amount_margin * leverage`.
    pub max_notional_capacity: Decimal,
    /// Live positions + pending entries.
    pub used_notional: Decimal,
    /// Live positions only.
    pub position_notional: Decimal,
    /// Capacity minus used, floored at zero.
    pub remaining_notional: Decimal,
    /// Single-leg fee on the position notional.
    pub size_fee: Decimal,
    /// Entry + exit legs; basis for every profit-target comparison.
    pub round_trip_fee: Decimal,
    /// Display fee total over used + remaining notional.
    pub trade_fees: Decimal,
    /// Unrealized PnL of live positions.
    pub net_profit: Decimal,
    /// Whether the configured cap was clamped to equity.
    pub clamped: bool,
}

/// Compute a capital snapshot.
pub fn compute_snapshot(
    config: &CapitalConfig,
    leverage: u32,
    inputs: &CapitalInputs,
) -> CapitalSnapshot {
    let leverage = Decimal::from(leverage.max(1));
    let rate_divisor = if config.rate_divisor < Decimal::ONE {
        Decimal::ONE
    } else {
        config.rate_divisor
    };

    let mut max_allowed_margin = config.max_allowed_used;
    let mut clamped = false;
    if inputs.total_equity > Decimal::ZERO && config.max_allowed_used > inputs.total_equity {
        max_allowed_margin = inputs.total_equity;
        clamped = true;
    }

    let max_amount_margin = max_allowed_margin / rate_divisor;
    let max_notional_capacity = max_amount_margin * leverage;
    let used_notional = inputs.position_notional + inputs.pending_notional;
    let remaining_notional = (max_notional_capacity - used_notional).max(Decimal::ZERO);

    let fee_rate = config.trade_fee_percentage / Decimal::ONE_HUNDRED;
    let size_fee = inputs.position_notional * fee_rate;
    let trade_fees = used_notional * fee_rate + remaining_notional * fee_rate;

    CapitalSnapshot {
        total_equity: inputs.total_equity,
        available_balance: inputs.available_balance,
        max_allowed_margin,
        max_amount_margin,
        max_notional_capacity,
        used_notional,
        position_notional: inputs.position_notional,
        remaining_notional,
        size_fee,
        round_trip_fee: size_fee * Decimal::TWO,
        trade_fees,
        net_profit: inputs.unrealized_pnl,
        clamped,
    }
}

/// Logs the equity clamp exactly once per state transition, not per cycle.
#[derive(Debug, Default)]
pub struct ClampTracker {
    logged: bool,
}

impl ClampTracker {
    /// Returns true when this observation should be logged.
    pub fn observe(&mut self, clamped: bool) -> bool {
        if clamped && !self.logged {
            self.logged = true;
            true
        } else {
            if !clamped {
                self.logged = false;
            }
            false
        }
    }
}

/// The automatic exit rule that fired, with its threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutoExitRule {
    ManualProfit { threshold: Decimal },
    CalProfit { times: Decimal, threshold: Decimal },
    CalLoss { times: Decimal, threshold: Decimal },
    SizeProfit { times: Decimal, threshold: Decimal },
    SizeLoss { times: Decimal, threshold: Decimal },
    AddPositionTarget { times: Decimal, threshold: Decimal },
}

impl fmt::Display for AutoExitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManualProfit { threshold } => {
                write!(f, "manual profit target reached (>= {threshold})")
            }
            Self::CalProfit { times, threshold } => {
                write!(f, "calculated profit target reached ({times}x fee, >= {threshold})")
            }
            Self::CalLoss { times, threshold } => {
                write!(f, "calculated loss stop reached ({times}x fee, <= {threshold})")
            }
            Self::SizeProfit { times, threshold } => {
                write!(f, "size profit target reached ({times}x size fee, >= {threshold})")
            }
            Self::SizeLoss { times, threshold } => {
                write!(f, "size loss stop reached ({times}x size fee, <= {threshold})")
            }
            Self::AddPositionTarget { times, threshold } => {
                write!(f, "add-position profit target reached ({times}x fee, >= {threshold})")
            }
        }
    }
}

/// Evaluate the auto-exit rules against a snapshot.
///
/// Rules are checked in a fixed priority order and evaluation stops at the
/// first match; exits never layer. The fee-based thresholds all use the
/// round-trip fee.
pub fn evaluate_auto_exit(
    config: &AutoExitConfig,
    add_config: &AutoAddConfig,
    snapshot: &CapitalSnapshot,
) -> Option<AutoExitRule> {
    let net = snapshot.net_profit;
    let has_position = snapshot.position_notional > Decimal::ZERO;
    let fee_basis = snapshot.round_trip_fee;

    if config.use_pnl_auto_manual && net >= config.pnl_auto_manual_threshold {
        return Some(AutoExitRule::ManualProfit {
            threshold: config.pnl_auto_manual_threshold,
        });
    }
    if config.use_pnl_auto_cal && has_position {
        let threshold = config.pnl_auto_cal_times * fee_basis;
        if net >= threshold {
            return Some(AutoExitRule::CalProfit {
                times: config.pnl_auto_cal_times,
                threshold,
            });
        }
    }
    if config.use_pnl_auto_cal_loss && has_position {
        let threshold = -(fee_basis * config.pnl_auto_cal_loss_times);
        if net <= threshold {
            return Some(AutoExitRule::CalLoss {
                times: config.pnl_auto_cal_loss_times,
                threshold,
            });
        }
    }
    if config.use_size_auto_cal && has_position {
        let threshold = fee_basis * config.size_auto_cal_times;
        if net >= threshold {
            return Some(AutoExitRule::SizeProfit {
                times: config.size_auto_cal_times,
                threshold,
            });
        }
    }
    if config.use_size_auto_cal_loss && has_position {
        let threshold = -(fee_basis * config.size_auto_cal_loss_times);
        if net <= threshold {
            return Some(AutoExitRule::SizeLoss {
                times: config.size_auto_cal_loss_times,
                threshold,
            });
        }
    }
    if add_config.use_add_pos_profit_target && has_position {
        let threshold = fee_basis * add_config.add_pos_profit_multiplier;
        if net >= threshold {
            return Some(AutoExitRule::AddPositionTarget {
                times: add_config.add_pos_profit_multiplier,
                threshold,
            });
        }
    }

    None
}

/// Notional the averaging logic would need to add, per mode. Display
/// metrics as well as trigger inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AutoAddRequirement {
    /// Notional needed to pull PnL back above zero.
    pub need_above_zero: Decimal,
    /// Notional needed to reach the fee-multiple profit target.
    pub need_profit_target: Decimal,
}

/// Compute the averaging requirements. Zero while PnL is non-negative or
/// the recovery percent is unset.
pub fn auto_add_requirement(
    config: &AutoAddConfig,
    snapshot: &CapitalSnapshot,
) -> AutoAddRequirement {
    if snapshot.net_profit >= Decimal::ZERO || config.add_pos_recovery_percent <= Decimal::ZERO {
        return AutoAddRequirement::default();
    }
    let recovery = config.add_pos_recovery_percent / Decimal::ONE_HUNDRED;
    let loss = snapshot.net_profit.abs();
    let target_pnl = snapshot.round_trip_fee * config.add_pos_profit_multiplier;

    AutoAddRequirement {
        need_above_zero: loss / recovery,
        need_profit_target: (loss + target_pnl) / recovery,
    }
}

/// A concrete averaging order the supervisor should place.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoAddOrder {
    pub side: PosSide,
    pub notional: Decimal,
    pub margin_cost: Decimal,
}

/// Decide whether to add to a losing position.
///
/// Fires only when: a mode is enabled, PnL is negative, price has moved
/// against the entry by at least the configured gap (first vs subsequent
/// adds use distinct gaps), the add count is under its cap, and both the
/// secondary add budget and the primary remaining budget can absorb it.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_auto_add(
    config: &AutoAddConfig,
    snapshot: &CapitalSnapshot,
    side: PosSide,
    entry_price: Price,
    market_price: Price,
    leverage: u32,
    add_count: u32,
    add_used_notional: Decimal,
    min_order_amount: Decimal,
) -> Option<AutoAddOrder> {
    if !(config.use_add_pos_above_zero || config.use_add_pos_profit_target) {
        return None;
    }
    if snapshot.net_profit >= Decimal::ZERO || snapshot.position_notional <= Decimal::ZERO {
        return None;
    }
    if add_count >= config.max_add_count || entry_price.is_zero() {
        return None;
    }

    // Adverse move gate: distinct thresholds for the first and later adds.
    let gap_percent = if add_count == 0 {
        config.first_add_gap_percent
    } else {
        config.next_add_gap_percent
    };
    let adverse_move = match side {
        PosSide::Long => entry_price.inner() - market_price.inner(),
        PosSide::Short => market_price.inner() - entry_price.inner(),
    };
    let required_move = entry_price.inner() * gap_percent / Decimal::ONE_HUNDRED;
    if adverse_move < required_move {
        return None;
    }

    let size_percent = if add_count == 0 {
        config.first_add_size_percent
    } else {
        config.next_add_size_percent
    };
    let mut notional = snapshot.position_notional * size_percent / Decimal::ONE_HUNDRED;

    // Secondary budget, independent of the primary capital cap.
    let add_budget_left = (config.max_add_used - add_used_notional).max(Decimal::ZERO);
    notional = notional.min(add_budget_left);
    if notional < min_order_amount {
        return None;
    }

    let leverage = Decimal::from(leverage.max(1));
    let margin_cost = notional / leverage;
    if margin_cost > snapshot.remaining_notional {
        return None;
    }

    Some(AutoAddOrder {
        side,
        notional,
        margin_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoAddConfig, AutoExitConfig, CapitalConfig};
    use rust_decimal_macros::dec;

    fn capital_config() -> CapitalConfig {
        CapitalConfig {
            max_allowed_used: dec!(1000),
            rate_divisor: dec!(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_remaining_notional_formula() {
        // equity 1000, cap 1000, leverage 10, divisor 2, used 0
        // remaining = (1000/2)*10 - 0 = 5000
        let snapshot = compute_snapshot(
            &capital_config(),
            10,
            &CapitalInputs {
                total_equity: dec!(1000),
                ..Default::default()
            },
        );
        assert_eq!(snapshot.remaining_notional, dec!(5000));
        assert!(!snapshot.clamped);
    }

    #[test]
    fn test_remaining_notional_floors_at_zero() {
        let snapshot = compute_snapshot(
            &capital_config(),
            1,
            &CapitalInputs {
                total_equity: dec!(1000),
                position_notional: dec!(400),
                pending_notional: dec!(200),
                ..Default::default()
            },
        );
        // capacity (1000/2)*1 = 500, used 600
        assert_eq!(snapshot.used_notional, dec!(600));
        assert_eq!(snapshot.remaining_notional, Decimal::ZERO);
    }

    #[test]
    fn test_cap_clamps_to_equity_and_logs_once() {
        let config = CapitalConfig {
            max_allowed_used: dec!(1000),
            rate_divisor: Decimal::ONE,
            ..Default::default()
        };
        let snapshot = compute_snapshot(
            &config,
            1,
            &CapitalInputs {
                total_equity: dec!(500),
                ..Default::default()
            },
        );
        assert_eq!(snapshot.max_allowed_margin, dec!(500));
        assert!(snapshot.clamped);

        let mut tracker = ClampTracker::default();
        assert!(tracker.observe(true));
        // Identical subsequent cycles stay silent.
        assert!(!tracker.observe(true));
        assert!(!tracker.observe(true));
        // Recovery re-arms the log.
        assert!(!tracker.observe(false));
        assert!(tracker.observe(true));
    }

    #[test]
    fn test_auto_cal_exit_uses_round_trip_fee() {
        // notional 10000, fee 0.08%, times 4:
        // threshold = 4 * (10000 * 0.0008 * 2) = 64
        let config = CapitalConfig {
            trade_fee_percentage: dec!(0.08),
            ..Default::default()
        };
        let auto = AutoExitConfig {
            use_pnl_auto_cal: true,
            pnl_auto_cal_times: dec!(4),
            ..Default::default()
        };
        let add = AutoAddConfig::default();

        let mut inputs = CapitalInputs {
            total_equity: dec!(100000),
            position_notional: dec!(10000),
            unrealized_pnl: dec!(64.0),
            ..Default::default()
        };
        let snapshot = compute_snapshot(&config, 1, &inputs);
        assert_eq!(snapshot.round_trip_fee, dec!(16.0000));
        match evaluate_auto_exit(&auto, &add, &snapshot) {
            Some(AutoExitRule::CalProfit { threshold, .. }) => {
                assert_eq!(threshold, dec!(64.0000))
            }
            other => panic!("expected CalProfit, got {other:?}"),
        }

        // 63.99 does not trigger.
        inputs.unrealized_pnl = dec!(63.99);
        let snapshot = compute_snapshot(&config, 1, &inputs);
        assert!(evaluate_auto_exit(&auto, &add, &snapshot).is_none());
    }

    #[test]
    fn test_auto_exit_priority_first_match_wins() {
        let auto = AutoExitConfig {
            use_pnl_auto_manual: true,
            pnl_auto_manual_threshold: dec!(50),
            use_pnl_auto_cal: true,
            pnl_auto_cal_times: dec!(1),
            ..Default::default()
        };
        let snapshot = CapitalSnapshot {
            net_profit: dec!(100),
            position_notional: dec!(10000),
            round_trip_fee: dec!(16),
            ..Default::default()
        };
        // Both rules match; the manual threshold has priority.
        assert!(matches!(
            evaluate_auto_exit(&auto, &AutoAddConfig::default(), &snapshot),
            Some(AutoExitRule::ManualProfit { .. })
        ));
    }

    #[test]
    fn test_loss_rules_trigger_on_negative_pnl() {
        let auto = AutoExitConfig {
            use_pnl_auto_cal_loss: true,
            pnl_auto_cal_loss_times: dec!(1.5),
            ..Default::default()
        };
        let mut snapshot = CapitalSnapshot {
            net_profit: dec!(-24),
            position_notional: dec!(10000),
            round_trip_fee: dec!(16),
            ..Default::default()
        };
        // threshold = -(16 * 1.5) = -24
        assert!(matches!(
            evaluate_auto_exit(&auto, &AutoAddConfig::default(), &snapshot),
            Some(AutoExitRule::CalLoss { .. })
        ));
        snapshot.net_profit = dec!(-23.99);
        assert!(evaluate_auto_exit(&auto, &AutoAddConfig::default(), &snapshot).is_none());
    }

    #[test]
    fn test_calculated_rules_need_a_position() {
        let auto = AutoExitConfig {
            use_pnl_auto_cal: true,
            ..Default::default()
        };
        let snapshot = CapitalSnapshot {
            net_profit: dec!(1000),
            position_notional: Decimal::ZERO,
            ..Default::default()
        };
        assert!(evaluate_auto_exit(&auto, &AutoAddConfig::default(), &snapshot).is_none());
    }

    #[test]
    fn test_auto_add_requirement() {
        let config = AutoAddConfig {
            add_pos_recovery_percent: dec!(0.6),
            add_pos_profit_multiplier: dec!(1.5),
            ..Default::default()
        };
        let snapshot = CapitalSnapshot {
            net_profit: dec!(-30),
            round_trip_fee: dec!(16),
            ..Default::default()
        };
        let req = auto_add_requirement(&config, &snapshot);
        // 30 / 0.006 = 5000
        assert_eq!(req.need_above_zero, dec!(5000));
        // (30 + 16*1.5) / 0.006 = 9000
        assert_eq!(req.need_profit_target, dec!(9000));

        // No requirement while profitable.
        let flat = CapitalSnapshot::default();
        assert_eq!(auto_add_requirement(&config, &flat), AutoAddRequirement::default());
    }

    fn add_config() -> AutoAddConfig {
        AutoAddConfig {
            use_add_pos_profit_target: true,
            first_add_gap_percent: dec!(0.5),
            next_add_gap_percent: dec!(1),
            first_add_size_percent: dec!(50),
            next_add_size_percent: dec!(25),
            max_add_count: 2,
            max_add_used: dec!(10000),
            ..Default::default()
        }
    }

    fn losing_snapshot() -> CapitalSnapshot {
        CapitalSnapshot {
            net_profit: dec!(-50),
            position_notional: dec!(10000),
            remaining_notional: dec!(5000),
            ..Default::default()
        }
    }

    #[test]
    fn test_auto_add_gap_gate() {
        let config = add_config();
        let snapshot = losing_snapshot();
        let entry = Price::new(dec!(3000));

        // 0.4% adverse move: under the 0.5% first-add gap.
        assert!(evaluate_auto_add(
            &config, &snapshot, PosSide::Long, entry,
            Price::new(dec!(2988)), 10, 0, Decimal::ZERO, dec!(1),
        )
        .is_none());

        // 0.5% adverse move fires, sized at 50% of position notional.
        let order = evaluate_auto_add(
            &config, &snapshot, PosSide::Long, entry,
            Price::new(dec!(2985)), 10, 0, Decimal::ZERO, dec!(1),
        )
        .unwrap();
        assert_eq!(order.notional, dec!(5000));
        assert_eq!(order.margin_cost, dec!(500));

        // Second add needs the wider 1% gap and uses the smaller size.
        assert!(evaluate_auto_add(
            &config, &snapshot, PosSide::Long, entry,
            Price::new(dec!(2985)), 10, 1, dec!(5000), dec!(1),
        )
        .is_none());
        let second = evaluate_auto_add(
            &config, &snapshot, PosSide::Long, entry,
            Price::new(dec!(2970)), 10, 1, dec!(5000), dec!(1),
        )
        .unwrap();
        assert_eq!(second.notional, dec!(2500));
    }

    #[test]
    fn test_auto_add_caps_and_count_limit() {
        let config = add_config();
        let snapshot = losing_snapshot();
        let entry = Price::new(dec!(3000));
        let moved = Price::new(dec!(2900));

        // Secondary budget nearly exhausted: add is truncated to it.
        let order = evaluate_auto_add(
            &config, &snapshot, PosSide::Long, entry, moved, 10, 1, dec!(9000), dec!(1),
        )
        .unwrap();
        assert_eq!(order.notional, dec!(1000));

        // Fully exhausted: below min order amount, no add.
        assert!(evaluate_auto_add(
            &config, &snapshot, PosSide::Long, entry, moved, 10, 1, dec!(10000), dec!(1),
        )
        .is_none());

        // Count cap reached.
        assert!(evaluate_auto_add(
            &config, &snapshot, PosSide::Long, entry, moved, 10, 2, Decimal::ZERO, dec!(1),
        )
        .is_none());
    }

    #[test]
    fn test_auto_add_short_side_gap_direction() {
        let config = add_config();
        let snapshot = losing_snapshot();
        let entry = Price::new(dec!(3000));

        // Short loses when price rises.
        assert!(evaluate_auto_add(
            &config, &snapshot, PosSide::Short, entry,
            Price::new(dec!(3015)), 10, 0, Decimal::ZERO, dec!(1),
        )
        .is_some());
        assert!(evaluate_auto_add(
            &config, &snapshot, PosSide::Short, entry,
            Price::new(dec!(2985)), 10, 0, Decimal::ZERO, dec!(1),
        )
        .is_none());
    }
}
