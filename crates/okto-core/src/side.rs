//! Position/order side enums and net-mode disambiguation.
//!
//! All position and order state in the engine is keyed by [`PosSide`].
//! The exchange may report a `net` position side; `resolve_side` is the
//! single place that mapping rule lives.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position side: the long book or the short book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosSide {
    Long,
    Short,
}

impl PosSide {
    pub const BOTH: [PosSide; 2] = [PosSide::Long, PosSide::Short];

    /// Order side that opens (grows) this position side.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes (shrinks) this position side.
    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> i8 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }

    /// Exchange wire value ("long" / "short").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl fmt::Display for PosSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configured trading direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    #[default]
    Long,
    Short,
    /// Trade the long and short books simultaneously (hedge mode).
    Both,
}

impl TradeDirection {
    /// The position sides this direction evaluates for entry.
    pub fn sides(&self) -> &'static [PosSide] {
        match self {
            Self::Long => &[PosSide::Long],
            Self::Short => &[PosSide::Short],
            Self::Both => &PosSide::BOTH,
        }
    }
}

/// Margin mode for orders and leverage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cross => "cross",
            Self::Isolated => "isolated",
        }
    }
}

impl fmt::Display for MarginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account position mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionMode {
    /// One combined signed position per instrument.
    #[serde(rename = "net_mode")]
    #[default]
    Net,
    /// Independent long and short books.
    #[serde(rename = "long_short_mode")]
    LongShort,
}

impl PositionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Net => "net_mode",
            Self::LongShort => "long_short_mode",
        }
    }

    /// Whether orders must carry an explicit posSide.
    pub fn is_hedged(&self) -> bool {
        matches!(self, Self::LongShort)
    }
}

/// Default side for a net-mode position when the configured direction is
/// `both` and the quantity sign gives no hint. Inherited tie-break; kept as
/// a named constant so revisiting it is a one-line change.
pub const NET_BOTH_DEFAULT: PosSide = PosSide::Long;

/// Map an exchange-reported position side to a [`PosSide`].
///
/// In hedge mode the exchange reports "long"/"short" directly. In net mode
/// it reports "net" and the mapping falls back to, in order:
/// 1. the sign of the reported quantity, when one is available and nonzero;
/// 2. the configured trading direction;
/// 3. [`NET_BOTH_DEFAULT`] when the direction is `both`.
pub fn resolve_side(
    raw_pos_side: &str,
    quantity: Option<Decimal>,
    direction: TradeDirection,
) -> PosSide {
    match raw_pos_side {
        "long" => PosSide::Long,
        "short" => PosSide::Short,
        _ => {
            if let Some(qty) = quantity {
                if !qty.is_zero() {
                    return if qty.is_sign_negative() {
                        PosSide::Short
                    } else {
                        PosSide::Long
                    };
                }
            }
            match direction {
                TradeDirection::Long => PosSide::Long,
                TradeDirection::Short => PosSide::Short,
                TradeDirection::Both => NET_BOTH_DEFAULT,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_exit_order_sides() {
        assert_eq!(PosSide::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(PosSide::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(PosSide::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(PosSide::Short.exit_order_side(), OrderSide::Buy);
    }

    #[test]
    fn test_resolve_side_hedge_mode() {
        assert_eq!(
            resolve_side("long", None, TradeDirection::Short),
            PosSide::Long
        );
        assert_eq!(
            resolve_side("short", None, TradeDirection::Long),
            PosSide::Short
        );
    }

    #[test]
    fn test_resolve_side_net_by_quantity_sign() {
        assert_eq!(
            resolve_side("net", Some(dec!(-3)), TradeDirection::Long),
            PosSide::Short
        );
        assert_eq!(
            resolve_side("net", Some(dec!(7)), TradeDirection::Short),
            PosSide::Long
        );
    }

    #[test]
    fn test_resolve_side_net_by_direction() {
        assert_eq!(
            resolve_side("net", None, TradeDirection::Short),
            PosSide::Short
        );
        assert_eq!(
            resolve_side("net", Some(dec!(0)), TradeDirection::Long),
            PosSide::Long
        );
    }

    #[test]
    fn test_resolve_side_net_both_defaults_long() {
        assert_eq!(
            resolve_side("net", None, TradeDirection::Both),
            NET_BOTH_DEFAULT
        );
    }
}
