//! Per-instrument trading rules.
//!
//! The exchange publishes tick size, lot size, minimum order quantity and
//! contract value per instrument. Every order the engine places is rounded
//! and formatted against these rules, so they are fetched once at startup
//! and refetched whenever the traded symbol changes.

use crate::decimal::{Price, Size};
use crate::error::{CoreError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading rules for one SWAP instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Instrument id, e.g. "ETH-USDT-SWAP".
    pub inst_id: String,
    /// Minimum price increment.
    pub tick_size: Price,
    /// Minimum quantity increment, in contracts.
    pub lot_size: Size,
    /// Minimum order quantity, in contracts.
    pub min_order_qty: Size,
    /// Quote value of one contract (ctVal).
    pub contract_size: Decimal,
    /// Decimal places implied by the tick size.
    pub price_precision: u32,
    /// Decimal places implied by the lot size.
    pub qty_precision: u32,
}

impl InstrumentSpec {
    /// Build a spec from raw exchange fields, deriving precisions.
    pub fn new(
        inst_id: impl Into<String>,
        tick_size: Price,
        lot_size: Size,
        min_order_qty: Size,
        contract_size: Decimal,
    ) -> Result<Self> {
        let inst_id = inst_id.into();
        if !tick_size.is_positive() {
            return Err(CoreError::InvalidInstrument(format!(
                "{inst_id}: tick size must be positive"
            )));
        }
        if !lot_size.is_positive() {
            return Err(CoreError::InvalidInstrument(format!(
                "{inst_id}: lot size must be positive"
            )));
        }
        let contract_size = if contract_size.is_zero() {
            Decimal::ONE
        } else {
            contract_size
        };
        Ok(Self {
            inst_id,
            tick_size,
            lot_size,
            min_order_qty,
            contract_size,
            price_precision: decimal_places(tick_size.inner()),
            qty_precision: decimal_places(lot_size.inner()),
        })
    }

    /// Format a price at this instrument's precision for the wire.
    pub fn format_price(&self, price: Price) -> String {
        format!(
            "{:.*}",
            self.price_precision as usize,
            price.round_to_tick(self.tick_size).inner()
        )
    }

    /// Format a quantity at this instrument's precision for the wire.
    pub fn format_qty(&self, qty: Size) -> String {
        format!("{:.*}", self.qty_precision as usize, qty.abs().inner())
    }

    /// Contracts purchasable for a quote-currency notional at a price,
    /// rounded down to lot size. Returns zero when the price is zero.
    pub fn contracts_for_notional(&self, notional: Decimal, price: Price) -> Size {
        if price.is_zero() {
            return Size::ZERO;
        }
        let base_qty = notional / price.inner();
        Size::new(base_qty / self.contract_size).round_to_lot(self.lot_size)
    }

    /// Quote-currency cost of the minimum order at a price.
    pub fn min_order_notional(&self, price: Price) -> Decimal {
        self.min_order_qty.notional(price, self.contract_size)
    }
}

/// Number of decimal places of a normalized decimal (e.g. 0.001 -> 3).
fn decimal_places(value: Decimal) -> u32 {
    value.normalize().scale()
}
