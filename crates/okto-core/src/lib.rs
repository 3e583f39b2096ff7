//! Core domain types for the okto perpetual-swap trading engine.
//!
//! This crate provides the fundamental types shared by every other crate:
//! - `Price`, `Size`: precision-safe numeric newtypes
//! - `PosSide`, `OrderSide`, `TradeDirection`: trading enums
//! - `resolve_side`: the single net-mode side disambiguation point
//! - `InstrumentSpec`: per-instrument trading rules (tick/lot/precision)

pub mod decimal;
pub mod error;
pub mod instrument;
pub mod side;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use instrument::InstrumentSpec;
pub use side::{resolve_side, MarginMode, OrderSide, PosSide, PositionMode, TradeDirection};
