//! The okto trading-state engine.
//!
//! Components, leaf-first:
//! - `capital`: notional capacity, fees, PnL, auto-exit/auto-add decisions
//! - `book`: the position reconciler (positions, pending entries, exits)
//! - `candles` / `signal`: entry-condition evaluation
//! - `executor`: order placement/cancellation and the authoritative exit
//! - `config` / `events`: typed configuration and the UI event surface
//! - `supervisor`: startup, loops, reconnection, UI entry points

pub mod book;
pub mod candles;
pub mod capital;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod signal;
pub mod supervisor;

pub use book::{
    exit_prices, BookAction, CloseKind, EntryStatus, ExitKind, ExitOrderSet, PendingEntry,
    PositionBook, SidePhase, SidePosition, SideView, TriggerFlag,
};
pub use candles::{evaluate_candle_conditions, CandleStore};
pub use capital::{
    auto_add_requirement, compute_snapshot, evaluate_auto_add, evaluate_auto_exit, AutoAddOrder,
    AutoAddRequirement, AutoExitRule, CapitalInputs, CapitalSnapshot, ClampTracker,
};
pub use config::{
    AutoAddConfig, AutoExitConfig, CancellationConfig, CapitalConfig, ConfigDelta,
    ConfigUpdateOutcome, CredentialConfig, CredentialProfile, EngineConfig, EntryConfig,
    ExitConfig, MarginGuardConfig, TradingConfig,
};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus, NoticeKind, PendingTradeView, PositionView};
pub use executor::OrderExecutor;
pub use signal::{batch_limit_price, check_entry_conditions, EntrySignal};
pub use supervisor::TradingSupervisor;
