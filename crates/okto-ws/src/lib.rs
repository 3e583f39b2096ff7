//! OKX WebSocket streams for the okto engine.
//!
//! - `MarketStream`: public trades/tickers, latest-price cell with
//!   freshness tracking
//! - `AccountStream`: private login-then-subscribe stream pushing
//!   positions, balance, and order updates to the engine
//! - `ReadinessGate`: single gate covering both streams; "connected"
//!   means both are ready

pub mod account;
pub mod error;
pub mod frame;
pub mod market;
pub mod subscription;

pub use account::{
    AccountEvent, AccountStream, AccountStreamConfig, DEMO_PRIVATE_WS_URL, LIVE_PRIVATE_WS_URL,
};
pub use error::{WsError, WsResult};
pub use frame::{
    parse_balance_push, parse_frame, parse_order_updates, parse_ticker_tick, parse_trades_tick,
    BalancePush, ChannelArg, PriceTick, RawOrderUpdate, WsFrame, WsRequest,
};
pub use market::{
    MarketStream, MarketStreamConfig, PriceCell, SharedSymbol, DEMO_PUBLIC_WS_URL,
    LIVE_PUBLIC_WS_URL, RECONNECT_DELAY,
};
pub use subscription::{ReadinessGate, StreamPhase, SubscriptionTracker};
