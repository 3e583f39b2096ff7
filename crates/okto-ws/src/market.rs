//! Public market-data stream: trades and tickers for one instrument.
//!
//! Exposes the latest traded price with a monotonic freshness timestamp.
//! The stream itself never decides to reconnect on staleness; the
//! supervising loop watches price age and force-closes the sockets, and
//! this task reconnects with a fixed delay until shutdown.

use crate::error::{WsError, WsResult};
use crate::frame::{parse_frame, parse_ticker_tick, parse_trades_tick, PriceTick, WsFrame, WsRequest};
use crate::subscription::{ReadinessGate, StreamPhase, SubscriptionTracker};
use futures_util::{SinkExt, StreamExt};
use okto_core::Price;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Production public WebSocket endpoint.
pub const LIVE_PUBLIC_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
/// Demo-trading public WebSocket endpoint.
pub const DEMO_PUBLIC_WS_URL: &str = "wss://wspap.okx.com:8443/ws/v5/public";

/// Latest traded price with freshness tracking. Shared between the market
/// stream (writer) and everything that prices decisions (readers).
#[derive(Debug, Default)]
pub struct PriceCell {
    inner: RwLock<LatestPrice>,
}

#[derive(Debug, Default)]
struct LatestPrice {
    price: Option<Price>,
    exchange_ts_ms: Option<i64>,
    updated_at: Option<Instant>,
}

impl PriceCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, tick: PriceTick) {
        let mut inner = self.inner.write();
        inner.price = Some(Price::new(tick.price));
        inner.exchange_ts_ms = tick.exchange_ts_ms.or(inner.exchange_ts_ms);
        inner.updated_at = Some(Instant::now());
    }

    /// Latest price, if any has arrived this session.
    pub fn latest(&self) -> Option<Price> {
        self.inner.read().price
    }

    /// Time since the last update. `None` before the first tick.
    pub fn age(&self) -> Option<Duration> {
        self.inner.read().updated_at.map(|at| at.elapsed())
    }

    /// Whether the last update is older than `threshold` (false before the
    /// first tick: nothing to restart on yet).
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age().is_some_and(|age| age > threshold)
    }

    /// Reset the freshness clock without touching the price. Used after a
    /// forced reconnect so the watchdog does not re-fire immediately.
    pub fn touch(&self) {
        self.inner.write().updated_at = Some(Instant::now());
    }
}

/// Instrument symbol shared with the supervisor; re-read on every connect
/// attempt so a live symbol switch takes effect at the next reconnect.
pub type SharedSymbol = Arc<RwLock<String>>;

/// Configuration for the public stream.
#[derive(Debug, Clone)]
pub struct MarketStreamConfig {
    pub url: String,
    pub symbol: SharedSymbol,
}

/// Public market-data stream task.
pub struct MarketStream {
    config: MarketStreamConfig,
    price: Arc<PriceCell>,
    gate: Arc<ReadinessGate>,
    phase: Arc<RwLock<StreamPhase>>,
    force_close: Arc<Notify>,
    shutdown: CancellationToken,
}

impl MarketStream {
    pub fn new(
        config: MarketStreamConfig,
        price: Arc<PriceCell>,
        gate: Arc<ReadinessGate>,
        force_close: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            price,
            gate,
            phase: Arc::new(RwLock::new(StreamPhase::Disconnected)),
            force_close,
            shutdown,
        }
    }

    pub fn phase_handle(&self) -> Arc<RwLock<StreamPhase>> {
        self.phase.clone()
    }

    /// Run until shutdown, reconnecting with a fixed delay after every
    /// disconnect.
    pub async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            *self.phase.write() = StreamPhase::Connecting;

            match self.connect_once().await {
                Ok(()) => info!("market stream closed"),
                Err(e) => error!(error = %e, "market stream error"),
            }

            self.gate.set_market_ready(false);
            *self.phase.write() = StreamPhase::Disconnected;

            tokio::select! {
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                () = self.shutdown.cancelled() => break,
            }
        }
        *self.phase.write() = StreamPhase::Disconnected;
    }

    async fn connect_once(&self) -> WsResult<()> {
        let inst_id = self.config.symbol.read().clone();
        info!(url = %self.config.url, inst_id = %inst_id, "connecting market stream");
        let (stream, _response) = connect_async(&self.config.url).await?;
        let (mut write, mut read) = stream.split();

        // Public endpoint needs no auth; subscribe immediately on open.
        let mut tracker = SubscriptionTracker::new();
        let channels = vec![
            json!({"channel": "trades", "instId": inst_id}),
            json!({"channel": "tickers", "instId": inst_id}),
        ];
        for channel in &channels {
            let key = format!(
                "{}:{}",
                channel["channel"].as_str().unwrap_or_default(),
                channel["instId"].as_str().unwrap_or_default()
            );
            tracker.request(key);
        }
        write
            .send(Message::Text(WsRequest::subscribe(channels).to_text()?))
            .await?;
        *self.phase.write() = StreamPhase::SubscriptionsPending;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                () = self.force_close.notified() => {
                    warn!("market stream force-closed for reconnect");
                    let _ = write.send(Message::Close(None)).await;
                    return Err(WsError::ConnectionFailed("forced reconnect".to_string()));
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &mut tracker),
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1000, "normal close".to_string()));
                        return Err(WsError::ConnectionClosed { code, reason });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
    }

    fn handle_text(&self, text: &str, tracker: &mut SubscriptionTracker) {
        match parse_frame(text) {
            WsFrame::Subscribed(arg) => {
                if tracker.confirm(&arg.key()) {
                    info!("market stream ready");
                    *self.phase.write() = StreamPhase::Ready;
                    self.gate.set_market_ready(true);
                }
            }
            WsFrame::Data { arg, data } => {
                let tick = match arg.channel.as_str() {
                    "trades" => parse_trades_tick(&data),
                    "tickers" => parse_ticker_tick(&data),
                    _ => None,
                };
                if let Some(tick) = tick {
                    self.price.update(tick);
                }
            }
            WsFrame::Error { code, msg } => {
                warn!(code, msg, "market stream error frame");
            }
            WsFrame::Login { .. } | WsFrame::Ignored => {
                debug!("ignored market stream frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_cell_freshness() {
        let cell = PriceCell::new();
        assert!(cell.latest().is_none());
        assert!(cell.age().is_none());
        // No price yet: not stale, nothing to restart on.
        assert!(!cell.is_stale(Duration::ZERO));

        cell.update(PriceTick {
            price: dec!(2980),
            exchange_ts_ms: Some(1_700_000_000_000),
        });
        assert_eq!(cell.latest().unwrap().inner(), dec!(2980));
        assert!(cell.age().unwrap() < Duration::from_secs(1));
        assert!(cell.is_stale(Duration::ZERO));
        assert!(!cell.is_stale(Duration::from_secs(30)));
    }

    #[test]
    fn test_price_cell_keeps_last_exchange_ts() {
        let cell = PriceCell::new();
        cell.update(PriceTick {
            price: dec!(2980),
            exchange_ts_ms: Some(42),
        });
        // Ticker pushes may omit the ts; the previous one is retained.
        cell.update(PriceTick {
            price: dec!(2981),
            exchange_ts_ms: None,
        });
        assert_eq!(cell.latest().unwrap().inner(), dec!(2981));
        assert_eq!(cell.inner.read().exchange_ts_ms, Some(42));
    }
}
