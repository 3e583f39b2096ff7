//! Callback-style event surface for the external UI layer.
//!
//! The engine never calls the UI directly; it pushes typed events into a
//! bounded channel that the collaborator drains. Payload field sets are
//! stable: numeric fields are floats, ids are strings. A full channel drops
//! the event with a warning rather than blocking trading code.

use chrono::Local;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Default event channel depth.
pub const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Severity of an operator notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Error,
    Warning,
    Success,
}

/// One pending order as rendered by the UI.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTradeView {
    pub id: String,
    pub side: String,
    pub entry_price: f64,
    pub stake: f64,
    pub status: String,
    /// Seconds until the unfilled-timeout cancel, when known.
    pub time_left_secs: Option<i64>,
}

/// One side of the position book as rendered by the UI.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PositionView {
    pub in_position: bool,
    pub entry_price: f64,
    pub quantity: f64,
    pub liquidation_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
}

/// Engine-to-UI events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    ConsoleLog {
        timestamp: String,
        level: String,
        message: String,
    },
    BotStatus {
        running: bool,
    },
    AccountUpdate {
        total_capital: f64,
        total_balance: f64,
        available_balance: f64,
        max_allowed_used_display: f64,
        max_amount_display: f64,
        used_amount: f64,
        size_amount: f64,
        remaining_amount: f64,
        trade_fees: f64,
        net_profit: f64,
        total_trade_profit: f64,
        total_trade_loss: f64,
        net_trade_profit: f64,
        total_trades: u64,
        need_add_usdt: f64,
        need_add_above_zero: f64,
    },
    PositionUpdate {
        side: String,
        long: PositionView,
        short: PositionView,
    },
    TradesUpdate {
        trades: Vec<PendingTradeView>,
    },
    Notice {
        kind: NoticeKind,
        message: String,
    },
}

/// Cloneable sender half of the event surface.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus and the receiver the UI layer drains.
    pub fn channel() -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Emit without blocking. Dropping an event is preferable to stalling a
    /// trading path behind a slow UI consumer.
    pub fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "UI event dropped");
        }
    }

    /// Emit a console log line (also mirrored to tracing by callers).
    pub fn console(&self, level: &str, message: impl Into<String>) {
        self.emit(EngineEvent::ConsoleLog {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            level: level.to_string(),
            message: message.into(),
        });
    }

    pub fn notice(&self, kind: NoticeKind, message: impl Into<String>) {
        self.emit(EngineEvent::Notice {
            kind,
            message: message.into(),
        });
    }

    pub fn status(&self, running: bool) {
        self.emit(EngineEvent::BotStatus { running });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_flow_through_channel() {
        let (bus, mut rx) = EventBus::channel();
        bus.status(true);
        bus.notice(NoticeKind::Success, "started");

        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::BotStatus { running: true })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::Notice { kind: NoticeKind::Success, .. })
        ));
    }

    #[test]
    fn test_payload_serialization_shape() {
        let event = EngineEvent::BotStatus { running: false };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "bot_status");
        assert_eq!(json["payload"]["running"], false);
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (bus, rx) = EventBus::channel();
        for _ in 0..EVENT_CHANNEL_CAPACITY + 10 {
            bus.status(true);
        }
        // Still alive; receiver drained later sees at most capacity events.
        drop(rx);
        bus.status(false);
    }
}
