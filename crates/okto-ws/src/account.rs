//! Private account stream: positions, balance, and order updates.
//!
//! The private endpoint requires a signed login frame before any
//! subscription is accepted. Confirmed pushes are forwarded to the engine
//! over a bounded channel; this task never mutates trading state itself.

use crate::error::{WsError, WsResult};
use crate::frame::{
    parse_balance_push, parse_frame, parse_order_updates, BalancePush, RawOrderUpdate, WsFrame,
    WsRequest,
};
use crate::market::RECONNECT_DELAY;
use crate::subscription::{ReadinessGate, StreamPhase, SubscriptionTracker};
use futures_util::{SinkExt, StreamExt};
use okto_rest::{Credentials, RawPosition};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Production private WebSocket endpoint.
pub const LIVE_PRIVATE_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";
/// Demo-trading private WebSocket endpoint.
pub const DEMO_PRIVATE_WS_URL: &str = "wss://wspap.okx.com:8443/ws/v5/private";

/// Maximum wait for the login acknowledgement.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A confirmed push from the private stream.
#[derive(Debug, Clone)]
pub enum AccountEvent {
    /// Position list push (full rows for the subscribed instrument type).
    Positions(Vec<RawPosition>),
    /// Balance/equity push.
    Balance(BalancePush),
    /// Order state updates.
    Orders(Vec<RawOrderUpdate>),
}

/// Configuration for the private stream. Credentials are shared with the
/// supervisor so a reapply takes effect at the next login.
#[derive(Debug, Clone)]
pub struct AccountStreamConfig {
    pub url: String,
    pub credentials: Arc<RwLock<Credentials>>,
}

/// Private account stream task.
pub struct AccountStream {
    config: AccountStreamConfig,
    events: mpsc::Sender<AccountEvent>,
    gate: Arc<ReadinessGate>,
    phase: Arc<RwLock<StreamPhase>>,
    force_close: Arc<Notify>,
    shutdown: CancellationToken,
}

impl AccountStream {
    pub fn new(
        config: AccountStreamConfig,
        events: mpsc::Sender<AccountEvent>,
        gate: Arc<ReadinessGate>,
        force_close: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            events,
            gate,
            phase: Arc::new(RwLock::new(StreamPhase::Disconnected)),
            force_close,
            shutdown,
        }
    }

    pub fn phase_handle(&self) -> Arc<RwLock<StreamPhase>> {
        self.phase.clone()
    }

    /// Run until shutdown, reconnecting with a fixed delay.
    pub async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            *self.phase.write() = StreamPhase::Connecting;

            match self.connect_once().await {
                Ok(()) => info!("account stream closed"),
                Err(e) => error!(error = %e, "account stream error"),
            }

            self.gate.set_account_ready(false);
            *self.phase.write() = StreamPhase::Disconnected;

            tokio::select! {
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                () = self.shutdown.cancelled() => break,
            }
        }
        *self.phase.write() = StreamPhase::Disconnected;
    }

    async fn connect_once(&self) -> WsResult<()> {
        info!(url = %self.config.url, "connecting account stream");
        let (stream, _response) = connect_async(&self.config.url).await?;
        let (mut write, mut read) = stream.split();

        // Login must succeed before any subscription is accepted.
        let login = {
            let credentials = self.config.credentials.read();
            WsRequest::login(&credentials, chrono::Utc::now().timestamp())?
        };
        write.send(Message::Text(login.to_text()?)).await?;

        self.await_login_ack(&mut write, &mut read).await?;

        // Subscribe only after login success.
        let mut tracker = SubscriptionTracker::new();
        let channels = vec![
            json!({"channel": "positions", "instType": "SWAP"}),
            json!({"channel": "account"}),
            json!({"channel": "orders", "instType": "SWAP"}),
        ];
        for channel in &channels {
            if let Some(name) = channel["channel"].as_str() {
                tracker.request(name.to_string());
            }
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
                    warn!("account stream force-closed for reconnect");
                    let _ = write.send(Message::Close(None)).await;
                    return Err(WsError::ConnectionFailed("forced reconnect".to_string()));
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &mut tracker).await,
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

    /// Drain frames until the login acknowledgement arrives.
    async fn await_login_ack<W, R>(&self, write: &mut W, read: &mut R) -> WsResult<()>
    where
        W: futures_util::Sink<Message> + Unpin,
        R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let deadline = tokio::time::Instant::now() + LOGIN_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(WsError::LoginRejected {
                    code: "timeout".to_string(),
                    msg: "no login acknowledgement".to_string(),
                });
            }
            let msg = tokio::time::timeout(remaining, read.next())
                .await
                .map_err(|_| WsError::LoginRejected {
                    code: "timeout".to_string(),
                    msg: "no login acknowledgement".to_string(),
                })?;
            match msg {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    WsFrame::Login { code, msg: _ } if code == "0" => {
                        info!("account stream login confirmed");
                        return Ok(());
                    }
                    WsFrame::Login { code, msg } => {
                        return Err(WsError::LoginRejected { code, msg });
                    }
                    WsFrame::Error { code, msg } => {
                        return Err(WsError::LoginRejected { code, msg });
                    }
                    _ => {}
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code.into(), f.reason.to_string()))
                        .unwrap_or((1000, "close during login".to_string()));
                    return Err(WsError::ConnectionClosed { code, reason });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(WsError::ConnectionClosed {
                        code: 1006,
                        reason: "stream ended during login".to_string(),
                    })
                }
            }
        }
    }

    async fn handle_text(&self, text: &str, tracker: &mut SubscriptionTracker) {
        match parse_frame(text) {
            WsFrame::Subscribed(arg) => {
                if tracker.confirm(&arg.key()) {
                    info!("account stream ready");
                    *self.phase.write() = StreamPhase::Ready;
                    self.gate.set_account_ready(true);
                }
            }
            WsFrame::Data { arg, data } => {
                let event = match arg.channel.as_str() {
                    "positions" => Some(AccountEvent::Positions(
                        data.iter()
                            .filter_map(|row| serde_json::from_value(row.clone()).ok())
                            .collect(),
                    )),
                    "account" => parse_balance_push(&data).map(AccountEvent::Balance),
                    "orders" => Some(AccountEvent::Orders(parse_order_updates(&data))),
                    _ => None,
                };
                if let Some(event) = event {
                    if self.events.send(event).await.is_err() {
                        warn!("account event receiver dropped");
                    }
                }
            }
            WsFrame::Error { code, msg } => {
                warn!(code, msg, "account stream error frame");
            }
            WsFrame::Login { code, .. } => {
                debug!(code, "late login frame ignored");
            }
            WsFrame::Ignored => {}
        }
    }
}
