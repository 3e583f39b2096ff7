//! The trading supervisor: startup sequence, entry loop, the unified
//! background management loop, and the UI-facing entry points.
//!
//! Components below it return status values; only the supervisor decides
//! whether a failure ends the session or just the attempt. Every loop
//! iteration is error-wrapped so one failure can never kill a task, and
//! reconnection is owned here (via the stream force-close handles), never
//! by a message handler.

use crate::book::{BookAction, PendingEntry, PositionBook, TriggerFlag};
use crate::candles::{self, CandleStore, BACKFILL_BARS, BACKFILL_PAGE_LIMIT};
use crate::capital::{
    auto_add_requirement, compute_snapshot, evaluate_auto_add, evaluate_auto_exit, CapitalInputs,
    CapitalSnapshot, ClampTracker,
};
use crate::config::{ConfigUpdateOutcome, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{
    EngineEvent, EventBus, NoticeKind, PendingTradeView, PositionView,
};
use crate::executor::OrderExecutor;
use crate::signal::{batch_limit_price, check_entry_conditions, EntrySignal};
use chrono::Utc;
use okto_core::{resolve_side, InstrumentSpec, PosSide, Size};
use okto_rest::{Credentials, Method, RestClient};
use okto_telemetry::SessionStats;
use okto_ws::{
    AccountEvent, AccountStream, AccountStreamConfig, MarketStream, MarketStreamConfig, PriceCell,
    ReadinessGate, SharedSymbol,
};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Management loop base tick.
const MGMT_TICK: Duration = Duration::from_secs(1);
/// Account/position sync cadence, in ticks.
const ACCOUNT_SYNC_TICKS: u64 = 3;
/// Realized-PnL reconciliation cadence, in ticks.
const FILLS_SYNC_TICKS: u64 = 60;
/// Force both sockets closed when no price arrives for this long.
const STALE_PRICE_THRESHOLD: Duration = Duration::from_secs(30);
/// Window during which WebSocket balance pushes suppress REST polling.
const WS_FRESH_WINDOW: Duration = Duration::from_secs(10);
/// Wait for dual stream readiness at startup.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause between batch members to stay clear of burst limits.
const BATCH_MEMBER_DELAY: Duration = Duration::from_millis(200);

/// USDT balance figures shared between the private stream and REST sync.
#[derive(Debug, Default)]
struct AccountFigures {
    total_equity: Decimal,
    available: Decimal,
    balance: Decimal,
    ws_updated_at: Option<Instant>,
}

impl AccountFigures {
    fn is_ws_fresh(&self) -> bool {
        self.ws_updated_at
            .is_some_and(|at| at.elapsed() < WS_FRESH_WINDOW)
    }
}

/// The engine instance. All state is per-instance; nothing is process-wide.
pub struct TradingSupervisor {
    config: Arc<RwLock<EngineConfig>>,
    rest: Arc<RestClient>,
    book: Arc<PositionBook>,
    executor: Arc<OrderExecutor>,
    events: EventBus,
    spec: Arc<RwLock<Option<InstrumentSpec>>>,
    price: Arc<PriceCell>,
    gate: Arc<ReadinessGate>,
    account: Mutex<AccountFigures>,
    candles: Mutex<CandleStore>,
    stats: Mutex<SessionStats>,
    clamp: Mutex<ClampTracker>,
    last_snapshot: Mutex<CapitalSnapshot>,
    /// Entry placement enabled (active trading). Background monitoring,
    /// auto-exit and auto-add are independent of this.
    is_running: AtomicBool,
    loops_started: AtomicBool,
    shutdown: CancellationToken,
    shared_symbol: SharedSymbol,
    ws_credentials: Arc<RwLock<Credentials>>,
    market_force: Arc<Notify>,
    account_force: Arc<Notify>,
    batch_update: TriggerFlag,
    batch_counter: AtomicU64,
    trade_counter: AtomicU64,
}

impl TradingSupervisor {
    /// Build an engine instance. Returns the receiver the UI layer drains.
    pub fn new(
        config: EngineConfig,
        stats_path: Option<std::path::PathBuf>,
    ) -> EngineResult<(Arc<Self>, mpsc::Receiver<EngineEvent>)> {
        let (events, events_rx) = EventBus::channel();
        let credentials = config.credentials.active_credentials();
        let rest = Arc::new(RestClient::with_base_url(
            config.rest_url(),
            credentials.clone(),
        )?);
        let spec = Arc::new(RwLock::new(None));
        let executor = Arc::new(OrderExecutor::new(rest.clone(), events.clone(), spec.clone()));
        let shared_symbol = Arc::new(RwLock::new(config.trading.symbol.clone()));
        let timeframe = config.entry.candles.timeframe.clone();

        let supervisor = Arc::new(Self {
            config: Arc::new(RwLock::new(config)),
            rest,
            book: Arc::new(PositionBook::new()),
            executor,
            events,
            spec,
            price: Arc::new(PriceCell::new()),
            gate: Arc::new(ReadinessGate::new()),
            account: Mutex::new(AccountFigures::default()),
            candles: Mutex::new(CandleStore::new(timeframe)),
            stats: Mutex::new(SessionStats::new(stats_path)),
            clamp: Mutex::new(ClampTracker::default()),
            last_snapshot: Mutex::new(CapitalSnapshot::default()),
            is_running: AtomicBool::new(false),
            loops_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            shared_symbol,
            ws_credentials: Arc::new(RwLock::new(credentials)),
            market_force: Arc::new(Notify::new()),
            account_force: Arc::new(Notify::new()),
            batch_update: TriggerFlag::default(),
            batch_counter: AtomicU64::new(0),
            trade_counter: AtomicU64::new(0),
        });
        Ok((supervisor, events_rx))
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // UI entry points
    // ========================================================================

    /// Verify the selected credential profile with a single balance probe.
    pub async fn check_credentials(&self) -> (bool, String) {
        let credentials = self.config.read().credentials.active_credentials();
        if !credentials.is_complete() {
            return (
                false,
                "API key, secret, or passphrase missing for selected mode".to_string(),
            );
        }
        self.rest.set_credentials(credentials.clone());
        *self.ws_credentials.write() = credentials;

        let query = [("ccy".to_string(), "USDT".to_string())];
        match self
            .rest
            .request(Method::Get, "/api/v5/account/balance", &query, None, 1)
            .await
        {
            Ok(envelope) if envelope.is_ok() => (true, "Credentials valid".to_string()),
            Ok(envelope) if envelope.code == "50110" => {
                (false, "Invalid API credentials".to_string())
            }
            Ok(envelope) => (false, format!("API error: {}", envelope.msg)),
            Err(okto_rest::ApiError::CredentialInvalid) => {
                (false, "Invalid API credentials".to_string())
            }
            Err(e) => (false, format!("Connection error: {e}")),
        }
    }

    /// Start the engine.
    ///
    /// With `passive_monitoring` the startup failures are logged and leave
    /// the engine idle; in active mode each step is fatal. `stop` only
    /// pauses entries; calling `start` again resumes them.
    pub async fn start(self: &Arc<Self>, passive_monitoring: bool) -> EngineResult<()> {
        if self.is_running() && !passive_monitoring {
            warn!("engine is already trading");
            return Ok(());
        }
        let fatal = |message: String| -> EngineResult<()> {
            if passive_monitoring {
                warn!(%message, "startup step failed; passive monitoring stays idle");
                Ok(())
            } else {
                Err(EngineError::Startup(message))
            }
        };

        info!(passive_monitoring, "engine starting");
        self.events.console(
            "info",
            if passive_monitoring {
                "Starting background monitoring"
            } else {
                "Starting trading logic"
            },
        );

        // 1. Credentials.
        let config = self.config.read().clone();
        if let Err(problems) = config.validate(!passive_monitoring) {
            let message = format!("configuration invalid: {}", problems.join("; "));
            self.events.notice(NoticeKind::Error, message.clone());
            return fatal(message);
        }
        let (valid, detail) = self.check_credentials().await;
        if !valid {
            self.events
                .notice(NoticeKind::Error, format!("API credentials error: {detail}"));
            return fatal(format!("credential check failed: {detail}"));
        }

        // 2. Server time.
        if let Err(e) = self.rest.sync_server_time().await {
            return fatal(format!("server time sync failed: {e}"));
        }

        // 3. Instrument spec.
        match self.rest.fetch_instrument(&config.trading.symbol).await {
            Ok(spec) => {
                info!(symbol = %spec.inst_id, tick = %spec.tick_size, lot = %spec.lot_size, "instrument spec loaded");
                *self.spec.write() = Some(spec);
            }
            Err(e) => return fatal(format!("instrument fetch failed: {e}")),
        }

        // 4. Account modes and stray positions (active mode only).
        if !passive_monitoring {
            let mode = config.trading.position_mode.as_str();
            match self.rest.set_position_mode(mode).await {
                Ok(true) => info!(mode, "position mode confirmed"),
                Ok(false) => return fatal("position mode could not be set".to_string()),
                Err(e) => return fatal(format!("position mode sync failed: {e}")),
            }
            if !self.apply_leverage(&config).await {
                return fatal("leverage could not be set".to_string());
            }
            self.close_stray_positions(&config).await;

            self.stats.lock().reset_session(Utc::now().timestamp_millis());
            self.trade_counter.store(0, Ordering::SeqCst);
            self.is_running.store(true, Ordering::SeqCst);
        }

        // 5. Streams and loops.
        self.spawn_streams_and_loops();
        if !self.gate.wait_both_ready(READY_TIMEOUT).await {
            warn!("streams not ready within timeout; reconnect loop continues in background");
        }

        // 6. Candle backfill for the entry filters.
        if config.entry.candles.enabled {
            self.backfill_candles(&config).await;
        }

        self.events.status(self.is_running());
        info!("engine startup sequence complete");
        Ok(())
    }

    /// Pause new entries. Monitoring, auto-exit and auto-add continue.
    pub fn stop(&self) {
        if !self.is_running() {
            warn!("trading is not active");
            return;
        }
        self.is_running.store(false, Ordering::SeqCst);
        info!("trading paused; background monitoring remains active");
        self.events
            .console("info", "Trading paused. Background monitoring remains active.");
        self.events.status(false);
    }

    /// Full shutdown: closes sockets and halts every loop. Safe to call
    /// even if no loop ever started.
    pub fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        info!("engine fully shut down");
        self.events.status(false);
    }

    /// Manual TP/SL resync entry point.
    pub async fn batch_modify_tpsl(&self) {
        if !self.batch_update.try_engage() {
            debug!("TP/SL batch update already in progress");
            return;
        }
        let config = self.config.read().clone();
        self.executor.batch_modify_tpsl(&config, &self.book).await;
        self.batch_update.release();
    }

    /// Manual sweep-cancel entry point.
    pub async fn batch_cancel_orders(&self) {
        let config = self.config.read().clone();
        let cancelled = self.executor.sweep_cancel_all(&config).await;
        if cancelled == 0 {
            self.events
                .notice(NoticeKind::Warning, "No pending orders found to cancel");
        } else {
            self.events.notice(
                NoticeKind::Success,
                format!("Cancelled {cancelled} pending orders"),
            );
        }
        self.book.reset_all("manual batch cancel");
    }

    /// Manual emergency exit: close and cancel everything found on the
    /// exchange, then reset tracking.
    pub async fn emergency_sl(&self) {
        warn!("emergency stop triggered from dashboard");
        let config = self.config.read().clone();
        let executed = self
            .executor
            .execute_authoritative_exit(&config, &self.book, "manual dashboard trigger")
            .await;
        if executed {
            self.events.notice(
                NoticeKind::Success,
                "Emergency exit complete. All positions and orders cleared.",
            );
        }
    }

    /// Synchronous account refresh for the dashboard before start.
    pub async fn fetch_account_data_sync(self: &Arc<Self>) {
        if self.spec.read().is_none() {
            let symbol = self.config.read().trading.symbol.clone();
            match self.rest.fetch_instrument(&symbol).await {
                Ok(spec) => *self.spec.write() = Some(spec),
                Err(e) => {
                    warn!(error = %e, "instrument fetch failed during manual refresh");
                    return;
                }
            }
        }
        self.account_sync().await;
    }

    /// Diff-and-apply a live configuration update.
    pub async fn apply_live_config_update(&self, new: EngineConfig) -> ConfigUpdateOutcome {
        let old = self.config.read().clone();
        let delta = old.diff(&new);
        let mut outcome = ConfigUpdateOutcome {
            success: true,
            warnings: Vec::new(),
        };

        *self.config.write() = new.clone();
        info!("applying live configuration update");

        if delta.credentials_changed {
            let credentials = new.credentials.active_credentials();
            self.rest.set_credentials(credentials.clone());
            *self.ws_credentials.write() = credentials;
            // Private stream re-logs-in on its next connection.
            self.account_force.notify_waiters();
        }

        if delta.leverage_changed.is_some() {
            let config = self.config.read().clone();
            if self.apply_leverage(&config).await {
                info!(leverage = config.trading.leverage, "leverage updated on exchange");
            } else {
                outcome
                    .warnings
                    .push("failed to update leverage on the exchange".to_string());
            }
        }

        if let Some(symbol) = delta.symbol_changed {
            if self.book.any_in_position() {
                warn!(%symbol, "symbol change blocked while positions are open");
                self.config.write().trading.symbol = old.trading.symbol.clone();
                outcome.warnings.push(format!(
                    "symbol change to {symbol} blocked: close open positions for {} first",
                    old.trading.symbol
                ));
            } else {
                match self.rest.fetch_instrument(&symbol).await {
                    Ok(spec) => {
                        *self.spec.write() = Some(spec);
                        *self.shared_symbol.write() = symbol.clone();
                        self.candles.lock().clear();
                        let config = self.config.read().clone();
                        self.apply_leverage(&config).await;
                        // Both sockets resubscribe against the new symbol.
                        self.market_force.notify_waiters();
                        self.account_force.notify_waiters();
                        info!(%symbol, "instrument switched");
                    }
                    Err(e) => {
                        self.config.write().trading.symbol = old.trading.symbol.clone();
                        outcome.warnings.push(format!(
                            "failed to switch to {symbol}: {e}; reverted to {}",
                            old.trading.symbol
                        ));
                    }
                }
            }
        }

        outcome
    }

    // ========================================================================
    // Startup helpers
    // ========================================================================

    async fn apply_leverage(&self, config: &EngineConfig) -> bool {
        let symbol = &config.trading.symbol;
        let leverage = config.trading.leverage;
        let mgn_mode = config.trading.margin_mode.as_str();

        if config.trading.position_mode.is_hedged() {
            let long_ok = self
                .rest
                .set_leverage(symbol, leverage, mgn_mode, "long")
                .await
                .unwrap_or(false);
            let short_ok = self
                .rest
                .set_leverage(symbol, leverage, mgn_mode, "short")
                .await
                .unwrap_or(false);
            long_ok && short_ok
        } else {
            self.rest
                .set_leverage(symbol, leverage, mgn_mode, "net")
                .await
                .unwrap_or(false)
        }
    }

    /// Close any open position found at startup. Trusts the exchange data
    /// for posSide and margin mode.
    async fn close_stray_positions(&self, config: &EngineConfig) {
        info!("checking for stray open positions");
        match self.rest.fetch_positions(&config.trading.symbol).await {
            Ok(positions) => {
                let mut closed = 0u32;
                for position in positions.iter().filter(|p| p.is_open()) {
                    warn!(
                        pos_side = %position.pos_side,
                        qty = %position.quantity(),
                        "found stray open position; closing"
                    );
                    if self.executor.market_close_position(config, position).await {
                        closed += 1;
                    }
                }
                if closed == 0 {
                    info!("no stray open positions found");
                }
            }
            Err(e) => warn!(error = %e, "stray position check failed"),
        }
    }

    async fn backfill_candles(&self, config: &EngineConfig) {
        let timeframe = &config.entry.candles.timeframe;
        let Some(bar) = candles::okx_bar_code(timeframe) else {
            warn!(timeframe, "unknown candle timeframe; backfill skipped");
            return;
        };
        let symbol = config.trading.symbol.clone();

        let mut before: Option<i64> = None;
        let mut fetched = 0usize;
        while fetched < BACKFILL_BARS {
            match self
                .rest
                .fetch_history_candles(&symbol, bar, before, BACKFILL_PAGE_LIMIT)
                .await
            {
                Ok(page) if page.is_empty() => break,
                Ok(page) => {
                    fetched += page.len();
                    // Rows arrive newest-first; page backwards from the oldest.
                    before = page.iter().map(|c| c.ts_ms).min();
                    let full_page = page.len() as u32 == BACKFILL_PAGE_LIMIT;
                    self.candles.lock().merge(page);
                    if !full_page {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "candle backfill failed");
                    break;
                }
            }
        }
        info!(bars = self.candles.lock().len(), timeframe, "candle backfill complete");
    }

    // ========================================================================
    // Task spawning
    // ========================================================================

    fn spawn_streams_and_loops(self: &Arc<Self>) {
        if self.loops_started.swap(true, Ordering::SeqCst) {
            debug!("streams and loops already running");
            return;
        }

        let config = self.config.read().clone();

        let market = MarketStream::new(
            MarketStreamConfig {
                url: config.public_ws_url(),
                symbol: self.shared_symbol.clone(),
            },
            self.price.clone(),
            self.gate.clone(),
            self.market_force.clone(),
            self.shutdown.clone(),
        );
        tokio::spawn(market.run());

        let (account_tx, account_rx) = mpsc::channel(256);
        let account = AccountStream::new(
            AccountStreamConfig {
                url: config.private_ws_url(),
                credentials: self.ws_credentials.clone(),
            },
            account_tx,
            self.gate.clone(),
            self.account_force.clone(),
            self.shutdown.clone(),
        );
        tokio::spawn(account.run());

        tokio::spawn(self.clone().run_account_event_consumer(account_rx));
        tokio::spawn(self.clone().run_management_loop());
        tokio::spawn(self.clone().run_entry_loop());
    }

    /// Sleep that aborts on shutdown. Returns false when shutting down.
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.shutdown.cancelled() => false,
        }
    }

    // ========================================================================
    // Account event consumer
    // ========================================================================

    async fn run_account_event_consumer(self: Arc<Self>, mut rx: mpsc::Receiver<AccountEvent>) {
        debug!("account event consumer started");
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                () = self.shutdown.cancelled() => break,
            };
            let Some(event) = event else { break };

            let symbol = self.config.read().trading.symbol.clone();
            let direction = self.config.read().trading.direction;
            match event {
                AccountEvent::Positions(rows) => {
                    let rows: Vec<_> = rows
                        .into_iter()
                        .filter(|p| p.inst_id == symbol)
                        .collect();
                    let actions =
                        self.book
                            .apply_position_push(direction, &rows, self.price.latest());
                    self.dispatch_actions(actions);
                }
                AccountEvent::Balance(push) => {
                    let mut account = self.account.lock();
                    account.total_equity = push.total_equity;
                    account.available = push.available;
                    if !push.balance.is_zero() {
                        account.balance = push.balance;
                    }
                    account.ws_updated_at = Some(Instant::now());
                }
                AccountEvent::Orders(updates) => {
                    for update in updates.iter().filter(|u| u.inst_id == symbol) {
                        if let Some(action) = self.book.apply_order_update(update) {
                            self.dispatch_actions(vec![action]);
                        }
                    }
                }
            }
        }
        debug!("account event consumer stopped");
    }

    fn dispatch_actions(self: &Arc<Self>, actions: Vec<BookAction>) {
        for action in actions {
            match action {
                BookAction::ScheduleConfirm { order_id, delay_secs } => {
                    info!(%order_id, delay_secs, "entry fill reported; scheduling confirmation");
                    let this = self.clone();
                    tokio::spawn(async move {
                        if this.idle(Duration::from_secs(delay_secs)).await {
                            this.confirm_and_activate(&order_id).await;
                        }
                    });
                }
                BookAction::TpHit { side } => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_tp_hit(side).await });
                }
                BookAction::SlHit { side } => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_sl_hit(side).await });
                }
                BookAction::SideClosed { side, kind } => {
                    info!(side = %side, ?kind, "position closed outside tracked exits");
                    self.events
                        .console("info", format!("Position closed ({side}): {kind:?}"));
                }
                BookAction::EntryDiscarded { order_id, status } => {
                    info!(%order_id, status = status.as_str(), "entry order discarded");
                }
                BookAction::ResyncExits => {
                    if self.is_running() && !self.executor.exit_in_flight.is_engaged() {
                        let this = self.clone();
                        tokio::spawn(async move { this.batch_modify_tpsl().await });
                    }
                }
            }
        }
    }

    // ========================================================================
    // Fill confirmation and exit handlers
    // ========================================================================

    /// Authoritative promotion: only a live nonzero position confirmed by
    /// the exchange activates a side. TP/SL come from the actual average
    /// entry price, not the requested limit price.
    async fn confirm_and_activate(self: &Arc<Self>, order_id: &str) {
        let config = self.config.read().clone();
        let positions = match self.rest.fetch_positions(&config.trading.symbol).await {
            Ok(positions) => positions,
            Err(e) => {
                error!(order_id, error = %e, "confirmation poll failed; next reconciliation retries");
                return;
            }
        };

        let expected_side = self
            .book
            .pending_entries()
            .into_iter()
            .find(|e| e.order_id == order_id)
            .map(|e| e.side);

        let confirmed = positions.iter().filter(|p| p.is_open()).find(|p| {
            let side = resolve_side(&p.pos_side, Some(p.quantity()), config.trading.direction);
            expected_side.map_or(true, |expected| side == expected)
        });

        let Some(position) = confirmed else {
            error!(
                order_id,
                "CRITICAL: fill reported but no live position confirmed; leaving unconfirmed"
            );
            return;
        };
        let avg_px = position.avg_price();
        if !avg_px.is_positive() {
            error!(order_id, "CRITICAL: confirmed position has no average entry price");
            return;
        }

        let side = resolve_side(
            &position.pos_side,
            Some(position.quantity()),
            config.trading.direction,
        );
        let qty = Size::new(position.quantity());
        let (tp, sl) = crate::book::exit_prices(
            side,
            avg_px,
            config.exits.tp_price_offset,
            config.exits.sl_price_offset,
        );

        self.book
            .promote_confirmed(order_id, side, avg_px, qty, tp, sl);
        self.trade_counter.fetch_add(1, Ordering::SeqCst);
        info!(side = %side, entry = %avg_px, qty = %qty, "position opened");
        self.events.console(
            "info",
            format!("{side} position opened. Entry {avg_px}, qty {qty}"),
        );

        if let Err(failed_leg) = self
            .executor
            .attach_exits(&config, &self.book, side, tp, sl, qty)
            .await
        {
            // An unprotected position is not acceptable: fail safe.
            error!(side = %side, leg = failed_leg.as_str(), "exit attach failed; failing safe");
            self.events.notice(
                NoticeKind::Error,
                format!("Failed to attach {} for {side}; executing protective exit", failed_leg.as_str()),
            );
            self.executor
                .execute_authoritative_exit(
                    &config,
                    &self.book,
                    &format!("failed to place {} for {side}", failed_leg.as_str()),
                )
                .await;
        }
    }

    /// TP fill protocol: prune entries, verify the position is really gone,
    /// market-close any partial remainder, then clear the side.
    async fn handle_tp_hit(self: &Arc<Self>, side: PosSide) {
        let config = self.config.read().clone();
        info!(side = %side, "take-profit hit; executing protocol");
        self.events
            .console("info", format!("TP hit ({side}), cleaning up"));

        self.cancel_tracked_entries(&config, side).await;
        if !self.idle(Duration::from_secs(1)).await {
            self.book.tp_hit.release();
            return;
        }

        let remainder = match self.rest.fetch_positions(&config.trading.symbol).await {
            Ok(positions) => positions.into_iter().filter(|p| p.is_open()).find(|p| {
                resolve_side(&p.pos_side, Some(p.quantity()), config.trading.direction) == side
            }),
            Err(e) => {
                warn!(error = %e, "TP remainder check failed");
                None
            }
        };

        if let Some(position) = remainder {
            info!(side = %side, qty = %position.quantity(), "partial TP; market-closing remainder");
            // Give the book a moment to find liquidity after the trigger.
            if self.idle(Duration::from_secs(3)).await {
                self.executor.market_close_position(&config, &position).await;
            }
        }

        for algo_id in self.book.take_exit_orders(side) {
            self.executor.cancel_algo(&config.trading.symbol, &algo_id).await;
        }
        self.book.reset_side(side, "TP hit");
        self.book.tp_hit.release();
        info!(side = %side, "TP protocol complete");
    }

    /// SL fill protocol: the exchange already closed the position; prune
    /// entries, drop the sibling TP order, and clear the side.
    async fn handle_sl_hit(self: &Arc<Self>, side: PosSide) {
        let config = self.config.read().clone();
        info!(side = %side, "stop-loss hit; executing cleanup");
        self.events
            .console("info", format!("SL hit ({side}), cleaning up"));

        self.cancel_tracked_entries(&config, side).await;

        for algo_id in self.book.take_exit_orders(side) {
            self.executor.cancel_algo(&config.trading.symbol, &algo_id).await;
        }
        self.book.reset_side(side, "SL hit - closed by exchange");
        self.book.sl_hit.release();
        info!(side = %side, "SL cleanup complete");

        let this = self.clone();
        tokio::spawn(async move { this.account_sync().await });
    }

    async fn cancel_tracked_entries(&self, config: &EngineConfig, side: PosSide) {
        let entries: Vec<PendingEntry> = self
            .book
            .pending_entries()
            .into_iter()
            .filter(|e| e.side == side)
            .collect();
        for entry in entries {
            self.executor
                .cancel_entry(&config.trading.symbol, &entry.order_id, "position exited")
                .await;
            self.book.remove_pending(&entry.order_id);
        }
    }

    // ========================================================================
    // Management loop
    // ========================================================================

    /// Fixed-tick background management. Runs regardless of active/passive
    /// mode; one failed step never kills the loop.
    async fn run_management_loop(self: Arc<Self>) {
        debug!("management loop started");
        let mut tick = 0u64;
        loop {
            if !self.idle(MGMT_TICK).await {
                break;
            }
            tick = tick.wrapping_add(1);

            // Cancellation sweep precedes capital evaluation in a tick so
            // stale orders never count into used notional.
            self.cancellation_sweep().await;
            self.stale_price_watchdog();

            if tick % ACCOUNT_SYNC_TICKS == 0 {
                self.account_sync().await;
            }
            if tick % FILLS_SYNC_TICKS == 0 {
                self.reconcile_realized_pnl().await;
            }
        }
        debug!("management loop stopped");
    }

    async fn cancellation_sweep(&self) {
        let Some(market) = self.price.latest() else {
            return;
        };
        let config = self.config.read().clone();
        let candidates = self.book.cancellation_candidates(
            &config.cancellation,
            config.exits.tp_price_offset,
            market,
            Utc::now(),
        );
        for candidate in candidates {
            if self
                .executor
                .cancel_entry(&config.trading.symbol, &candidate.order_id, &candidate.reason)
                .await
            {
                self.book.remove_pending(&candidate.order_id);
            }
        }
    }

    /// Force both sockets closed when the price feed stalls; the streams'
    /// own reconnect loops take it from there.
    fn stale_price_watchdog(&self) {
        if self.price.is_stale(STALE_PRICE_THRESHOLD) {
            warn!(
                threshold_secs = STALE_PRICE_THRESHOLD.as_secs(),
                "market price is stale; forcing stream reconnect"
            );
            self.market_force.notify_waiters();
            self.account_force.notify_waiters();
            // Re-arm the watchdog so it does not fire every tick.
            self.price.touch();
        }
    }

    /// Account/position/pending sync plus auto-exit, auto-add and
    /// auto-margin evaluation, and the UI snapshot emits.
    async fn account_sync(self: &Arc<Self>) {
        let config = self.config.read().clone();
        let symbol = config.trading.symbol.clone();
        let Some(spec) = self.spec.read().clone() else {
            return;
        };

        // Balance: WebSocket pushes are authoritative while fresh.
        if !self.account.lock().is_ws_fresh() {
            match self.rest.fetch_balance().await {
                Ok(balance) => {
                    let mut account = self.account.lock();
                    account.total_equity = balance.total_equity;
                    account.available = balance.available;
                    account.balance = balance.balance;
                }
                Err(e) => debug!(error = %e, "balance poll failed"),
            }
        }
        let (total_equity, available, balance) = {
            let account = self.account.lock();
            (account.total_equity, account.available, account.balance)
        };

        // Positions.
        let positions = match self.rest.fetch_positions(&symbol).await {
            Ok(positions) => positions,
            Err(e) => {
                debug!(error = %e, "position poll failed");
                return;
            }
        };
        let actions =
            self.book
                .apply_position_push(config.trading.direction, &positions, self.price.latest());

        let mut position_notional = Decimal::ZERO;
        let mut unrealized = Decimal::ZERO;
        for position in positions.iter().filter(|p| p.is_open()) {
            let notional =
                position.quantity().abs() * position.avg_price().inner() * spec.contract_size;
            // Session capital isolation: positions count into used notional
            // only while actively trading; PnL is always visible.
            if self.is_running() {
                position_notional += notional;
            }
            unrealized += position.unrealized_pnl();
        }

        // Pending orders: reconcile (adopt/prune), then account for them.
        match self.rest.fetch_pending_orders(&symbol).await {
            Ok(pending) => {
                let outcome = self.book.reconcile_pending(&pending);
                for id in &outcome.adopted {
                    info!(order_id = %id, "adopted untracked live order");
                }
                for id in &outcome.pruned {
                    debug!(order_id = %id, "pruned order no longer live");
                }
            }
            Err(e) => debug!(error = %e, "pending order poll failed"),
        }
        let pending_notional = self.book.pending_notional(spec.contract_size);

        // Capital snapshot.
        let inputs = CapitalInputs {
            total_equity,
            available_balance: available,
            position_notional,
            pending_notional,
            unrealized_pnl: unrealized,
        };
        let snapshot = compute_snapshot(&config.capital, config.trading.leverage, &inputs);
        if self.clamp.lock().observe(snapshot.clamped) {
            let message = format!(
                "Safety clamp: max allowed used ({}) capped by total equity ({})",
                config.capital.max_allowed_used, snapshot.total_equity
            );
            warn!("{message}");
            self.events.console("warning", message);
        }
        *self.last_snapshot.lock() = snapshot;

        self.dispatch_actions(actions);

        // Auto-exit: first matching rule wins; concurrent triggers collapse
        // on the executor's in-flight flag.
        if let Some(rule) = evaluate_auto_exit(&config.exits.auto, &config.auto_add, &snapshot) {
            if !self.executor.exit_in_flight.is_engaged() {
                let reason = format!("auto-exit: {rule}");
                warn!(%reason, net_profit = %snapshot.net_profit, "auto-exit triggered");
                self.events.notice(NoticeKind::Warning, reason.clone());
                let this = self.clone();
                tokio::spawn(async move {
                    let config = this.config.read().clone();
                    this.executor
                        .execute_authoritative_exit(&config, &this.book, &reason)
                        .await;
                });
            }
        } else if self.is_running() && !self.executor.exit_in_flight.is_engaged() {
            // Auto-add is evaluated only when no exit is pending this tick.
            self.evaluate_auto_adds(&config, &spec, &snapshot).await;
        }

        self.auto_margin_guard(&config, &positions).await;

        // UI snapshots.
        self.emit_trades_update(&config, spec.contract_size);
        self.emit_position_update();
        let requirement = auto_add_requirement(&config.auto_add, &snapshot);
        let pending_count = self.book.pending_ids().len() as u64;
        let (trade_profit, trade_loss, trade_net) = {
            let stats = self.stats.lock();
            (
                stats.total_trade_profit(),
                stats.total_trade_loss(),
                stats.net_trade_profit(),
            )
        };
        self.events.emit(EngineEvent::AccountUpdate {
            total_capital: dec_f64(snapshot.total_equity),
            total_balance: dec_f64(balance),
            available_balance: dec_f64(available),
            max_allowed_used_display: dec_f64(snapshot.max_allowed_margin),
            max_amount_display: dec_f64(snapshot.max_amount_margin),
            used_amount: dec_f64(snapshot.used_notional),
            size_amount: dec_f64(snapshot.position_notional),
            remaining_amount: dec_f64(snapshot.remaining_notional),
            trade_fees: dec_f64(snapshot.trade_fees),
            net_profit: dec_f64(snapshot.net_profit),
            total_trade_profit: dec_f64(trade_profit),
            total_trade_loss: dec_f64(trade_loss),
            net_trade_profit: dec_f64(trade_net),
            total_trades: self.trade_counter.load(Ordering::SeqCst) + pending_count,
            need_add_usdt: dec_f64(requirement.need_profit_target),
            need_add_above_zero: dec_f64(requirement.need_above_zero),
        });

        debug!(
            used = %snapshot.used_notional,
            size = %snapshot.position_notional,
            pending = pending_count,
            "account sync complete"
        );
    }

    async fn evaluate_auto_adds(
        self: &Arc<Self>,
        config: &EngineConfig,
        spec: &InstrumentSpec,
        snapshot: &CapitalSnapshot,
    ) {
        let Some(market) = self.price.latest() else {
            return;
        };
        for side in PosSide::BOTH {
            let view = self.book.side_view(side);
            if !view.position.in_position {
                continue;
            }
            let Some(order) = evaluate_auto_add(
                &config.auto_add,
                snapshot,
                side,
                view.position.entry_price,
                market,
                config.trading.leverage,
                view.add_count,
                view.add_used_notional,
                config.capital.min_order_amount,
            ) else {
                continue;
            };

            let qty = spec.contracts_for_notional(order.notional, market);
            if qty < spec.min_order_qty {
                continue;
            }
            warn!(
                side = %side,
                notional = %order.notional,
                margin = %order.margin_cost,
                "auto-add: averaging into losing position"
            );
            self.events.console(
                "warning",
                format!(
                    "Auto-add: {} notional {} (margin {})",
                    side, order.notional, order.margin_cost
                ),
            );
            if self
                .executor
                .place_market_add(config, side, qty)
                .await
                .is_some()
            {
                self.book.record_add(side, order.notional);
                // The next sync detects the quantity change and resyncs the
                // reduce-only exits to the new break-even.
            }
        }
    }

    /// Isolated positions whose liquidation price has crossed the SL line
    /// get margin added to push liquidation back out.
    async fn auto_margin_guard(&self, config: &EngineConfig, positions: &[okto_rest::RawPosition]) {
        if !config.margin_guard.use_auto_margin {
            return;
        }
        for position in positions.iter().filter(|p| p.is_open()) {
            if position.mgn_mode != "isolated" {
                continue;
            }
            let liq = position.liquidation_price();
            if !liq.is_positive() {
                continue;
            }
            let side = resolve_side(
                &position.pos_side,
                Some(position.quantity()),
                config.trading.direction,
            );
            let view = self.book.side_view(side);
            let Some(sl) = view.sl_price else { continue };
            if sl.is_zero() {
                continue;
            }
            let in_danger = match side {
                PosSide::Long => liq >= sl,
                PosSide::Short => liq <= sl,
            };
            if !in_danger {
                continue;
            }
            let amount =
                (sl.inner() - liq.inner()).abs() + config.margin_guard.auto_margin_offset;
            warn!(
                side = %side,
                liq = %liq,
                sl = %sl,
                amount = %amount,
                "auto-margin: liquidation too close to stop; adding margin"
            );
            match self
                .rest
                .add_margin(&config.trading.symbol, &position.pos_side, amount)
                .await
            {
                Ok(true) => info!(side = %side, amount = %amount, "margin added"),
                Ok(false) => warn!(side = %side, "margin adjustment rejected"),
                Err(e) => warn!(side = %side, error = %e, "margin adjustment failed"),
            }
        }
    }

    /// Rebuild realized-PnL figures from recent fills and snapshot the
    /// daily report.
    async fn reconcile_realized_pnl(&self) {
        if !self.is_running() {
            return;
        }
        let symbol = self.config.read().trading.symbol.clone();
        let fills = match self.rest.fetch_fills(&symbol, 100).await {
            Ok(fills) => fills,
            Err(e) => {
                debug!(error = %e, "fills poll failed");
                return;
            }
        };
        let total_equity = self.account.lock().total_equity;
        let mut stats = self.stats.lock();
        stats.apply_fills(fills.iter().map(|f| (f.timestamp_ms(), f.net_pnl())));
        stats.maybe_daily_report(total_equity, Utc::now());
    }

    fn emit_trades_update(&self, config: &EngineConfig, contract_size: Decimal) {
        let cancel_secs = config.cancellation.cancel_unfilled_seconds as i64;
        let now = Utc::now();
        let trades: Vec<PendingTradeView> = self
            .book
            .pending_entries()
            .into_iter()
            .map(|entry| {
                let elapsed = (now - entry.placed_at).num_seconds();
                PendingTradeView {
                    id: entry.order_id.clone(),
                    side: entry.side.as_str().to_string(),
                    entry_price: dec_f64(entry.limit_price.inner()),
                    stake: dec_f64(entry.quantity.notional(entry.limit_price, contract_size)),
                    status: entry.status.as_str().to_string(),
                    time_left_secs: Some((cancel_secs - elapsed).max(0)),
                }
            })
            .collect();
        self.events.emit(EngineEvent::TradesUpdate { trades });
    }

    fn emit_position_update(&self) {
        let view_of = |side: PosSide| -> PositionView {
            let view = self.book.side_view(side);
            PositionView {
                in_position: view.position.in_position,
                entry_price: dec_f64(view.position.entry_price.inner()),
                quantity: dec_f64(view.position.quantity.inner()),
                liquidation_price: dec_f64(view.position.liquidation_price.inner()),
                take_profit: view.tp_price.map(|p| dec_f64(p.inner())).unwrap_or(0.0),
                stop_loss: view.sl_price.map(|p| dec_f64(p.inner())).unwrap_or(0.0),
            }
        };
        let long = view_of(PosSide::Long);
        let short = view_of(PosSide::Short);
        let display_side = if long.in_position || !short.in_position {
            PosSide::Long
        } else {
            PosSide::Short
        };
        self.events.emit(EngineEvent::PositionUpdate {
            side: display_side.as_str().to_string(),
            long,
            short,
        });
    }

    // ========================================================================
    // Entry loop
    // ========================================================================

    /// Evaluate entry conditions and place staggered batches. The loop
    /// interval throttles placement deterministically: after a pass it
    /// sleeps the full interval, and after a miss it backs out to the
    /// outer wait.
    async fn run_entry_loop(self: Arc<Self>) {
        debug!("entry loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !self.is_running() || !self.gate.is_ready() {
                if !self.idle(Duration::from_secs(1)).await {
                    break;
                }
                continue;
            }

            let loop_time = {
                let config = self.config.read();
                Duration::from_secs(config.entry.loop_time_seconds.max(1))
            };

            // Inner loop: keep placing while signals pass.
            loop {
                if !self.is_running() || self.shutdown.is_cancelled() {
                    break;
                }
                let Some(market) = self.price.latest() else {
                    warn!("no market price yet; waiting for data");
                    if !self.idle(Duration::from_secs(5)).await {
                        break;
                    }
                    continue;
                };

                let config = self.config.read().clone();
                let snapshot = *self.last_snapshot.lock();
                let candle = self.candles.lock().latest().copied();
                info!("checking entry conditions");
                let signals = check_entry_conditions(
                    &config.entry,
                    &config.capital,
                    config.trading.direction,
                    market,
                    &snapshot,
                    candle.as_ref(),
                );

                if signals.is_empty() {
                    info!("no passing signals this cycle");
                    break;
                }
                for signal in signals {
                    self.place_entry_batch(&config, signal).await;
                }
                info!(secs = loop_time.as_secs(), "post-entry wait");
                if !self.idle(loop_time).await {
                    break;
                }
            }

            if !self.idle(loop_time_of(&self.config)).await {
                break;
            }
        }
        debug!("entry loop stopped");
    }

    /// Place one batch of staggered limit entries for a signal, re-checking
    /// remaining budget for every member.
    async fn place_entry_batch(self: &Arc<Self>, config: &EngineConfig, signal: EntrySignal) {
        let Some(spec) = self.spec.read().clone() else {
            return;
        };
        let batch = self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(batch, side = %signal.side, "placing order batch");

        for index in 0..config.entry.batch_size_per_loop {
            let limit_price = batch_limit_price(
                signal.limit_price,
                signal.signal,
                index,
                config.entry.batch_offset,
            );
            if !limit_price.is_positive() {
                continue;
            }

            // Precise remaining capacity at this instant.
            let snapshot = *self.last_snapshot.lock();
            let pending_notional = self.book.pending_notional(spec.contract_size);
            let remaining = (snapshot.max_notional_capacity
                - snapshot.position_notional
                - pending_notional)
                .max(Decimal::ZERO);
            if remaining < config.capital.min_order_amount {
                info!(
                    batch,
                    member = index + 1,
                    remaining = %remaining,
                    "batch member skipped: remaining below minimum"
                );
                break;
            }

            let trade_amount = config.capital.target_order_amount.min(remaining);
            let mut qty = spec.contracts_for_notional(trade_amount, limit_price);
            if qty < spec.min_order_qty {
                // The minimum order still has to fit the remaining budget.
                if spec.min_order_notional(limit_price) <= remaining {
                    qty = spec.min_order_qty;
                } else {
                    continue;
                }
            }

            let (tp, sl) = crate::book::exit_prices(
                signal.side,
                limit_price,
                config.exits.tp_price_offset,
                config.exits.sl_price_offset,
            );
            let market = self.price.latest().unwrap_or(limit_price);
            info!(
                "Batch{batch}-{member}: M:{market}|En:{limit_price}|Tp:{tp}|SL:{sl}|{amount}|{side}|{mode}",
                member = index + 1,
                tp = tp.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                sl = sl.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                amount = trade_amount,
                side = signal.side,
                mode = config.trading.margin_mode,
            );

            let Some(order_id) = self
                .executor
                .place_entry(config, signal.side, qty, limit_price, tp, sl)
                .await
            else {
                error!(batch, member = index + 1, "entry placement failed");
                continue;
            };

            self.book.register_pending(PendingEntry {
                order_id,
                side: signal.side,
                signal: signal.signal,
                limit_price,
                quantity: qty,
                placed_at: Utc::now(),
                status: crate::book::EntryStatus::New,
                cumulative_filled: Size::ZERO,
            });

            if index + 1 < config.entry.batch_size_per_loop {
                tokio::time::sleep(BATCH_MEMBER_DELAY).await;
            }
        }

        // Immediate refresh so the next decisions and the dashboard see the
        // new pending orders without waiting for the sync tick.
        let this = self.clone();
        tokio::spawn(async move { this.account_sync().await });
    }
}

fn loop_time_of(config: &Arc<RwLock<EngineConfig>>) -> Duration {
    Duration::from_secs(config.read().entry.loop_time_seconds.max(1))
}

fn dec_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn test_new_builds_idle_engine() {
        let (supervisor, _rx) = TradingSupervisor::new(EngineConfig::default(), None).unwrap();
        assert!(!supervisor.is_running());
        // Shutdown is safe before any loop ever started.
        supervisor.shutdown();
        assert!(supervisor.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_only_disables_entries() {
        let (supervisor, _rx) = TradingSupervisor::new(EngineConfig::default(), None).unwrap();
        supervisor.is_running.store(true, Ordering::SeqCst);
        supervisor.stop();
        assert!(!supervisor.is_running());
        // Background infrastructure is not cancelled by stop.
        assert!(!supervisor.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_live_update_blocks_symbol_change_with_position() {
        let (supervisor, _rx) = TradingSupervisor::new(EngineConfig::default(), None).unwrap();

        // Fake an open long so the symbol change must be refused.
        let rows = vec![serde_json::from_value::<okto_rest::RawPosition>(serde_json::json!({
            "instId": "ETH-USDT-SWAP",
            "posSide": "long",
            "pos": "3",
            "avgPx": "2980"
        }))
        .unwrap()];
        supervisor.book.apply_position_push(
            okto_core::TradeDirection::Both,
            &rows,
            None,
        );

        let mut new_config = EngineConfig::default();
        new_config.trading.symbol = "SOL-USDT-SWAP".to_string();
        let outcome = supervisor.apply_live_config_update(new_config).await;
        assert!(outcome.success);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("blocked"));
        // Config reverted to the original symbol.
        assert_eq!(supervisor.config.read().trading.symbol, "ETH-USDT-SWAP");
    }

    #[tokio::test]
    async fn test_account_figures_freshness_window() {
        let figures = AccountFigures {
            ws_updated_at: Some(Instant::now()),
            ..Default::default()
        };
        assert!(figures.is_ws_fresh());
        let stale = AccountFigures::default();
        assert!(!stale.is_ws_fresh());
    }
}
