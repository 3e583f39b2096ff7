//! Order execution: entries, conditional exits, cancels, and the
//! authoritative exit sweep.
//!
//! Every cancel treats exchange code 51001 (already filled/canceled) as
//! success, and a failed cancel never blocks the caller's state cleanup.
//! The authoritative exit is the single path that guarantees a clean
//! account: it trusts only live exchange state, closes everything found,
//! and resets local tracking.

use crate::book::{ExitKind, PositionBook, TriggerFlag};
use crate::config::EngineConfig;
use crate::events::{EventBus, NoticeKind};
use okto_core::{resolve_side, InstrumentSpec, PosSide, Price, Size};
use okto_rest::{AlgoOrderRequest, OrderRequest, RawPosition, RestClient};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Places and cancels orders against the exchange.
pub struct OrderExecutor {
    rest: Arc<RestClient>,
    events: EventBus,
    spec: Arc<RwLock<Option<InstrumentSpec>>>,
    /// Collapses concurrent authoritative-exit triggers into one run.
    pub exit_in_flight: TriggerFlag,
}

impl OrderExecutor {
    pub fn new(
        rest: Arc<RestClient>,
        events: EventBus,
        spec: Arc<RwLock<Option<InstrumentSpec>>>,
    ) -> Self {
        Self {
            rest,
            events,
            spec,
            exit_in_flight: TriggerFlag::default(),
        }
    }

    fn spec(&self) -> Option<InstrumentSpec> {
        self.spec.read().clone()
    }

    /// posSide for order bodies: explicit side in hedge mode, omitted in
    /// net mode.
    fn pos_side_value(config: &EngineConfig, side: PosSide) -> Option<String> {
        config
            .trading
            .position_mode
            .is_hedged()
            .then(|| side.as_str().to_string())
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Place a limit entry, optionally with exchange-native attached TP/SL.
    ///
    /// The quantity must already be rounded to lot size; the minimum-qty
    /// budget check is the caller's sizing decision.
    pub async fn place_entry(
        &self,
        config: &EngineConfig,
        side: PosSide,
        qty: Size,
        limit_price: Price,
        tp_price: Option<Price>,
        sl_price: Option<Price>,
    ) -> Option<String> {
        let spec = self.spec()?;
        let request = OrderRequest {
            inst_id: config.trading.symbol.clone(),
            td_mode: config.trading.margin_mode.as_str().to_string(),
            side: side.entry_order_side().as_str().to_string(),
            ord_type: "limit".to_string(),
            sz: spec.format_qty(qty),
            px: Some(spec.format_price(limit_price)),
            pos_side: Self::pos_side_value(config, side),
            reduce_only: false,
            attach_tp_trigger: tp_price.map(|p| spec.format_price(p)),
            attach_sl_trigger: sl_price.map(|p| spec.format_price(p)),
        };

        match self.rest.place_order(&request).await {
            Ok(ack) if ack.accepted() => {
                info!(
                    side = %side,
                    qty = %request.sz,
                    px = %limit_price,
                    ord_id = ack.ord_id.as_deref().unwrap_or_default(),
                    "entry order placed"
                );
                ack.ord_id
            }
            Ok(ack) => {
                error!(side = %side, code = %ack.code, msg = %ack.msg, "entry order rejected");
                None
            }
            Err(e) => {
                error!(side = %side, error = %e, "entry order failed");
                None
            }
        }
    }

    /// Place a market order that adds to an existing position (averaging).
    pub async fn place_market_add(
        &self,
        config: &EngineConfig,
        side: PosSide,
        qty: Size,
    ) -> Option<String> {
        let spec = self.spec()?;
        let request = OrderRequest {
            inst_id: config.trading.symbol.clone(),
            td_mode: config.trading.margin_mode.as_str().to_string(),
            side: side.entry_order_side().as_str().to_string(),
            ord_type: "market".to_string(),
            sz: spec.format_qty(qty),
            px: None,
            pos_side: Self::pos_side_value(config, side),
            reduce_only: false,
            attach_tp_trigger: None,
            attach_sl_trigger: None,
        };

        match self.rest.place_order(&request).await {
            Ok(ack) if ack.accepted() => {
                info!(side = %side, qty = %request.sz, "market add placed");
                ack.ord_id
            }
            Ok(ack) => {
                error!(side = %side, code = %ack.code, msg = %ack.msg, "market add rejected");
                None
            }
            Err(e) => {
                error!(side = %side, error = %e, "market add failed");
                None
            }
        }
    }

    // ========================================================================
    // Conditional exits
    // ========================================================================

    /// Place a reduce-only conditional TP or SL order.
    pub async fn place_algo_exit(
        &self,
        config: &EngineConfig,
        side: PosSide,
        kind: ExitKind,
        trigger_price: Price,
        qty: Size,
    ) -> Option<String> {
        let spec = self.spec()?;
        let pos_side = if config.trading.position_mode.is_hedged() {
            side.as_str().to_string()
        } else {
            "net".to_string()
        };
        let trigger = spec.format_price(trigger_price);
        let request = AlgoOrderRequest {
            inst_id: config.trading.symbol.clone(),
            td_mode: config.trading.margin_mode.as_str().to_string(),
            side: side.exit_order_side().as_str().to_string(),
            pos_side,
            sz: spec.format_qty(qty),
            tp_trigger_px: (kind == ExitKind::TakeProfit).then(|| trigger.clone()),
            sl_trigger_px: (kind == ExitKind::StopLoss).then(|| trigger.clone()),
            trigger_px_type: config.exits.trigger_price_type.clone(),
            ord_px: "-1".to_string(),
        };

        match self.rest.place_algo_order(&request).await {
            Ok(ack) if ack.accepted() => {
                info!(side = %side, kind = kind.as_str(), trigger = %trigger, "exit order placed");
                ack.ord_id
            }
            Ok(ack) => {
                error!(
                    side = %side,
                    kind = kind.as_str(),
                    code = %ack.code,
                    msg = %ack.msg,
                    "exit order rejected"
                );
                None
            }
            Err(e) => {
                error!(side = %side, kind = kind.as_str(), error = %e, "exit order failed");
                None
            }
        }
    }

    /// Attach TP/SL for a freshly confirmed position, skipping legs the
    /// exchange already attached atomically at entry. Returns the failed
    /// leg on error so the caller can fail safe.
    pub async fn attach_exits(
        &self,
        config: &EngineConfig,
        book: &PositionBook,
        side: PosSide,
        tp_price: Option<Price>,
        sl_price: Option<Price>,
        qty: Size,
    ) -> Result<(), ExitKind> {
        let (existing_tp, existing_sl) = self.existing_exit_legs(config, side).await;

        if let Some(tp) = tp_price {
            if existing_tp {
                info!(side = %side, "TP already attached at entry; skipping");
            } else {
                let exit_qty = qty.abs() * (config.exits.tp_size_percent / Decimal::ONE_HUNDRED);
                match self
                    .place_algo_exit(config, side, ExitKind::TakeProfit, tp, exit_qty)
                    .await
                {
                    Some(id) => book.set_exit_order(side, ExitKind::TakeProfit, id, tp),
                    None => return Err(ExitKind::TakeProfit),
                }
            }
        }
        if let Some(sl) = sl_price {
            if existing_sl {
                info!(side = %side, "SL already attached at entry; skipping");
            } else {
                let exit_qty = qty.abs() * (config.exits.sl_size_percent / Decimal::ONE_HUNDRED);
                match self
                    .place_algo_exit(config, side, ExitKind::StopLoss, sl, exit_qty)
                    .await
                {
                    Some(id) => book.set_exit_order(side, ExitKind::StopLoss, id, sl),
                    None => return Err(ExitKind::StopLoss),
                }
            }
        }
        Ok(())
    }

    /// Whether live conditional orders already cover the TP/SL legs for a
    /// side (exchange-native attach at entry).
    async fn existing_exit_legs(&self, config: &EngineConfig, side: PosSide) -> (bool, bool) {
        let exit_side = side.exit_order_side().as_str();
        match self
            .rest
            .fetch_pending_algo_orders(&config.trading.symbol)
            .await
        {
            Ok(orders) => {
                let mut has_tp = false;
                let mut has_sl = false;
                for order in orders.iter().filter(|o| o.side == exit_side) {
                    has_tp |= order.has_tp();
                    has_sl |= order.has_sl();
                }
                (has_tp, has_sl)
            }
            Err(e) => {
                warn!(error = %e, "existing TP/SL check failed; assuming none");
                (false, false)
            }
        }
    }

    // ========================================================================
    // Cancels
    // ========================================================================

    /// Cancel a limit order, best-effort. 51001 counts as success.
    pub async fn cancel_entry(&self, inst_id: &str, ord_id: &str, reason: &str) -> bool {
        info!(ord_id, reason, "cancelling entry order");
        match self.rest.cancel_order(inst_id, ord_id).await {
            Ok(ack) if ack.is_gone() => true,
            Ok(ack) => {
                debug!(ord_id, code = %ack.code, msg = %ack.msg, "cancel rejected, continuing");
                false
            }
            Err(e) => {
                debug!(ord_id, error = %e, "cancel failed, continuing");
                false
            }
        }
    }

    /// Cancel a conditional order, best-effort.
    pub async fn cancel_algo(&self, inst_id: &str, algo_id: &str) -> bool {
        debug!(algo_id, "cancelling algo order");
        match self.rest.cancel_algo_order(inst_id, algo_id).await {
            Ok(ack) if ack.is_gone() => true,
            Ok(ack) => {
                debug!(algo_id, code = %ack.code, msg = %ack.msg, "algo cancel rejected, continuing");
                false
            }
            Err(e) => {
                debug!(algo_id, error = %e, "algo cancel failed, continuing");
                false
            }
        }
    }

    /// Cancel every pending limit and conditional order for the instrument.
    pub async fn sweep_cancel_all(&self, config: &EngineConfig) -> u32 {
        let inst_id = &config.trading.symbol;
        let mut cancelled = 0u32;

        if let Ok(orders) = self.rest.fetch_pending_orders(inst_id).await {
            for order in orders {
                if !order.ord_id.is_empty()
                    && self.cancel_entry(inst_id, &order.ord_id, "sweep").await
                {
                    cancelled += 1;
                }
            }
        }
        if let Ok(orders) = self.rest.fetch_pending_algo_orders(inst_id).await {
            for order in orders {
                if !order.algo_id.is_empty() && self.cancel_algo(inst_id, &order.algo_id).await {
                    cancelled += 1;
                }
            }
        }

        if cancelled > 0 {
            info!(cancelled, "sweep cancelled pending orders");
        }
        cancelled
    }

    // ========================================================================
    // Closes
    // ========================================================================

    /// Market-close one live position row, addressing it with its own
    /// margin mode and posSide as reported by the exchange.
    pub async fn market_close_position(
        &self,
        config: &EngineConfig,
        position: &RawPosition,
    ) -> bool {
        let Some(spec) = self.spec() else {
            return false;
        };
        let qty = position.quantity();
        if qty.is_zero() {
            return true;
        }
        let close_side = if qty.is_sign_negative() { "buy" } else { "sell" };
        let td_mode = if position.mgn_mode.is_empty() {
            config.trading.margin_mode.as_str().to_string()
        } else {
            position.mgn_mode.clone()
        };
        let pos_side = if position.pos_side.is_empty() {
            None
        } else {
            Some(position.pos_side.clone())
        };

        let request = OrderRequest {
            inst_id: config.trading.symbol.clone(),
            td_mode,
            side: close_side.to_string(),
            ord_type: "market".to_string(),
            sz: spec.format_qty(Size::new(qty.abs())),
            px: None,
            pos_side,
            reduce_only: true,
            attach_tp_trigger: None,
            attach_sl_trigger: None,
        };

        match self.rest.place_order(&request).await {
            Ok(ack) if ack.accepted() => {
                info!(
                    pos_side = %position.pos_side,
                    qty = %qty.abs(),
                    "position market-closed"
                );
                true
            }
            Ok(ack) => {
                warn!(code = %ack.code, msg = %ack.msg, "market close rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "market close failed");
                false
            }
        }
    }

    /// The authoritative exit: fetch live positions directly from the
    /// exchange, market-close every nonzero position found (tracked or
    /// not), sweep-cancel every pending limit and algo order, then reset
    /// all local tracking to flat.
    ///
    /// Concurrent triggers collapse into one execution; later callers
    /// observe "already in progress" and return immediately.
    pub async fn execute_authoritative_exit(
        &self,
        config: &EngineConfig,
        book: &PositionBook,
        reason: &str,
    ) -> bool {
        if !self.exit_in_flight.try_engage() {
            debug!(reason, "authoritative exit already in progress");
            return false;
        }

        info!(reason, symbol = %config.trading.symbol, "authoritative exit started");
        self.events
            .notice(NoticeKind::Warning, format!("Authoritative exit: {reason}"));

        match self.rest.fetch_positions(&config.trading.symbol).await {
            Ok(positions) => {
                for position in positions.iter().filter(|p| p.is_open()) {
                    self.market_close_position(config, position).await;
                }
            }
            Err(e) => {
                error!(error = %e, "authoritative exit could not fetch positions");
            }
        }

        self.sweep_cancel_all(config).await;
        book.reset_all(reason);

        self.exit_in_flight.release();
        info!("authoritative exit complete");
        self.events
            .notice(NoticeKind::Success, "Authoritative exit complete");
        true
    }

    // ========================================================================
    // Batch TP/SL resync
    // ========================================================================

    /// Re-sync every live side's TP/SL to its current average entry price:
    /// cancel the side's conditional orders, place fresh reduce-only ones,
    /// and update tracked prices.
    pub async fn batch_modify_tpsl(&self, config: &EngineConfig, book: &PositionBook) -> u32 {
        let inst_id = config.trading.symbol.clone();
        let positions = match self.rest.fetch_positions(&inst_id).await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "TP/SL resync could not fetch positions");
                self.events
                    .notice(NoticeKind::Error, "TP/SL resync failed: positions unavailable");
                return 0;
            }
        };

        let mut modified = 0u32;
        for position in positions.iter().filter(|p| p.is_open()) {
            let avg_px = position.avg_price();
            if avg_px.is_zero() {
                continue;
            }
            let side = resolve_side(
                &position.pos_side,
                Some(position.quantity()),
                config.trading.direction,
            );
            let (tp, sl) = crate::book::exit_prices(
                side,
                avg_px,
                config.exits.tp_price_offset,
                config.exits.sl_price_offset,
            );
            if tp.is_none() && sl.is_none() {
                debug!(side = %side, "no exit offsets configured; resync skipped");
                continue;
            }

            // Cancel the side's live conditional orders before replacing.
            if let Ok(algos) = self.rest.fetch_pending_algo_orders(&inst_id).await {
                for algo in algos.iter().filter(|a| a.pos_side == position.pos_side) {
                    self.cancel_algo(&inst_id, &algo.algo_id).await;
                }
            }
            book.take_exit_orders(side);

            let qty = Size::new(position.quantity().abs());
            if let Some(tp) = tp {
                let exit_qty = qty * (config.exits.tp_size_percent / Decimal::ONE_HUNDRED);
                if let Some(id) = self
                    .place_algo_exit(config, side, ExitKind::TakeProfit, tp, exit_qty)
                    .await
                {
                    book.set_exit_order(side, ExitKind::TakeProfit, id, tp);
                    info!(side = %side, tp = %tp, "TP resynced");
                }
            }
            if let Some(sl) = sl {
                let exit_qty = qty * (config.exits.sl_size_percent / Decimal::ONE_HUNDRED);
                if let Some(id) = self
                    .place_algo_exit(config, side, ExitKind::StopLoss, sl, exit_qty)
                    .await
                {
                    book.set_exit_order(side, ExitKind::StopLoss, id, sl);
                    info!(side = %side, sl = %sl, "SL resynced");
                }
            }
            modified += 1;
        }

        if modified > 0 {
            info!(modified, "TP/SL resynced for live sides");
        }
        modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use okto_core::PositionMode;
    use okto_rest::Credentials;

    #[test]
    fn test_pos_side_only_in_hedge_mode() {
        let mut config = EngineConfig::default();
        config.trading.position_mode = PositionMode::Net;
        assert_eq!(OrderExecutor::pos_side_value(&config, PosSide::Long), None);

        config.trading.position_mode = PositionMode::LongShort;
        assert_eq!(
            OrderExecutor::pos_side_value(&config, PosSide::Short),
            Some("short".to_string())
        );
    }

    #[tokio::test]
    async fn test_authoritative_exit_collapses_concurrent_triggers() {
        let (events, _rx) = EventBus::channel();
        let rest = Arc::new(
            RestClient::with_base_url("http://127.0.0.1:1", Credentials::new("k", "s", "p", false))
                .unwrap(),
        );
        let executor = OrderExecutor::new(rest, events, Arc::new(RwLock::new(None)));
        let book = PositionBook::new();
        let config = EngineConfig::default();

        // Simulate an exit already in flight: the second trigger observes
        // "in progress" and returns immediately, touching nothing.
        assert!(executor.exit_in_flight.try_engage());
        assert!(
            !executor
                .execute_authoritative_exit(&config, &book, "duplicate trigger")
                .await
        );
        assert!(executor.exit_in_flight.is_engaged());
    }
}
