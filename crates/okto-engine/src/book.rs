//! The position book: authoritative in-memory view of per-side positions,
//! pending entries, and attached exit orders.
//!
//! This module is the only writer of that state. It performs no I/O: every
//! operation folds exchange-sourced data in under one lock and returns the
//! actions the supervisor must drive (confirmation polls, TP/SL handlers,
//! exit resyncs). An order being accepted never creates a position here;
//! only a confirmed nonzero position from the exchange does.

use chrono::{DateTime, TimeZone, Utc};
use okto_core::{resolve_side, PosSide, Price, Size, TradeDirection};
use okto_rest::{RawPendingOrder, RawPosition};
use okto_ws::RawOrderUpdate;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Confirmation poll delay after a full fill report.
pub const CONFIRM_DELAY_FILLED_SECS: u64 = 2;
/// Confirmation poll delay after a partial fill report (it may still grow).
pub const CONFIRM_DELAY_PARTIAL_SECS: u64 = 5;

/// At-most-once dispatch flag for a handler kind.
///
/// `try_engage` wins exactly once until `release`; a second event for the
/// same kind while a handler is in flight is a no-op.
#[derive(Debug, Default)]
pub struct TriggerFlag {
    engaged: Mutex<bool>,
}

impl TriggerFlag {
    pub fn try_engage(&self) -> bool {
        let mut engaged = self.engaged.lock();
        if *engaged {
            false
        } else {
            *engaged = true;
            true
        }
    }

    pub fn release(&self) {
        *self.engaged.lock() = false;
    }

    pub fn is_engaged(&self) -> bool {
        *self.engaged.lock()
    }
}

/// Pending entry lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
}

impl EntryStatus {
    pub fn from_wire(state: &str) -> Self {
        match state {
            "filled" => Self::Filled,
            "partially_filled" => Self::PartiallyFilled,
            "canceled" | "mmp_canceled" => Self::Canceled,
            "failed" | "rejected" => Self::Failed,
            _ => Self::New,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

/// One tracked entry order. The order-id map is the sole source of truth
/// for "orders we are watching".
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub order_id: String,
    pub side: PosSide,
    /// +1 long, -1 short.
    pub signal: i8,
    pub limit_price: Price,
    /// Contracts requested.
    pub quantity: Size,
    pub placed_at: DateTime<Utc>,
    pub status: EntryStatus,
    pub cumulative_filled: Size,
}

/// Exchange-confirmed position state for one side.
#[derive(Debug, Clone, Default)]
pub struct SidePosition {
    pub in_position: bool,
    pub entry_price: Price,
    /// Contracts; sign encodes direction only under net mode.
    pub quantity: Size,
    pub liquidation_price: Price,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
    pub margin_mode: String,
}

/// Live TP/SL order ids for one side. At most one of each.
#[derive(Debug, Clone, Default)]
pub struct ExitOrderSet {
    pub take_profit: Option<String>,
    pub stop_loss: Option<String>,
}

/// Per-side lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SidePhase {
    #[default]
    Flat,
    EntryPending,
    Active,
    ClosingViaTp,
    ClosingViaSl,
    ClosingViaAuthoritative,
}

/// How a closure was classified, best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    TakeProfit,
    StopLoss,
    Manual,
}

/// Actions the supervisor must drive after a book operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BookAction {
    /// Poll live positions after a debounce and promote if confirmed.
    ScheduleConfirm { order_id: String, delay_secs: u64 },
    /// A tracked entry ended without filling.
    EntryDiscarded { order_id: String, status: EntryStatus },
    /// The TP handler must run (flag already engaged).
    TpHit { side: PosSide },
    /// The SL handler must run (flag already engaged).
    SlHit { side: PosSide },
    /// A side closed outside the tracked TP/SL orders.
    SideClosed { side: PosSide, kind: CloseKind },
    /// Quantities changed; TP/SL orders need recomputation.
    ResyncExits,
}

/// Adoption/prune outcome of a pending-order reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub adopted: Vec<String>,
    pub pruned: Vec<String>,
}

/// A pending entry the cancellation sweep wants gone.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelCandidate {
    pub order_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
struct SideState {
    position: SidePosition,
    exits: ExitOrderSet,
    tp_price: Option<Price>,
    sl_price: Option<Price>,
    phase: SidePhase,
    add_count: u32,
    add_used_notional: Decimal,
}

#[derive(Debug, Default)]
struct BookInner {
    long: SideState,
    short: SideState,
    pending: HashMap<String, PendingEntry>,
}

impl BookInner {
    fn side_mut(&mut self, side: PosSide) -> &mut SideState {
        match side {
            PosSide::Long => &mut self.long,
            PosSide::Short => &mut self.short,
        }
    }

    fn side(&self, side: PosSide) -> &SideState {
        match side {
            PosSide::Long => &self.long,
            PosSide::Short => &self.short,
        }
    }
}

/// Read-only view of one side, for UI and decision inputs.
#[derive(Debug, Clone, Default)]
pub struct SideView {
    pub position: SidePosition,
    pub tp_price: Option<Price>,
    pub sl_price: Option<Price>,
    pub phase: SidePhase,
    pub add_count: u32,
    pub add_used_notional: Decimal,
    pub exits: ExitOrderSet,
}

/// The authoritative position/order book.
#[derive(Debug, Default)]
pub struct PositionBook {
    inner: Mutex<BookInner>,
    pub tp_hit: TriggerFlag,
    pub sl_hit: TriggerFlag,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Pending entries
    // ========================================================================

    /// Track a freshly accepted entry order.
    pub fn register_pending(&self, entry: PendingEntry) {
        let mut inner = self.inner.lock();
        let side = entry.side;
        inner.pending.insert(entry.order_id.clone(), entry);
        let state = inner.side_mut(side);
        if state.phase == SidePhase::Flat {
            state.phase = SidePhase::EntryPending;
        }
    }

    /// Drop a tracked entry. Returns whether it was known.
    pub fn remove_pending(&self, order_id: &str) -> bool {
        self.inner.lock().pending.remove(order_id).is_some()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.inner.lock().pending.keys().cloned().collect()
    }

    pub fn pending_entries(&self) -> Vec<PendingEntry> {
        self.inner.lock().pending.values().cloned().collect()
    }

    /// Session notional committed to pending entries.
    pub fn pending_notional(&self, contract_size: Decimal) -> Decimal {
        self.inner
            .lock()
            .pending
            .values()
            .map(|e| e.quantity.notional(e.limit_price, contract_size))
            .sum()
    }

    // ========================================================================
    // Stream/poll ingestion
    // ========================================================================

    /// Fold a positions push (or poll) into the book.
    ///
    /// Sides present with nonzero quantity are updated; a tracked side that
    /// vanished is a closure event, classified best-effort against the last
    /// known TP/SL prices and the current market price.
    pub fn apply_position_push(
        &self,
        direction: TradeDirection,
        rows: &[RawPosition],
        market: Option<Price>,
    ) -> Vec<BookAction> {
        let mut actions = Vec::new();
        let mut inner = self.inner.lock();
        let mut found = [false, false];

        for row in rows {
            let qty = row.quantity();
            if qty.is_zero() {
                continue;
            }
            let side = resolve_side(&row.pos_side, Some(qty), direction);
            found[side_index(side)] = true;

            let state = inner.side_mut(side);
            let previous_qty = state.position.quantity;
            state.position.in_position = true;
            state.position.entry_price = row.avg_price();
            state.position.quantity = Size::new(qty);
            state.position.liquidation_price = row.liquidation_price();
            state.position.unrealized_pnl = row.unrealized_pnl();
            state.position.leverage = row.leverage();
            state.position.margin_mode = row.mgn_mode.clone();
            if state.phase == SidePhase::Flat || state.phase == SidePhase::EntryPending {
                state.phase = SidePhase::Active;
            }

            let grew = (Size::new(qty).abs().inner() - previous_qty.abs().inner()).abs()
                > Decimal::new(1, 6);
            if grew {
                debug!(
                    side = %side,
                    prev = %previous_qty,
                    now = %qty,
                    "position quantity changed"
                );
                actions.push(BookAction::ResyncExits);
            }
        }

        for side in PosSide::BOTH {
            if found[side_index(side)] {
                continue;
            }
            let state = inner.side_mut(side);
            if !state.position.in_position {
                continue;
            }

            // nonzero -> zero transition: a closure event.
            let kind = classify_closure(side, state.tp_price, state.sl_price, market);
            info!(side = %side, ?kind, "position closure detected");

            state.position = SidePosition::default();
            state.add_count = 0;
            state.add_used_notional = Decimal::ZERO;
            state.phase = match kind {
                CloseKind::TakeProfit => SidePhase::ClosingViaTp,
                CloseKind::StopLoss => SidePhase::ClosingViaSl,
                CloseKind::Manual => SidePhase::Flat,
            };

            let action = match kind {
                CloseKind::StopLoss if self.sl_hit.try_engage() => BookAction::SlHit { side },
                CloseKind::TakeProfit if self.tp_hit.try_engage() => BookAction::TpHit { side },
                CloseKind::StopLoss | CloseKind::TakeProfit => continue,
                CloseKind::Manual => BookAction::SideClosed {
                    side,
                    kind: CloseKind::Manual,
                },
            };
            actions.push(action);
        }

        actions
    }

    /// Fold one order update in.
    ///
    /// A fill indication on a pending entry schedules a debounced
    /// confirmation poll rather than trusting the event alone (partial
    /// fills can still grow). Updates for tracked TP/SL ids fire their
    /// handler at most once while one is in flight.
    pub fn apply_order_update(&self, update: &RawOrderUpdate) -> Option<BookAction> {
        let status = EntryStatus::from_wire(&update.state);
        let id = update.tracking_id().to_string();
        let mut inner = self.inner.lock();

        // Tracked exit orders first: a fill there is a position exit.
        let filled = matches!(status, EntryStatus::Filled | EntryStatus::PartiallyFilled);
        let mut exit_match = None;
        if filled {
            for side in PosSide::BOTH {
                let state = inner.side(side);
                if state.exits.stop_loss.as_deref() == Some(id.as_str()) {
                    exit_match = Some((side, ExitKind::StopLoss));
                    break;
                }
                if state.exits.take_profit.as_deref() == Some(id.as_str()) {
                    exit_match = Some((side, ExitKind::TakeProfit));
                    break;
                }
            }
        }
        if let Some((side, kind)) = exit_match {
            return match kind {
                ExitKind::StopLoss => self.sl_hit.try_engage().then(|| {
                    inner.side_mut(side).phase = SidePhase::ClosingViaSl;
                    BookAction::SlHit { side }
                }),
                ExitKind::TakeProfit => self.tp_hit.try_engage().then(|| {
                    inner.side_mut(side).phase = SidePhase::ClosingViaTp;
                    BookAction::TpHit { side }
                }),
            };
        }

        // Pending entries.
        let entry = inner.pending.get_mut(&id)?;
        entry.status = status;
        entry.cumulative_filled = Size::new(update.filled_quantity());

        match status {
            EntryStatus::Filled => Some(BookAction::ScheduleConfirm {
                order_id: id,
                delay_secs: CONFIRM_DELAY_FILLED_SECS,
            }),
            EntryStatus::PartiallyFilled => Some(BookAction::ScheduleConfirm {
                order_id: id,
                delay_secs: CONFIRM_DELAY_PARTIAL_SECS,
            }),
            EntryStatus::New if !update.filled_quantity().is_zero() => {
                Some(BookAction::ScheduleConfirm {
                    order_id: id,
                    delay_secs: CONFIRM_DELAY_PARTIAL_SECS,
                })
            }
            EntryStatus::Canceled | EntryStatus::Failed => {
                inner.pending.remove(&id);
                Some(BookAction::EntryDiscarded {
                    order_id: id,
                    status,
                })
            }
            EntryStatus::New => None,
        }
    }

    /// Authoritative promotion after a confirmation poll found a live
    /// nonzero position. Returns false when the order was not tracked
    /// (already promoted by a concurrent confirmation).
    pub fn promote_confirmed(
        &self,
        order_id: &str,
        side: PosSide,
        entry_price: Price,
        quantity: Size,
        tp_price: Option<Price>,
        sl_price: Option<Price>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let was_tracked = inner.pending.remove(order_id).is_some();

        let state = inner.side_mut(side);
        state.position.in_position = true;
        state.position.entry_price = entry_price;
        state.position.quantity = quantity;
        state.tp_price = tp_price;
        state.sl_price = sl_price;
        state.phase = SidePhase::Active;
        was_tracked
    }

    /// Reconcile tracked pending entries against the exchange's live list.
    ///
    /// Unknown non-reduce-only live orders are adopted (timeout clocks come
    /// from the exchange creation time, surviving restarts); tracked ids no
    /// longer live are pruned without any position transition.
    pub fn reconcile_pending(&self, live: &[RawPendingOrder]) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut inner = self.inner.lock();

        for order in live {
            if order.is_reduce_only() || order.ord_id.is_empty() {
                continue;
            }
            if inner.pending.contains_key(&order.ord_id) {
                continue;
            }
            let signal: i8 = if order.side == "buy" { 1 } else { -1 };
            let side = if signal == 1 { PosSide::Long } else { PosSide::Short };
            let placed_at = order
                .created_ms()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            inner.pending.insert(
                order.ord_id.clone(),
                PendingEntry {
                    order_id: order.ord_id.clone(),
                    side,
                    signal,
                    limit_price: order.price(),
                    quantity: order.quantity(),
                    placed_at,
                    status: EntryStatus::from_wire(&order.state),
                    cumulative_filled: order.filled_quantity(),
                },
            );
            outcome.adopted.push(order.ord_id.clone());
        }

        let live_ids: std::collections::HashSet<&str> =
            live.iter().map(|o| o.ord_id.as_str()).collect();
        let stale: Vec<String> = inner
            .pending
            .keys()
            .filter(|id| !live_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            inner.pending.remove(&id);
            outcome.pruned.push(id);
        }

        if !outcome.adopted.is_empty() || !outcome.pruned.is_empty() {
            debug!(
                adopted = outcome.adopted.len(),
                pruned = outcome.pruned.len(),
                "pending reconciliation"
            );
        }
        outcome
    }

    /// Select pending entries the cancellation policy wants gone.
    ///
    /// Rules, in order: unfilled-timeout, entry-price-unfavorable (avoids a
    /// later taker execution), and the optional TP-passed rules (inherited
    /// polarity, off by default).
    pub fn cancellation_candidates(
        &self,
        config: &crate::config::CancellationConfig,
        tp_offset: Option<Decimal>,
        market: Price,
        now: DateTime<Utc>,
    ) -> Vec<CancelCandidate> {
        let inner = self.inner.lock();
        let mut candidates = Vec::new();

        for entry in inner.pending.values() {
            if entry.status.is_terminal() {
                continue;
            }
            let age_secs = (now - entry.placed_at).num_seconds();
            if age_secs > config.cancel_unfilled_seconds as i64 {
                candidates.push(CancelCandidate {
                    order_id: entry.order_id.clone(),
                    reason: format!(
                        "unfilled for {age_secs}s (limit {}s)",
                        config.cancel_unfilled_seconds
                    ),
                });
                continue;
            }

            let limit = entry.limit_price;
            let tp_passed = tp_offset.filter(|off| *off > Decimal::ZERO).is_some_and(|off| {
                if entry.signal == 1 {
                    market.inner() > limit.inner() + off
                } else {
                    market.inner() < limit.inner() - off
                }
            });

            if entry.signal == 1 {
                if config.cancel_on_entry_price_above_market && limit > market {
                    candidates.push(CancelCandidate {
                        order_id: entry.order_id.clone(),
                        reason: format!(
                            "long entry {limit} above market {market}"
                        ),
                    });
                    continue;
                }
                if config.cancel_on_tp_price_above_market && tp_passed {
                    candidates.push(CancelCandidate {
                        order_id: entry.order_id.clone(),
                        reason: "long: prospective TP passed before fill".to_string(),
                    });
                }
            } else {
                if config.cancel_on_entry_price_below_market && limit < market {
                    candidates.push(CancelCandidate {
                        order_id: entry.order_id.clone(),
                        reason: format!(
                            "short entry {limit} below market {market}"
                        ),
                    });
                    continue;
                }
                if config.cancel_on_tp_price_below_market && tp_passed {
                    candidates.push(CancelCandidate {
                        order_id: entry.order_id.clone(),
                        reason: "short: prospective TP passed before fill".to_string(),
                    });
                }
            }
        }

        candidates
    }

    // ========================================================================
    // Exit orders and side resets
    // ========================================================================

    /// Record a freshly placed exit order id. Replacing requires the old id
    /// to have been canceled first (best-effort, by the caller).
    pub fn set_exit_order(&self, side: PosSide, kind: ExitKind, id: String, trigger: Price) {
        let mut inner = self.inner.lock();
        let state = inner.side_mut(side);
        match kind {
            ExitKind::TakeProfit => {
                if let Some(old) = state.exits.take_profit.replace(id) {
                    warn!(side = %side, %old, "replaced TP id still live; leak risk if cancel failed");
                }
                state.tp_price = Some(trigger);
            }
            ExitKind::StopLoss => {
                if let Some(old) = state.exits.stop_loss.replace(id) {
                    warn!(side = %side, %old, "replaced SL id still live; leak risk if cancel failed");
                }
                state.sl_price = Some(trigger);
            }
        }
    }

    /// Take (and clear) the exit order ids for a side, for cancellation.
    pub fn take_exit_orders(&self, side: PosSide) -> Vec<String> {
        let mut inner = self.inner.lock();
        let state = inner.side_mut(side);
        let ids = state
            .exits
            .take_profit
            .take()
            .into_iter()
            .chain(state.exits.stop_loss.take())
            .collect();
        state.tp_price = None;
        state.sl_price = None;
        ids
    }

    /// Clear one side back to Flat. Exit-order cancellation is the caller's
    /// job (via `take_exit_orders`); this clears everything else.
    pub fn reset_side(&self, side: PosSide, reason: &str) {
        let mut inner = self.inner.lock();
        let pending_ids: Vec<String> = inner
            .pending
            .values()
            .filter(|e| e.side == side)
            .map(|e| e.order_id.clone())
            .collect();
        for id in pending_ids {
            inner.pending.remove(&id);
        }
        *inner.side_mut(side) = SideState::default();
        info!(side = %side, reason, "side state reset");
    }

    /// Clear everything back to Flat (authoritative exit epilogue).
    pub fn reset_all(&self, reason: &str) {
        let mut inner = self.inner.lock();
        *inner = BookInner::default();
        info!(reason, "position book reset");
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn side_view(&self, side: PosSide) -> SideView {
        let inner = self.inner.lock();
        let state = inner.side(side);
        SideView {
            position: state.position.clone(),
            tp_price: state.tp_price,
            sl_price: state.sl_price,
            phase: state.phase,
            add_count: state.add_count,
            add_used_notional: state.add_used_notional,
            exits: state.exits.clone(),
        }
    }

    pub fn any_in_position(&self) -> bool {
        let inner = self.inner.lock();
        inner.long.position.in_position || inner.short.position.in_position
    }

    /// Record a filled averaging add against the side's counters.
    pub fn record_add(&self, side: PosSide, notional: Decimal) {
        let mut inner = self.inner.lock();
        let state = inner.side_mut(side);
        state.add_count += 1;
        state.add_used_notional += notional;
    }
}

/// Which exit leg an order id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    TakeProfit,
    StopLoss,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeProfit => "TP",
            Self::StopLoss => "SL",
        }
    }
}

/// TP/SL trigger prices from the confirmed average entry and configured
/// offsets. Long: TP above, SL below; short mirrored. A missing or
/// non-positive offset skips that leg.
pub fn exit_prices(
    side: PosSide,
    avg_entry: Price,
    tp_offset: Option<Decimal>,
    sl_offset: Option<Decimal>,
) -> (Option<Price>, Option<Price>) {
    let sign = Decimal::from(side.sign());
    let tp = tp_offset
        .filter(|off| *off > Decimal::ZERO)
        .map(|off| avg_entry.offset_by(off * sign));
    let sl = sl_offset
        .filter(|off| *off > Decimal::ZERO)
        .map(|off| avg_entry.offset_by(-off * sign));
    (tp, sl)
}

fn side_index(side: PosSide) -> usize {
    match side {
        PosSide::Long => 0,
        PosSide::Short => 1,
    }
}

/// Best-effort closure classification from the last known TP/SL prices.
fn classify_closure(
    side: PosSide,
    tp_price: Option<Price>,
    sl_price: Option<Price>,
    market: Option<Price>,
) -> CloseKind {
    let Some(market) = market else {
        return CloseKind::Manual;
    };
    if let Some(sl) = sl_price {
        let beyond = match side {
            PosSide::Long => market <= sl,
            PosSide::Short => market >= sl,
        };
        if !sl.is_zero() && beyond {
            return CloseKind::StopLoss;
        }
    }
    if let Some(tp) = tp_price {
        let beyond = match side {
            PosSide::Long => market >= tp,
            PosSide::Short => market <= tp,
        };
        if !tp.is_zero() && beyond {
            return CloseKind::TakeProfit;
        }
    }
    CloseKind::Manual
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CancellationConfig;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn raw_position(pos_side: &str, pos: &str, avg: &str) -> RawPosition {
        serde_json::from_value(json!({
            "instId": "ETH-USDT-SWAP",
            "posSide": pos_side,
            "pos": pos,
            "avgPx": avg,
            "upl": "0",
            "liqPx": "0",
            "lever": "10",
            "mgnMode": "cross"
        }))
        .unwrap()
    }

    fn order_update(id: &str, state: &str, filled: &str) -> RawOrderUpdate {
        serde_json::from_value(json!({
            "instId": "ETH-USDT-SWAP",
            "ordId": id,
            "algoId": "",
            "state": state,
            "side": "buy",
            "posSide": "long",
            "accFillSz": filled
        }))
        .unwrap()
    }

    fn pending(id: &str, side: PosSide, limit: Decimal) -> PendingEntry {
        PendingEntry {
            order_id: id.to_string(),
            side,
            signal: side.sign(),
            limit_price: Price::new(limit),
            quantity: Size::new(dec!(1)),
            placed_at: Utc::now(),
            status: EntryStatus::New,
            cumulative_filled: Size::ZERO,
        }
    }

    #[test]
    fn test_in_position_tracks_quantity_invariant() {
        let book = PositionBook::new();
        let rows = vec![raw_position("long", "5", "2980")];
        book.apply_position_push(TradeDirection::Both, &rows, None);

        let view = book.side_view(PosSide::Long);
        assert_eq!(view.position.in_position, !view.position.quantity.is_zero());
        assert!(view.position.in_position);
        assert_eq!(view.phase, SidePhase::Active);

        // Side vanished: closure, invariant holds again.
        book.apply_position_push(TradeDirection::Both, &[], None);
        let view = book.side_view(PosSide::Long);
        assert_eq!(view.position.in_position, !view.position.quantity.is_zero());
        assert!(!view.position.in_position);
    }

    #[test]
    fn test_closure_resets_side_counters() {
        let book = PositionBook::new();
        book.apply_position_push(
            TradeDirection::Both,
            &[raw_position("long", "5", "2980")],
            None,
        );
        book.record_add(PosSide::Long, dec!(500));
        assert_eq!(book.side_view(PosSide::Long).add_count, 1);

        book.apply_position_push(TradeDirection::Both, &[], None);
        let view = book.side_view(PosSide::Long);
        assert_eq!(view.add_count, 0);
        assert_eq!(view.add_used_notional, Decimal::ZERO);
    }

    #[test]
    fn test_closure_classification() {
        // Long with SL at 2960: market at 2955 means the stop went through.
        assert_eq!(
            classify_closure(
                PosSide::Long,
                Some(Price::new(dec!(2990))),
                Some(Price::new(dec!(2960))),
                Some(Price::new(dec!(2955))),
            ),
            CloseKind::StopLoss
        );
        assert_eq!(
            classify_closure(
                PosSide::Long,
                Some(Price::new(dec!(2990))),
                Some(Price::new(dec!(2960))),
                Some(Price::new(dec!(2995))),
            ),
            CloseKind::TakeProfit
        );
        assert_eq!(
            classify_closure(
                PosSide::Long,
                Some(Price::new(dec!(2990))),
                Some(Price::new(dec!(2960))),
                Some(Price::new(dec!(2975))),
            ),
            CloseKind::Manual
        );
        // No market price: cannot classify.
        assert_eq!(
            classify_closure(PosSide::Short, None, None, None),
            CloseKind::Manual
        );
    }

    #[test]
    fn test_sl_hit_fires_exactly_once() {
        let book = PositionBook::new();
        book.apply_position_push(
            TradeDirection::Both,
            &[raw_position("long", "5", "2980")],
            None,
        );
        book.set_exit_order(
            PosSide::Long,
            ExitKind::StopLoss,
            "sl-1".to_string(),
            Price::new(dec!(2960)),
        );

        let update = serde_json::from_value::<RawOrderUpdate>(json!({
            "ordId": "sl-1", "state": "filled", "accFillSz": "5"
        }))
        .unwrap();

        // First event fires the handler.
        assert!(matches!(
            book.apply_order_update(&update),
            Some(BookAction::SlHit { side: PosSide::Long })
        ));
        // Duplicate while in flight is a no-op.
        assert!(book.apply_order_update(&update).is_none());

        // Handler completion releases the flag; a new event may fire again.
        book.sl_hit.release();
        assert!(matches!(
            book.apply_order_update(&update),
            Some(BookAction::SlHit { side: PosSide::Long })
        ));
    }

    #[test]
    fn test_fill_schedules_debounced_confirm() {
        let book = PositionBook::new();
        book.register_pending(pending("e-1", PosSide::Long, dec!(2978)));

        let action = book.apply_order_update(&order_update("e-1", "partially_filled", "0.5"));
        assert_eq!(
            action,
            Some(BookAction::ScheduleConfirm {
                order_id: "e-1".to_string(),
                delay_secs: CONFIRM_DELAY_PARTIAL_SECS
            })
        );

        let action = book.apply_order_update(&order_update("e-1", "filled", "1"));
        assert_eq!(
            action,
            Some(BookAction::ScheduleConfirm {
                order_id: "e-1".to_string(),
                delay_secs: CONFIRM_DELAY_FILLED_SECS
            })
        );
    }

    #[test]
    fn test_canceled_entry_discarded() {
        let book = PositionBook::new();
        book.register_pending(pending("e-2", PosSide::Short, dec!(3010)));

        let action = book.apply_order_update(&order_update("e-2", "canceled", "0"));
        assert_eq!(
            action,
            Some(BookAction::EntryDiscarded {
                order_id: "e-2".to_string(),
                status: EntryStatus::Canceled
            })
        );
        assert!(book.pending_ids().is_empty());
    }

    #[test]
    fn test_promotion_removes_pending_and_activates() {
        let book = PositionBook::new();
        book.register_pending(pending("e-3", PosSide::Long, dec!(2978)));

        let tracked = book.promote_confirmed(
            "e-3",
            PosSide::Long,
            Price::new(dec!(2980)),
            Size::new(dec!(1)),
            Some(Price::new(dec!(2990))),
            Some(Price::new(dec!(2960))),
        );
        assert!(tracked);
        let view = book.side_view(PosSide::Long);
        assert!(view.position.in_position);
        assert_eq!(view.phase, SidePhase::Active);
        assert_eq!(view.tp_price, Some(Price::new(dec!(2990))));
        assert!(book.pending_ids().is_empty());

        // Second confirmation for the same order observes "already done".
        assert!(!book.promote_confirmed(
            "e-3",
            PosSide::Long,
            Price::new(dec!(2980)),
            Size::new(dec!(1)),
            None,
            None,
        ));
    }

    #[test]
    fn test_reconcile_adopts_and_prunes() {
        let book = PositionBook::new();
        book.register_pending(pending("stale-1", PosSide::Long, dec!(2978)));

        let live: Vec<RawPendingOrder> = vec![
            serde_json::from_value(json!({
                "instId": "ETH-USDT-SWAP",
                "ordId": "unknown-1",
                "side": "sell",
                "px": "3010",
                "sz": "2",
                "state": "live",
                "ordType": "limit",
                "reduceOnly": "false",
                "cTime": "1700000000000"
            }))
            .unwrap(),
            // Reduce-only orders are never adopted as entries.
            serde_json::from_value(json!({
                "instId": "ETH-USDT-SWAP",
                "ordId": "reduce-1",
                "side": "sell",
                "px": "2990",
                "sz": "1",
                "state": "live",
                "reduceOnly": "true"
            }))
            .unwrap(),
        ];

        let outcome = book.reconcile_pending(&live);
        assert_eq!(outcome.adopted, vec!["unknown-1".to_string()]);
        assert_eq!(outcome.pruned, vec!["stale-1".to_string()]);

        // Adoption preserved the exchange creation time.
        let adopted = book
            .pending_entries()
            .into_iter()
            .find(|e| e.order_id == "unknown-1")
            .unwrap();
        assert_eq!(adopted.placed_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(adopted.side, PosSide::Short);

        // Pruning did not create any position.
        assert!(!book.any_in_position());
    }

    #[test]
    fn test_cancellation_time_and_unfavorable_rules() {
        let book = PositionBook::new();
        let config = CancellationConfig::default();
        let now = Utc::now();

        let mut old_entry = pending("old-1", PosSide::Long, dec!(2978));
        old_entry.placed_at = now - chrono::Duration::seconds(120);
        book.register_pending(old_entry);

        // Long with market above the limit: unfavorable.
        book.register_pending(pending("unfav-1", PosSide::Long, dec!(2978)));
        // Long with market below the limit: fine.
        book.register_pending(pending("ok-1", PosSide::Long, dec!(2990)));

        let candidates =
            book.cancellation_candidates(&config, None, Price::new(dec!(2985)), now);
        let ids: Vec<&str> = candidates.iter().map(|c| c.order_id.as_str()).collect();
        assert!(ids.contains(&"old-1"));
        // limit 2978 < market 2985 is favorable for a long limit buy; the
        // rule cancels when the limit is ABOVE market.
        assert!(!ids.contains(&"unfav-1"));
        assert!(ids.contains(&"ok-1"));
    }

    #[test]
    fn test_tp_passed_rules_default_off() {
        let book = PositionBook::new();
        let config = CancellationConfig::default();
        book.register_pending(pending("tp-1", PosSide::Short, dec!(3010)));

        // Market far below the prospective TP; rule would fire if enabled.
        let candidates = book.cancellation_candidates(
            &config,
            Some(dec!(10)),
            Price::new(dec!(3012)),
            Utc::now(),
        );
        assert!(candidates.is_empty());

        let enabled = CancellationConfig {
            cancel_on_tp_price_below_market: true,
            cancel_on_entry_price_below_market: false,
            ..Default::default()
        };
        let candidates = book.cancellation_candidates(
            &enabled,
            Some(dec!(10)),
            Price::new(dec!(2990)),
            Utc::now(),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].order_id, "tp-1");
    }

    #[test]
    fn test_exit_prices_per_side() {
        // avg 2980, tp_off 10, sl_off 20, long -> TP 2990, SL 2960.
        let (tp, sl) = exit_prices(
            PosSide::Long,
            Price::new(dec!(2980)),
            Some(dec!(10)),
            Some(dec!(20)),
        );
        assert_eq!(tp, Some(Price::new(dec!(2990))));
        assert_eq!(sl, Some(Price::new(dec!(2960))));

        let (tp, sl) = exit_prices(
            PosSide::Short,
            Price::new(dec!(2980)),
            Some(dec!(10)),
            Some(dec!(20)),
        );
        assert_eq!(tp, Some(Price::new(dec!(2970))));
        assert_eq!(sl, Some(Price::new(dec!(3000))));

        // Zero offsets skip the leg.
        let (tp, sl) = exit_prices(PosSide::Long, Price::new(dec!(2980)), Some(dec!(0)), None);
        assert_eq!(tp, None);
        assert_eq!(sl, None);
    }

    #[test]
    fn test_exit_order_set_at_most_one_per_kind() {
        let book = PositionBook::new();
        book.set_exit_order(
            PosSide::Long,
            ExitKind::TakeProfit,
            "tp-a".to_string(),
            Price::new(dec!(2990)),
        );
        book.set_exit_order(
            PosSide::Long,
            ExitKind::TakeProfit,
            "tp-b".to_string(),
            Price::new(dec!(2992)),
        );
        let view = book.side_view(PosSide::Long);
        assert_eq!(view.exits.take_profit.as_deref(), Some("tp-b"));
        assert!(view.exits.stop_loss.is_none());

        let taken = book.take_exit_orders(PosSide::Long);
        assert_eq!(taken, vec!["tp-b".to_string()]);
        assert!(book.side_view(PosSide::Long).exits.take_profit.is_none());
    }

    #[test]
    fn test_trigger_flag_at_most_once() {
        let flag = TriggerFlag::default();
        assert!(flag.try_engage());
        assert!(!flag.try_engage());
        assert!(flag.is_engaged());
        flag.release();
        assert!(flag.try_engage());
    }

    #[test]
    fn test_pending_notional() {
        let book = PositionBook::new();
        let mut entry = pending("n-1", PosSide::Long, dec!(3000));
        entry.quantity = Size::new(dec!(2));
        book.register_pending(entry);
        // 2 contracts * 3000 * ctVal 0.1 = 600
        assert_eq!(book.pending_notional(dec!(0.1)), dec!(600));
    }
}
