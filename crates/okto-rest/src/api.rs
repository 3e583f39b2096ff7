//! Typed wrappers over the OKX V5 endpoints the engine uses.
//!
//! Numeric fields arrive as strings on the wire (often empty); accessors
//! parse them with a zero default so a missing field never aborts a sync
//! pass. Order placement/cancellation acks carry the application code so
//! the executor can apply its own idempotency rules.

use crate::client::{ApiEnvelope, Method, RestClient};
use crate::error::{ApiError, RestResult};
use okto_core::{InstrumentSpec, Price, Size};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

/// Parse a wire decimal string, defaulting to zero for empty/garbage.
pub fn wire_decimal(s: &str) -> Decimal {
    s.parse().unwrap_or(Decimal::ZERO)
}

fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ============================================================================
// Response payloads
// ============================================================================

/// One position row from `/account/positions`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPosition {
    #[serde(rename = "instId", default)]
    pub inst_id: String,
    #[serde(rename = "posSide", default)]
    pub pos_side: String,
    #[serde(default)]
    pub pos: String,
    #[serde(rename = "avgPx", default)]
    pub avg_px: String,
    #[serde(default)]
    pub upl: String,
    #[serde(rename = "liqPx", default)]
    pub liq_px: String,
    #[serde(default)]
    pub lever: String,
    #[serde(rename = "mgnMode", default)]
    pub mgn_mode: String,
}

impl RawPosition {
    pub fn quantity(&self) -> Decimal {
        wire_decimal(&self.pos)
    }

    pub fn avg_price(&self) -> Price {
        Price::new(wire_decimal(&self.avg_px))
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        wire_decimal(&self.upl)
    }

    pub fn liquidation_price(&self) -> Price {
        Price::new(wire_decimal(&self.liq_px))
    }

    pub fn leverage(&self) -> Decimal {
        let lever = wire_decimal(&self.lever);
        if lever.is_zero() {
            Decimal::ONE
        } else {
            lever
        }
    }

    pub fn is_open(&self) -> bool {
        !self.quantity().is_zero()
    }
}

/// One pending limit order from `/trade/orders-pending`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPendingOrder {
    #[serde(rename = "instId", default)]
    pub inst_id: String,
    #[serde(rename = "ordId", default)]
    pub ord_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "posSide", default)]
    pub pos_side: String,
    #[serde(default)]
    pub px: String,
    #[serde(default)]
    pub sz: String,
    #[serde(rename = "accFillSz", default)]
    pub acc_fill_sz: String,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "ordType", default)]
    pub ord_type: String,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: String,
    #[serde(rename = "cTime", default)]
    pub c_time: String,
}

impl RawPendingOrder {
    pub fn price(&self) -> Price {
        Price::new(wire_decimal(&self.px))
    }

    pub fn quantity(&self) -> Size {
        Size::new(wire_decimal(&self.sz))
    }

    pub fn filled_quantity(&self) -> Size {
        Size::new(wire_decimal(&self.acc_fill_sz))
    }

    pub fn is_reduce_only(&self) -> bool {
        self.reduce_only == "true"
    }

    /// Exchange order creation time, Unix milliseconds.
    pub fn created_ms(&self) -> Option<i64> {
        self.c_time.parse().ok()
    }
}

/// One conditional (algo) order from `/trade/orders-algo-pending`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAlgoOrder {
    #[serde(rename = "instId", default)]
    pub inst_id: String,
    #[serde(rename = "algoId", default)]
    pub algo_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "posSide", default)]
    pub pos_side: String,
    #[serde(rename = "tpTriggerPx", default)]
    pub tp_trigger_px: String,
    #[serde(rename = "slTriggerPx", default)]
    pub sl_trigger_px: String,
}

impl RawAlgoOrder {
    pub fn has_tp(&self) -> bool {
        wire_decimal(&self.tp_trigger_px) > Decimal::ZERO
    }

    pub fn has_sl(&self) -> bool {
        wire_decimal(&self.sl_trigger_px) > Decimal::ZERO
    }
}

/// USDT account figures from `/account/balance`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BalanceSnapshot {
    pub total_equity: Decimal,
    pub balance: Decimal,
    pub available: Decimal,
}

/// One execution from `/trade/fills`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFill {
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub pnl: String,
    #[serde(default)]
    pub fee: String,
}

impl RawFill {
    pub fn timestamp_ms(&self) -> i64 {
        self.ts.parse().unwrap_or(0)
    }

    /// Realized pnl net of the fill fee (fees are negative on the wire).
    pub fn net_pnl(&self) -> Decimal {
        wire_decimal(&self.pnl) + wire_decimal(&self.fee)
    }
}

/// One OHLCV bar from `/market/history-candles`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Parse a raw kline row `[ts, o, h, l, c, vol, ...]`.
    pub fn from_row(row: &[serde_json::Value]) -> Option<Self> {
        let field = |i: usize| row.get(i).and_then(|v| v.as_str());
        Some(Self {
            ts_ms: field(0)?.parse().ok()?,
            open: field(1)?.parse().ok()?,
            high: field(2)?.parse().ok()?,
            low: field(3)?.parse().ok()?,
            close: field(4)?.parse().ok()?,
            volume: field(5)?.parse().ok()?,
        })
    }
}

/// Ack for an order placement attempt.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub ord_id: Option<String>,
    pub code: String,
    pub msg: String,
}

impl OrderAck {
    pub fn accepted(&self) -> bool {
        self.ord_id.is_some()
    }
}

/// Ack for a cancel attempt.
#[derive(Debug, Clone)]
pub struct CancelAck {
    pub code: String,
    pub msg: String,
}

impl CancelAck {
    /// Code 51001 means the order is already filled or canceled; treated as
    /// success everywhere a cancel is best-effort.
    pub fn is_gone(&self) -> bool {
        self.code == "0" || self.code == "51001"
    }
}

// ============================================================================
// Request payloads
// ============================================================================

/// A regular order request (`/trade/order`).
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub inst_id: String,
    pub td_mode: String,
    pub side: String,
    /// "limit" or "market".
    pub ord_type: String,
    /// Pre-formatted at instrument precision.
    pub sz: String,
    pub px: Option<String>,
    /// Required in hedge mode; the exchange value ("long"/"short"/"net").
    pub pos_side: Option<String>,
    pub reduce_only: bool,
    /// Attached exchange-native TP trigger, pre-formatted.
    pub attach_tp_trigger: Option<String>,
    /// Attached exchange-native SL trigger, pre-formatted.
    pub attach_sl_trigger: Option<String>,
}

impl OrderRequest {
    fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "instId": self.inst_id,
            "tdMode": self.td_mode,
            "side": self.side,
            "ordType": self.ord_type,
            "sz": self.sz,
        });
        let obj = body.as_object_mut().expect("literal object");
        if let Some(px) = &self.px {
            obj.insert("px".to_string(), json!(px));
        }
        if let Some(pos_side) = &self.pos_side {
            obj.insert("posSide".to_string(), json!(pos_side));
        }
        if self.reduce_only {
            obj.insert("reduceOnly".to_string(), json!(true));
        }

        let mut attach = serde_json::Map::new();
        if let Some(pos_side) = &self.pos_side {
            attach.insert("posSide".to_string(), json!(pos_side));
        }
        if let Some(tp) = &self.attach_tp_trigger {
            attach.insert("tpTriggerPx".to_string(), json!(tp));
            attach.insert("tpOrdPx".to_string(), json!("-1"));
            attach.insert("tpTriggerPxType".to_string(), json!("last"));
        }
        if let Some(sl) = &self.attach_sl_trigger {
            attach.insert("slTriggerPx".to_string(), json!(sl));
            attach.insert("slOrdPx".to_string(), json!("-1"));
            attach.insert("slTriggerPxType".to_string(), json!("last"));
        }
        if self.attach_tp_trigger.is_some() || self.attach_sl_trigger.is_some() {
            obj.insert(
                "attachAlgoOrds".to_string(),
                json!([serde_json::Value::Object(attach)]),
            );
        }
        body
    }
}

/// A conditional TP or SL order request (`/trade/order-algo`).
#[derive(Debug, Clone)]
pub struct AlgoOrderRequest {
    pub inst_id: String,
    pub td_mode: String,
    pub side: String,
    pub pos_side: String,
    pub sz: String,
    /// Take-profit trigger; mutually exclusive with `sl_trigger_px`.
    pub tp_trigger_px: Option<String>,
    pub sl_trigger_px: Option<String>,
    /// "last" / "mark" / "index".
    pub trigger_px_type: String,
    /// Limit price for limit-mode TP, "-1" for market.
    pub ord_px: String,
}

impl AlgoOrderRequest {
    fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "instId": self.inst_id,
            "tdMode": self.td_mode,
            "side": self.side,
            "posSide": self.pos_side,
            "ordType": "conditional",
            "sz": self.sz,
            "reduceOnly": "true",
        });
        let obj = body.as_object_mut().expect("literal object");
        if let Some(tp) = &self.tp_trigger_px {
            obj.insert("tpTriggerPx".to_string(), json!(tp));
            obj.insert("tpOrdPx".to_string(), json!(self.ord_px));
            obj.insert("tpTriggerPxType".to_string(), json!(self.trigger_px_type));
        }
        if let Some(sl) = &self.sl_trigger_px {
            obj.insert("slTriggerPx".to_string(), json!(sl));
            obj.insert("slOrdPx".to_string(), json!("-1"));
            obj.insert("slTriggerPxType".to_string(), json!(self.trigger_px_type));
        }
        body
    }
}

// ============================================================================
// Endpoint methods
// ============================================================================

impl RestClient {
    /// Fetch the trading rules for one SWAP instrument.
    pub async fn fetch_instrument(&self, inst_id: &str) -> RestResult<InstrumentSpec> {
        let envelope = self
            .request_default(
                Method::Get,
                "/api/v5/public/instruments",
                &query(&[("instType", "SWAP"), ("instId", inst_id)]),
                None,
            )
            .await?;

        let item = envelope
            .data_array()
            .iter()
            .find(|item| item.get("instId").and_then(|v| v.as_str()) == Some(inst_id))
            .ok_or_else(|| ApiError::Decode(format!("instrument {inst_id} not found")))?;

        let field = |name: &str| {
            item.get(name)
                .and_then(|v| v.as_str())
                .map(wire_decimal)
                .unwrap_or(Decimal::ZERO)
        };

        InstrumentSpec::new(
            inst_id,
            Price::new(field("tickSz")),
            Size::new(field("lotSz")),
            Size::new(field("minSz")),
            field("ctVal"),
        )
        .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Fetch USDT balance and total equity.
    pub async fn fetch_balance(&self) -> RestResult<BalanceSnapshot> {
        let envelope = self
            .request_default(
                Method::Get,
                "/api/v5/account/balance",
                &query(&[("ccy", "USDT")]),
                None,
            )
            .await?;

        let mut snapshot = BalanceSnapshot::default();
        if let Some(account) = envelope.data_array().first() {
            snapshot.total_equity = account
                .get("totalEq")
                .and_then(|v| v.as_str())
                .map(wire_decimal)
                .unwrap_or_default();
            if let Some(details) = account.get("details").and_then(|v| v.as_array()) {
                for detail in details {
                    if detail.get("ccy").and_then(|v| v.as_str()) == Some("USDT") {
                        snapshot.balance = detail
                            .get("bal")
                            .and_then(|v| v.as_str())
                            .map(wire_decimal)
                            .unwrap_or_default();
                        snapshot.available = detail
                            .get("availBal")
                            .and_then(|v| v.as_str())
                            .map(wire_decimal)
                            .unwrap_or_default();
                        break;
                    }
                }
            }
        }
        Ok(snapshot)
    }

    /// Fetch live positions for an instrument.
    pub async fn fetch_positions(&self, inst_id: &str) -> RestResult<Vec<RawPosition>> {
        let envelope = self
            .request_default(
                Method::Get,
                "/api/v5/account/positions",
                &query(&[("instType", "SWAP"), ("instId", inst_id)]),
                None,
            )
            .await?;

        Ok(envelope
            .data_array()
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .filter(|p: &RawPosition| p.inst_id == inst_id)
            .collect())
    }

    /// Fetch live pending limit orders for an instrument.
    pub async fn fetch_pending_orders(&self, inst_id: &str) -> RestResult<Vec<RawPendingOrder>> {
        let envelope = self
            .request_default(
                Method::Get,
                "/api/v5/trade/orders-pending",
                &query(&[("instType", "SWAP"), ("instId", inst_id)]),
                None,
            )
            .await?;

        Ok(envelope
            .data_array()
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect())
    }

    /// Fetch live conditional (TP/SL) orders for an instrument.
    pub async fn fetch_pending_algo_orders(&self, inst_id: &str) -> RestResult<Vec<RawAlgoOrder>> {
        let envelope = self
            .request_default(
                Method::Get,
                "/api/v5/trade/orders-algo-pending",
                &query(&[("instId", inst_id), ("ordType", "conditional")]),
                None,
            )
            .await?;

        Ok(envelope
            .data_array()
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect())
    }

    /// Place a regular order.
    pub async fn place_order(&self, request: &OrderRequest) -> RestResult<OrderAck> {
        let envelope = self
            .request_default(Method::Post, "/api/v5/trade/order", &[], Some(request.to_body()))
            .await?;

        Ok(OrderAck {
            ord_id: first_id(&envelope, "ordId"),
            code: envelope.code,
            msg: envelope.msg,
        })
    }

    /// Place a conditional (algo) order.
    pub async fn place_algo_order(&self, request: &AlgoOrderRequest) -> RestResult<OrderAck> {
        let envelope = self
            .request_default(
                Method::Post,
                "/api/v5/trade/order-algo",
                &[],
                Some(request.to_body()),
            )
            .await?;

        let ord_id = first_id(&envelope, "algoId").or_else(|| first_id(&envelope, "ordId"));
        Ok(OrderAck {
            ord_id,
            code: envelope.code,
            msg: envelope.msg,
        })
    }

    /// Cancel a regular order, best-effort.
    pub async fn cancel_order(&self, inst_id: &str, ord_id: &str) -> RestResult<CancelAck> {
        let envelope = self
            .request_default(
                Method::Post,
                "/api/v5/trade/cancel-order",
                &[],
                Some(json!({"instId": inst_id, "ordId": ord_id})),
            )
            .await?;
        Ok(CancelAck {
            code: envelope.code,
            msg: envelope.msg,
        })
    }

    /// Cancel a conditional order, best-effort.
    pub async fn cancel_algo_order(&self, inst_id: &str, algo_id: &str) -> RestResult<CancelAck> {
        let envelope = self
            .request_default(
                Method::Post,
                "/api/v5/trade/cancel-algos",
                &[],
                Some(json!([{"instId": inst_id, "algoId": algo_id}])),
            )
            .await?;
        Ok(CancelAck {
            code: envelope.code,
            msg: envelope.msg,
        })
    }

    /// Arm the exchange-side dead-man cancel for every SWAP order.
    pub async fn cancel_all_after(&self, timeout_secs: u32) -> RestResult<bool> {
        let envelope = self
            .request_default(
                Method::Post,
                "/api/v5/trade/cancel-all-after",
                &[],
                Some(json!({"timeOut": timeout_secs.to_string(), "instType": "SWAP"})),
            )
            .await?;
        Ok(envelope.is_ok())
    }

    /// Set leverage for an instrument/side.
    pub async fn set_leverage(
        &self,
        inst_id: &str,
        leverage: u32,
        mgn_mode: &str,
        pos_side: &str,
    ) -> RestResult<bool> {
        let envelope = self
            .request_default(
                Method::Post,
                "/api/v5/account/set-leverage",
                &[],
                Some(json!({
                    "instId": inst_id,
                    "lever": leverage.to_string(),
                    "mgnMode": mgn_mode,
                    "posSide": pos_side,
                })),
            )
            .await?;
        if !envelope.is_ok() {
            warn!(inst_id, code = %envelope.code, msg = %envelope.msg, "set-leverage rejected");
        }
        Ok(envelope.is_ok())
    }

    /// Current account position mode ("net_mode" / "long_short_mode").
    pub async fn fetch_position_mode(&self) -> RestResult<Option<String>> {
        let envelope = self
            .request_default(Method::Get, "/api/v5/account/config", &[], None)
            .await?;
        Ok(envelope
            .data_array()
            .first()
            .and_then(|item| item.get("posMode"))
            .and_then(|v| v.as_str())
            .map(String::from))
    }

    /// Set the account position mode. Requires zero positions and orders;
    /// "already in this mode" (51000) counts as success.
    pub async fn set_position_mode(&self, mode: &str) -> RestResult<bool> {
        if let Ok(Some(current)) = self.fetch_position_mode().await {
            if current == mode {
                return Ok(true);
            }
        }
        let envelope = self
            .request_default(
                Method::Post,
                "/api/v5/account/set-position-mode",
                &[],
                Some(json!({"posMode": mode})),
            )
            .await?;
        Ok(envelope.is_ok() || envelope.code == "51000")
    }

    /// Add margin to an isolated position.
    pub async fn add_margin(
        &self,
        inst_id: &str,
        pos_side: &str,
        amount: Decimal,
    ) -> RestResult<bool> {
        let envelope = self
            .request_default(
                Method::Post,
                "/api/v5/account/adj-margin",
                &[],
                Some(json!({
                    "instId": inst_id,
                    "posSide": pos_side,
                    "type": "add",
                    "amt": amount.to_string(),
                })),
            )
            .await?;
        Ok(envelope.is_ok())
    }

    /// Fetch recent fills for an instrument (last 3 days window).
    pub async fn fetch_fills(&self, inst_id: &str, limit: u32) -> RestResult<Vec<RawFill>> {
        let limit = limit.to_string();
        let envelope = self
            .request_default(
                Method::Get,
                "/api/v5/trade/fills",
                &query(&[
                    ("instType", "SWAP"),
                    ("instId", inst_id),
                    ("limit", &limit),
                ]),
                None,
            )
            .await?;
        Ok(envelope
            .data_array()
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect())
    }

    /// Fetch one page of historical candles ending before `before_ms`.
    /// Rows arrive newest-first.
    pub async fn fetch_history_candles(
        &self,
        inst_id: &str,
        bar: &str,
        before_ms: Option<i64>,
        limit: u32,
    ) -> RestResult<Vec<Candle>> {
        let limit = limit.to_string();
        let mut params = vec![
            ("instId".to_string(), inst_id.to_string()),
            ("bar".to_string(), bar.to_string()),
            ("limit".to_string(), limit),
        ];
        if let Some(before) = before_ms {
            params.push(("before".to_string(), before.to_string()));
        }

        let envelope = self
            .request_default(Method::Get, "/api/v5/market/history-candles", &params, None)
            .await?;

        Ok(envelope
            .data_array()
            .iter()
            .filter_map(|row| row.as_array())
            .filter_map(|row| Candle::from_row(row))
            .collect())
    }
}

fn first_id(envelope: &ApiEnvelope, field: &str) -> Option<String> {
    envelope
        .data_array()
        .first()
        .and_then(|item| item.get(field))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::canonical_json;
    use rust_decimal_macros::dec;

    #[test]
    fn test_raw_position_accessors() {
        let pos: RawPosition = serde_json::from_value(json!({
            "instId": "ETH-USDT-SWAP",
            "posSide": "net",
            "pos": "-12",
            "avgPx": "2980.5",
            "upl": "-3.2",
            "liqPx": "3400",
            "lever": "20",
            "mgnMode": "cross"
        }))
        .unwrap();

        assert!(pos.is_open());
        assert_eq!(pos.quantity(), dec!(-12));
        assert_eq!(pos.avg_price().inner(), dec!(2980.5));
        assert_eq!(pos.leverage(), dec!(20));
    }

    #[test]
    fn test_raw_position_tolerates_empty_fields() {
        let pos: RawPosition = serde_json::from_value(json!({
            "instId": "ETH-USDT-SWAP",
            "pos": "",
            "avgPx": ""
        }))
        .unwrap();
        assert!(!pos.is_open());
        assert_eq!(pos.leverage(), Decimal::ONE);
    }

    #[test]
    fn test_order_request_body_with_attached_exits() {
        let request = OrderRequest {
            inst_id: "ETH-USDT-SWAP".to_string(),
            td_mode: "cross".to_string(),
            side: "buy".to_string(),
            ord_type: "limit".to_string(),
            sz: "1.5".to_string(),
            px: Some("2978.00".to_string()),
            pos_side: Some("long".to_string()),
            reduce_only: false,
            attach_tp_trigger: Some("2990.00".to_string()),
            attach_sl_trigger: Some("2960.00".to_string()),
        };

        let body = request.to_body();
        assert_eq!(body["instId"], "ETH-USDT-SWAP");
        assert_eq!(body["px"], "2978.00");
        let attach = &body["attachAlgoOrds"][0];
        assert_eq!(attach["tpTriggerPx"], "2990.00");
        assert_eq!(attach["slTriggerPx"], "2960.00");
        assert_eq!(attach["tpOrdPx"], "-1");
        assert_eq!(attach["posSide"], "long");
        // No reduceOnly key when false.
        assert!(body.get("reduceOnly").is_none());
    }

    #[test]
    fn test_algo_request_body_is_reduce_only() {
        let request = AlgoOrderRequest {
            inst_id: "ETH-USDT-SWAP".to_string(),
            td_mode: "cross".to_string(),
            side: "sell".to_string(),
            pos_side: "long".to_string(),
            sz: "1.5".to_string(),
            tp_trigger_px: Some("2990.00".to_string()),
            sl_trigger_px: None,
            trigger_px_type: "last".to_string(),
            ord_px: "-1".to_string(),
        };

        let body = request.to_body();
        assert_eq!(body["reduceOnly"], "true");
        assert_eq!(body["ordType"], "conditional");
        assert_eq!(body["tpTriggerPx"], "2990.00");
        assert!(body.get("slTriggerPx").is_none());
        // Canonical serialization is stable for signing.
        assert!(canonical_json(&body).starts_with('{'));
    }

    #[test]
    fn test_cancel_ack_51001_is_gone() {
        let gone = CancelAck {
            code: "51001".to_string(),
            msg: "Order does not exist".to_string(),
        };
        assert!(gone.is_gone());
        let failed = CancelAck {
            code: "50011".to_string(),
            msg: "rate limited".to_string(),
        };
        assert!(!failed.is_gone());
    }

    #[test]
    fn test_candle_from_row() {
        let row = vec![
            json!("1700000000000"),
            json!("2980"),
            json!("2995"),
            json!("2970"),
            json!("2990"),
            json!("1234.5"),
            json!("ignored"),
        ];
        let candle = Candle::from_row(&row).unwrap();
        assert_eq!(candle.ts_ms, 1_700_000_000_000);
        assert_eq!(candle.close, dec!(2990));

        // Short rows are rejected, not panicked on.
        assert!(Candle::from_row(&row[..4]).is_none());
    }
}
