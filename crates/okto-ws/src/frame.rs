//! OKX WebSocket frame construction and parsing.
//!
//! Outbound frames are `{"op": ..., "args": [...]}`. Inbound frames are
//! either event acknowledgements (`subscribe`, `login`, `error`) or data
//! pushes carrying a channel argument and a `data` array.

use crate::error::{WsError, WsResult};
use okto_rest::{wire_decimal, Credentials};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Outbound request frame.
#[derive(Debug, Clone, Serialize)]
pub struct WsRequest {
    pub op: String,
    pub args: Vec<serde_json::Value>,
}

impl WsRequest {
    /// Subscribe to a set of channels.
    pub fn subscribe(args: Vec<serde_json::Value>) -> Self {
        Self {
            op: "subscribe".to_string(),
            args,
        }
    }

    /// Build the signed login frame for the private endpoint.
    ///
    /// The signature covers `timestamp + "GET" + "/users/self/verify"` with
    /// a Unix-seconds timestamp.
    pub fn login(credentials: &Credentials, timestamp_secs: i64) -> WsResult<Self> {
        let timestamp = timestamp_secs.to_string();
        let sign = credentials
            .sign_ws_login(&timestamp)
            .map_err(|e| WsError::Signing(e.to_string()))?;
        Ok(Self {
            op: "login".to_string(),
            args: vec![json!({
                "apiKey": credentials.api_key,
                "passphrase": credentials.passphrase,
                "timestamp": timestamp,
                "sign": sign,
            })],
        })
    }

    pub fn to_text(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The channel argument attached to events and data pushes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelArg {
    #[serde(default)]
    pub channel: String,
    #[serde(rename = "instId", default)]
    pub inst_id: Option<String>,
}

impl ChannelArg {
    /// Stable key used for subscription confirmation matching.
    pub fn key(&self) -> String {
        match &self.inst_id {
            Some(inst_id) => format!("{}:{inst_id}", self.channel),
            None => self.channel.clone(),
        }
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum WsFrame {
    /// `event: subscribe` acknowledgement.
    Subscribed(ChannelArg),
    /// `event: login` result.
    Login { code: String, msg: String },
    /// `event: error`.
    Error { code: String, msg: String },
    /// Data push for a channel.
    Data {
        arg: ChannelArg,
        data: Vec<serde_json::Value>,
    },
    /// Plain-text "pong" or anything else we do not act on.
    Ignored,
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> WsFrame {
    if text == "pong" {
        return WsFrame::Ignored;
    }
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return WsFrame::Ignored,
    };

    if let Some(event) = value.get("event").and_then(|v| v.as_str()) {
        let code = value
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("0")
            .to_string();
        let msg = value
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return match event {
            "subscribe" => {
                let arg = value
                    .get("arg")
                    .and_then(|arg| serde_json::from_value(arg.clone()).ok())
                    .unwrap_or(ChannelArg {
                        channel: String::new(),
                        inst_id: None,
                    });
                WsFrame::Subscribed(arg)
            }
            "login" => WsFrame::Login { code, msg },
            "error" => WsFrame::Error { code, msg },
            _ => WsFrame::Ignored,
        };
    }

    if let Some(data) = value.get("data").and_then(|v| v.as_array()) {
        if let Some(arg) = value
            .get("arg")
            .and_then(|arg| serde_json::from_value::<ChannelArg>(arg.clone()).ok())
        {
            return WsFrame::Data {
                arg,
                data: data.clone(),
            };
        }
    }

    WsFrame::Ignored
}

/// A trade/ticker price extracted from a public data push.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTick {
    pub price: Decimal,
    /// Exchange timestamp, Unix milliseconds, when the channel carries one.
    pub exchange_ts_ms: Option<i64>,
}

/// Extract the latest traded price from a `trades` push (last row wins).
pub fn parse_trades_tick(data: &[serde_json::Value]) -> Option<PriceTick> {
    let row = data.last()?;
    let price = row.get("px").and_then(|v| v.as_str()).map(wire_decimal)?;
    if price.is_zero() {
        return None;
    }
    let ts = row
        .get("ts")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());
    Some(PriceTick {
        price,
        exchange_ts_ms: ts,
    })
}

/// Extract the last price from a `tickers` push.
pub fn parse_ticker_tick(data: &[serde_json::Value]) -> Option<PriceTick> {
    let row = data.first()?;
    let price = row.get("last").and_then(|v| v.as_str()).map(wire_decimal)?;
    if price.is_zero() {
        return None;
    }
    let ts = row
        .get("ts")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());
    Some(PriceTick {
        price,
        exchange_ts_ms: ts,
    })
}

/// Account balance figures from an `account` push.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BalancePush {
    pub total_equity: Decimal,
    pub available: Decimal,
    pub balance: Decimal,
}

/// Extract USDT balance figures from an `account` push row.
pub fn parse_balance_push(data: &[serde_json::Value]) -> Option<BalancePush> {
    let row = data.first()?;
    let mut push = BalancePush {
        total_equity: row.get("totalEq").and_then(|v| v.as_str()).map(wire_decimal)?,
        ..Default::default()
    };
    if let Some(details) = row.get("details").and_then(|v| v.as_array()) {
        for detail in details {
            if detail.get("ccy").and_then(|v| v.as_str()) == Some("USDT") {
                push.available = detail
                    .get("availBal")
                    .and_then(|v| v.as_str())
                    .map(wire_decimal)
                    .unwrap_or_default();
                push.balance = detail
                    .get("cashBal")
                    .and_then(|v| v.as_str())
                    .map(wire_decimal)
                    .unwrap_or_default();
                break;
            }
        }
    }
    Some(push)
}

/// One row from an `orders` push.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOrderUpdate {
    #[serde(rename = "instId", default)]
    pub inst_id: String,
    #[serde(rename = "ordId", default)]
    pub ord_id: String,
    #[serde(rename = "algoId", default)]
    pub algo_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "posSide", default)]
    pub pos_side: String,
    #[serde(rename = "accFillSz", default)]
    pub acc_fill_sz: String,
}

impl RawOrderUpdate {
    /// The id the engine tracks this order by (regular id, else algo id).
    pub fn tracking_id(&self) -> &str {
        if !self.ord_id.is_empty() {
            &self.ord_id
        } else {
            &self.algo_id
        }
    }

    pub fn filled_quantity(&self) -> Decimal {
        wire_decimal(&self.acc_fill_sz)
    }
}

/// Parse the rows of an `orders` push.
pub fn parse_order_updates(data: &[serde_json::Value]) -> Vec<RawOrderUpdate> {
    data.iter()
        .filter_map(|row| serde_json::from_value(row.clone()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscribe_request_shape() {
        let request = WsRequest::subscribe(vec![
            json!({"channel": "trades", "instId": "ETH-USDT-SWAP"}),
            json!({"channel": "tickers", "instId": "ETH-USDT-SWAP"}),
        ]);
        let text = request.to_text().unwrap();
        assert!(text.starts_with(r#"{"op":"subscribe""#));
        assert!(text.contains(r#""channel":"trades""#));
    }

    #[test]
    fn test_login_request_carries_signature() {
        let creds = Credentials::new("key", "secret", "phrase", false);
        let request = WsRequest::login(&creds, 1_700_000_000).unwrap();
        assert_eq!(request.op, "login");
        let arg = &request.args[0];
        assert_eq!(arg["apiKey"], "key");
        assert_eq!(arg["timestamp"], "1700000000");
        assert!(!arg["sign"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_parse_subscribe_ack() {
        let frame = parse_frame(
            r#"{"event":"subscribe","arg":{"channel":"trades","instId":"ETH-USDT-SWAP"}}"#,
        );
        match frame {
            WsFrame::Subscribed(arg) => assert_eq!(arg.key(), "trades:ETH-USDT-SWAP"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_login_ack() {
        let frame = parse_frame(r#"{"event":"login","code":"0","msg":""}"#);
        assert!(matches!(frame, WsFrame::Login { code, .. } if code == "0"));
    }

    #[test]
    fn test_parse_trades_push_uses_last_row() {
        let frame = parse_frame(
            r#"{"arg":{"channel":"trades","instId":"ETH-USDT-SWAP"},
                "data":[{"px":"2979.1","ts":"1700000000001"},{"px":"2980.5","ts":"1700000000002"}]}"#,
        );
        match frame {
            WsFrame::Data { arg, data } => {
                assert_eq!(arg.channel, "trades");
                let tick = parse_trades_tick(&data).unwrap();
                assert_eq!(tick.price, dec!(2980.5));
                assert_eq!(tick.exchange_ts_ms, Some(1_700_000_000_002));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_ticker_push() {
        let data = vec![json!({"last": "2981.2", "ts": "1700000000003"})];
        let tick = parse_ticker_tick(&data).unwrap();
        assert_eq!(tick.price, dec!(2981.2));
    }

    #[test]
    fn test_zero_price_ticks_rejected() {
        assert!(parse_trades_tick(&[json!({"px": "0"})]).is_none());
        assert!(parse_ticker_tick(&[json!({"last": ""})]).is_none());
    }

    #[test]
    fn test_parse_balance_push() {
        let data = vec![json!({
            "totalEq": "1000.5",
            "details": [
                {"ccy": "BTC", "availBal": "1"},
                {"ccy": "USDT", "availBal": "800.25", "cashBal": "900"}
            ]
        })];
        let push = parse_balance_push(&data).unwrap();
        assert_eq!(push.total_equity, dec!(1000.5));
        assert_eq!(push.available, dec!(800.25));
        assert_eq!(push.balance, dec!(900));
    }

    #[test]
    fn test_order_update_tracking_id_prefers_ord_id() {
        let updates = parse_order_updates(&[json!({
            "instId": "ETH-USDT-SWAP",
            "ordId": "111",
            "algoId": "",
            "state": "filled",
            "accFillSz": "2"
        })]);
        assert_eq!(updates[0].tracking_id(), "111");
        assert_eq!(updates[0].filled_quantity(), dec!(2));

        let algo = parse_order_updates(&[json!({"ordId": "", "algoId": "999", "state": "live"})]);
        assert_eq!(algo[0].tracking_id(), "999");
    }

    #[test]
    fn test_garbage_frames_ignored() {
        assert!(matches!(parse_frame("pong"), WsFrame::Ignored));
        assert!(matches!(parse_frame("not json"), WsFrame::Ignored));
        assert!(matches!(parse_frame(r#"{"x":1}"#), WsFrame::Ignored));
    }
}
