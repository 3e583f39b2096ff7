//! Typed engine configuration.
//!
//! The engine does not own config persistence; it consumes a typed struct
//! validated once at load. Every field has an explicit default so a partial
//! file is usable, and live updates go through `diff` + a typed outcome
//! instead of a blind object replace.

use crate::error::{EngineError, EngineResult};
use okto_core::{MarginMode, PositionMode, TradeDirection};
use okto_rest::Credentials;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub auto_add: AutoAddConfig,
    #[serde(default)]
    pub cancellation: CancellationConfig,
    #[serde(default)]
    pub margin_guard: MarginGuardConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Instrument, direction and account-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Instrument id, e.g. "ETH-USDT-SWAP".
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default)]
    pub direction: TradeDirection,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default)]
    pub position_mode: PositionMode,
}

fn default_symbol() -> String {
    "ETH-USDT-SWAP".to_string()
}

fn default_leverage() -> u32 {
    20
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            direction: TradeDirection::default(),
            leverage: default_leverage(),
            margin_mode: MarginMode::default(),
            position_mode: PositionMode::default(),
        }
    }
}

/// Capital caps and fee model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Hard margin cap, clamped to live equity.
    #[serde(default = "default_max_allowed_used")]
    pub max_allowed_used: Decimal,
    /// Divides the margin cap into per-session partitions (>= 1).
    #[serde(default = "default_rate_divisor")]
    pub rate_divisor: Decimal,
    /// Target notional per entry order.
    #[serde(default = "default_target_order_amount")]
    pub target_order_amount: Decimal,
    /// Minimum notional worth placing.
    #[serde(default = "default_min_order_amount")]
    pub min_order_amount: Decimal,
    /// Taker/maker fee percentage per leg (0.07 means 0.07%).
    #[serde(default = "default_trade_fee_percentage")]
    pub trade_fee_percentage: Decimal,
}

fn default_max_allowed_used() -> Decimal {
    dec!(1000)
}

fn default_rate_divisor() -> Decimal {
    Decimal::ONE
}

fn default_target_order_amount() -> Decimal {
    dec!(100)
}

fn default_min_order_amount() -> Decimal {
    dec!(100)
}

fn default_trade_fee_percentage() -> Decimal {
    dec!(0.07)
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            max_allowed_used: default_max_allowed_used(),
            rate_divisor: default_rate_divisor(),
            target_order_amount: default_target_order_amount(),
            min_order_amount: default_min_order_amount(),
            trade_fee_percentage: default_trade_fee_percentage(),
        }
    }
}

/// Entry-signal and batch-placement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Limit price offset away from market per signal.
    #[serde(default)]
    pub entry_price_offset: Decimal,
    /// Orders per accepted signal.
    #[serde(default = "default_batch_size")]
    pub batch_size_per_loop: u32,
    /// Additional offset per batch member index.
    #[serde(default)]
    pub batch_offset: Decimal,
    /// Entry loop sleep between evaluations.
    #[serde(default = "default_loop_time_seconds")]
    pub loop_time_seconds: u64,
    /// Long entries only while market is below this line. None disables
    /// long entries.
    #[serde(default)]
    pub long_safety_line_price: Option<Decimal>,
    /// Short entries only while market is above this line. None disables
    /// short entries.
    #[serde(default)]
    pub short_safety_line_price: Option<Decimal>,
    #[serde(default)]
    pub candles: CandleConditionConfig,
}

fn default_batch_size() -> u32 {
    1
}

fn default_loop_time_seconds() -> u64 {
    10
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            entry_price_offset: Decimal::ZERO,
            batch_size_per_loop: default_batch_size(),
            batch_offset: Decimal::ZERO,
            loop_time_seconds: default_loop_time_seconds(),
            long_safety_line_price: None,
            short_safety_line_price: None,
            candles: CandleConditionConfig::default(),
        }
    }
}

/// Candlestick range filters applied to the latest completed bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleConditionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_candle_timeframe")]
    pub timeframe: String,
    #[serde(default)]
    pub use_chg_open_close: bool,
    #[serde(default)]
    pub min_chg_open_close: Decimal,
    #[serde(default)]
    pub max_chg_open_close: Decimal,
    #[serde(default)]
    pub use_chg_high_low: bool,
    #[serde(default)]
    pub min_chg_high_low: Decimal,
    #[serde(default)]
    pub max_chg_high_low: Decimal,
    #[serde(default)]
    pub use_chg_high_close: bool,
    #[serde(default)]
    pub min_chg_high_close: Decimal,
    #[serde(default)]
    pub max_chg_high_close: Decimal,
}

fn default_true() -> bool {
    true
}

fn default_candle_timeframe() -> String {
    "1m".to_string()
}

impl Default for CandleConditionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeframe: default_candle_timeframe(),
            use_chg_open_close: false,
            min_chg_open_close: Decimal::ZERO,
            max_chg_open_close: Decimal::ZERO,
            use_chg_high_low: false,
            min_chg_high_low: Decimal::ZERO,
            max_chg_high_low: Decimal::ZERO,
            use_chg_high_close: false,
            min_chg_high_close: Decimal::ZERO,
            max_chg_high_close: Decimal::ZERO,
        }
    }
}

/// TP/SL placement and automatic exit rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// TP trigger offset from the confirmed average entry. None skips TP.
    #[serde(default)]
    pub tp_price_offset: Option<Decimal>,
    /// SL trigger offset from the confirmed average entry. None skips SL.
    #[serde(default)]
    pub sl_price_offset: Option<Decimal>,
    /// Percent of the position quantity covered by the TP order.
    #[serde(default = "default_exit_size_percent")]
    pub tp_size_percent: Decimal,
    /// Percent of the position quantity covered by the SL order.
    #[serde(default = "default_exit_size_percent")]
    pub sl_size_percent: Decimal,
    /// Trigger price source: "last", "mark" or "index".
    #[serde(default = "default_trigger_price_type")]
    pub trigger_price_type: String,
    #[serde(default)]
    pub auto: AutoExitConfig,
}

fn default_exit_size_percent() -> Decimal {
    dec!(100)
}

fn default_trigger_price_type() -> String {
    "last".to_string()
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            tp_price_offset: None,
            sl_price_offset: None,
            tp_size_percent: default_exit_size_percent(),
            sl_size_percent: default_exit_size_percent(),
            trigger_price_type: default_trigger_price_type(),
            auto: AutoExitConfig::default(),
        }
    }
}

/// Automatic exit rule toggles. Evaluated in a fixed priority order; the
/// first matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoExitConfig {
    #[serde(default)]
    pub use_pnl_auto_manual: bool,
    #[serde(default = "default_manual_threshold")]
    pub pnl_auto_manual_threshold: Decimal,
    #[serde(default)]
    pub use_pnl_auto_cal: bool,
    #[serde(default = "default_cal_times")]
    pub pnl_auto_cal_times: Decimal,
    #[serde(default)]
    pub use_pnl_auto_cal_loss: bool,
    #[serde(default = "default_loss_times")]
    pub pnl_auto_cal_loss_times: Decimal,
    #[serde(default)]
    pub use_size_auto_cal: bool,
    #[serde(default = "default_size_times")]
    pub size_auto_cal_times: Decimal,
    #[serde(default)]
    pub use_size_auto_cal_loss: bool,
    #[serde(default = "default_loss_times")]
    pub size_auto_cal_loss_times: Decimal,
}

fn default_manual_threshold() -> Decimal {
    dec!(100)
}

fn default_cal_times() -> Decimal {
    dec!(4)
}

fn default_loss_times() -> Decimal {
    dec!(1.5)
}

fn default_size_times() -> Decimal {
    dec!(2)
}

impl Default for AutoExitConfig {
    fn default() -> Self {
        Self {
            use_pnl_auto_manual: false,
            pnl_auto_manual_threshold: default_manual_threshold(),
            use_pnl_auto_cal: false,
            pnl_auto_cal_times: default_cal_times(),
            use_pnl_auto_cal_loss: false,
            pnl_auto_cal_loss_times: default_loss_times(),
            use_size_auto_cal: false,
            size_auto_cal_times: default_size_times(),
            use_size_auto_cal_loss: false,
            size_auto_cal_loss_times: default_loss_times(),
        }
    }
}

/// Averaging ("auto-add") settings. The secondary budget is independent of
/// the primary capital cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAddConfig {
    /// Add volume targeting break-even (PnL back above zero).
    #[serde(default)]
    pub use_add_pos_above_zero: bool,
    /// Add volume targeting a fee-multiple profit.
    #[serde(default)]
    pub use_add_pos_profit_target: bool,
    /// Expected recovery percent per added notional unit.
    #[serde(default = "default_recovery_percent")]
    pub add_pos_recovery_percent: Decimal,
    /// Profit target as a multiple of the round-trip fee.
    #[serde(default = "default_profit_multiplier")]
    pub add_pos_profit_multiplier: Decimal,
    /// Adverse move (percent of entry) required before the first add.
    #[serde(default = "default_first_add_gap")]
    pub first_add_gap_percent: Decimal,
    /// Adverse move (percent of entry) required before each further add.
    #[serde(default = "default_next_add_gap")]
    pub next_add_gap_percent: Decimal,
    /// First add size as percent of current position notional.
    #[serde(default = "default_add_size_percent")]
    pub first_add_size_percent: Decimal,
    /// Subsequent add size as percent of current position notional.
    #[serde(default = "default_add_size_percent")]
    pub next_add_size_percent: Decimal,
    /// Maximum adds per position lifecycle.
    #[serde(default = "default_max_add_count")]
    pub max_add_count: u32,
    /// Secondary notional budget for adds, independent of the primary cap.
    #[serde(default = "default_max_add_used")]
    pub max_add_used: Decimal,
}

fn default_recovery_percent() -> Decimal {
    dec!(0.6)
}

fn default_profit_multiplier() -> Decimal {
    dec!(1.5)
}

fn default_first_add_gap() -> Decimal {
    dec!(0.5)
}

fn default_next_add_gap() -> Decimal {
    dec!(1)
}

fn default_add_size_percent() -> Decimal {
    dec!(50)
}

fn default_max_add_count() -> u32 {
    3
}

fn default_max_add_used() -> Decimal {
    dec!(500)
}

impl Default for AutoAddConfig {
    fn default() -> Self {
        Self {
            use_add_pos_above_zero: false,
            use_add_pos_profit_target: false,
            add_pos_recovery_percent: default_recovery_percent(),
            add_pos_profit_multiplier: default_profit_multiplier(),
            first_add_gap_percent: default_first_add_gap(),
            next_add_gap_percent: default_next_add_gap(),
            first_add_size_percent: default_add_size_percent(),
            next_add_size_percent: default_add_size_percent(),
            max_add_count: default_max_add_count(),
            max_add_used: default_max_add_used(),
        }
    }
}

/// Pending-entry cancellation rules.
///
/// The "TP already passed by market" rules are inherited with their original
/// polarity and ship disabled; their intent was never clarified upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationConfig {
    /// Cancel entries older than this many seconds.
    #[serde(default = "default_cancel_unfilled_seconds")]
    pub cancel_unfilled_seconds: u64,
    /// Long: cancel when market rises above the limit price.
    #[serde(default = "default_true")]
    pub cancel_on_entry_price_above_market: bool,
    /// Short: cancel when market falls below the limit price.
    #[serde(default = "default_true")]
    pub cancel_on_entry_price_below_market: bool,
    /// Long: cancel when the prospective TP has been passed. Off by default.
    #[serde(default)]
    pub cancel_on_tp_price_above_market: bool,
    /// Short: cancel when the prospective TP has been passed. Off by default.
    #[serde(default)]
    pub cancel_on_tp_price_below_market: bool,
}

fn default_cancel_unfilled_seconds() -> u64 {
    90
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            cancel_unfilled_seconds: default_cancel_unfilled_seconds(),
            cancel_on_entry_price_above_market: true,
            cancel_on_entry_price_below_market: true,
            cancel_on_tp_price_above_market: false,
            cancel_on_tp_price_below_market: false,
        }
    }
}

/// Liquidation-proximity margin top-up for isolated positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginGuardConfig {
    #[serde(default)]
    pub use_auto_margin: bool,
    /// Extra margin beyond the SL/liquidation gap.
    #[serde(default = "default_auto_margin_offset")]
    pub auto_margin_offset: Decimal,
}

fn default_auto_margin_offset() -> Decimal {
    dec!(30)
}

impl Default for MarginGuardConfig {
    fn default() -> Self {
        Self {
            use_auto_margin: false,
            auto_margin_offset: default_auto_margin_offset(),
        }
    }
}

/// One credential triple.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialProfile {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: String,
}

impl CredentialProfile {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty() && !self.passphrase.is_empty()
    }
}

/// (developer | user) x (demo | live) credential sets with two selector
/// flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub use_developer_api: bool,
    #[serde(default)]
    pub use_demo: bool,
    #[serde(default)]
    pub user_live: CredentialProfile,
    #[serde(default)]
    pub user_demo: CredentialProfile,
    #[serde(default)]
    pub dev_live: CredentialProfile,
    #[serde(default)]
    pub dev_demo: CredentialProfile,
}

impl CredentialConfig {
    /// The profile selected by the two flags.
    pub fn active_profile(&self) -> &CredentialProfile {
        match (self.use_developer_api, self.use_demo) {
            (true, true) => &self.dev_demo,
            (true, false) => &self.dev_live,
            (false, true) => &self.user_demo,
            (false, false) => &self.user_live,
        }
    }

    /// Build transport credentials from the active profile.
    pub fn active_credentials(&self) -> Credentials {
        let profile = self.active_profile();
        Credentials::new(
            profile.api_key.clone(),
            profile.api_secret.clone(),
            profile.passphrase.clone(),
            self.use_demo,
        )
    }
}

/// Endpoint overrides; the demo flag selects the matching defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub public_ws_url: Option<String>,
    #[serde(default)]
    pub private_ws_url: Option<String>,
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Config(format!("failed to read config: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))
    }

    /// Validate once at load. `active` demands trading-ready settings;
    /// passive monitoring tolerates missing credentials.
    pub fn validate(&self, active: bool) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.trading.symbol.is_empty() {
            problems.push("trading.symbol is empty".to_string());
        }
        if self.trading.leverage == 0 {
            problems.push("trading.leverage must be at least 1".to_string());
        }
        if self.capital.rate_divisor < Decimal::ONE {
            problems.push("capital.rate_divisor must be at least 1".to_string());
        }
        if self.capital.trade_fee_percentage.is_sign_negative() {
            problems.push("capital.trade_fee_percentage must not be negative".to_string());
        }
        if active && !self.credentials.active_profile().is_complete() {
            problems.push("selected credential profile is incomplete".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    pub fn rest_url(&self) -> String {
        self.endpoints
            .rest_url
            .clone()
            .unwrap_or_else(|| okto_rest::LIVE_REST_URL.to_string())
    }

    pub fn public_ws_url(&self) -> String {
        self.endpoints.public_ws_url.clone().unwrap_or_else(|| {
            if self.credentials.use_demo {
                okto_ws::DEMO_PUBLIC_WS_URL.to_string()
            } else {
                okto_ws::LIVE_PUBLIC_WS_URL.to_string()
            }
        })
    }

    pub fn private_ws_url(&self) -> String {
        self.endpoints.private_ws_url.clone().unwrap_or_else(|| {
            if self.credentials.use_demo {
                okto_ws::DEMO_PRIVATE_WS_URL.to_string()
            } else {
                okto_ws::LIVE_PRIVATE_WS_URL.to_string()
            }
        })
    }

    /// Compute the live-update delta against a replacement config.
    pub fn diff(&self, new: &EngineConfig) -> ConfigDelta {
        ConfigDelta {
            leverage_changed: (self.trading.leverage != new.trading.leverage)
                .then_some(new.trading.leverage),
            symbol_changed: (self.trading.symbol != new.trading.symbol)
                .then(|| new.trading.symbol.clone()),
            position_mode_changed: (self.trading.position_mode != new.trading.position_mode)
                .then_some(new.trading.position_mode),
            credentials_changed: self.credentials.use_demo != new.credentials.use_demo
                || self.credentials.use_developer_api != new.credentials.use_developer_api,
        }
    }
}

/// What a live config update has to push to the exchange.
#[derive(Debug, Clone, Default)]
pub struct ConfigDelta {
    pub leverage_changed: Option<u32>,
    pub symbol_changed: Option<String>,
    pub position_mode_changed: Option<PositionMode>,
    pub credentials_changed: bool,
}

/// Typed result of a live config update.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdateOutcome {
    pub success: bool,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_bot() {
        let config = EngineConfig::default();
        assert_eq!(config.capital.max_allowed_used, dec!(1000));
        assert_eq!(config.capital.rate_divisor, Decimal::ONE);
        assert_eq!(config.capital.trade_fee_percentage, dec!(0.07));
        assert_eq!(config.trading.leverage, 20);
        assert_eq!(config.cancellation.cancel_unfilled_seconds, 90);
        assert_eq!(config.exits.auto.pnl_auto_cal_times, dec!(4));
        // The TP-passed cancel rules ship disabled.
        assert!(!config.cancellation.cancel_on_tp_price_above_market);
        assert!(!config.cancellation.cancel_on_tp_price_below_market);
        // Entry-unfavorable rules ship enabled.
        assert!(config.cancellation.cancel_on_entry_price_above_market);
        assert!(config.cancellation.cancel_on_entry_price_below_market);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [trading]
            symbol = "BTC-USDT-SWAP"
            direction = "both"
            [capital]
            max_allowed_used = "2500"
            [exits]
            tp_price_offset = "10"
            "#,
        )
        .unwrap();
        assert_eq!(config.trading.symbol, "BTC-USDT-SWAP");
        assert_eq!(config.trading.direction, TradeDirection::Both);
        assert_eq!(config.capital.max_allowed_used, dec!(2500));
        assert_eq!(config.exits.tp_price_offset, Some(dec!(10)));
        // Untouched sections fall back to defaults.
        assert_eq!(config.capital.target_order_amount, dec!(100));
    }

    #[test]
    fn test_validate_active_requires_credentials() {
        let config = EngineConfig::default();
        assert!(config.validate(false).is_ok());
        let problems = config.validate(true).unwrap_err();
        assert!(problems.iter().any(|p| p.contains("credential")));
    }

    #[test]
    fn test_credential_profile_selection() {
        let mut config = CredentialConfig {
            use_developer_api: true,
            use_demo: true,
            ..Default::default()
        };
        config.dev_demo.api_key = "dd".to_string();
        config.user_live.api_key = "ul".to_string();

        assert_eq!(config.active_profile().api_key, "dd");
        config.use_developer_api = false;
        config.use_demo = false;
        assert_eq!(config.active_profile().api_key, "ul");
        assert!(!config.active_credentials().simulated);
    }

    #[test]
    fn test_diff_detects_changes() {
        let old = EngineConfig::default();
        let mut new = EngineConfig::default();
        new.trading.leverage = 10;
        new.trading.symbol = "SOL-USDT-SWAP".to_string();

        let delta = old.diff(&new);
        assert_eq!(delta.leverage_changed, Some(10));
        assert_eq!(delta.symbol_changed.as_deref(), Some("SOL-USDT-SWAP"));
        assert!(delta.position_mode_changed.is_none());
        assert!(!delta.credentials_changed);
    }
}
