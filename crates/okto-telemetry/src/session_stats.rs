//! Session trade statistics and daily report snapshots.
//!
//! Realized PnL is reconstructed from exchange fills (pnl + fee per fill)
//! filtered to the current session window. A daily report is snapshotted
//! once per UTC day and the report history persists as JSON across
//! restarts; the per-session totals do not.

use crate::error::{TelemetryError, TelemetryResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// One end-of-day performance snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    /// UTC date, `YYYY-MM-DD`.
    pub date: String,
    pub total_capital: Decimal,
    pub net_trade_profit: Decimal,
    /// Equity ratio against the previous report.
    pub compound_interest: Decimal,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(default)]
    daily_reports: Vec<DailyReport>,
}

/// In-memory session statistics with persisted daily history.
#[derive(Debug, Default)]
pub struct SessionStats {
    session_start_ms: i64,
    total_trade_profit: Decimal,
    total_trade_loss: Decimal,
    daily_reports: Vec<DailyReport>,
    path: Option<PathBuf>,
}

impl SessionStats {
    /// Create with an optional persistence path; existing daily history is
    /// loaded when present.
    pub fn new(path: Option<PathBuf>) -> Self {
        let mut stats = Self {
            path,
            ..Default::default()
        };
        if let Err(e) = stats.load() {
            warn!(error = %e, "could not load session stats history");
        }
        stats
    }

    /// Reset the per-session window and totals (a fresh trading start).
    pub fn reset_session(&mut self, start_ms: i64) {
        self.session_start_ms = start_ms;
        self.total_trade_profit = Decimal::ZERO;
        self.total_trade_loss = Decimal::ZERO;
        info!("session trade metrics reset");
    }

    pub fn session_start_ms(&self) -> i64 {
        self.session_start_ms
    }

    /// Rebuild the session totals from fills `(timestamp_ms, net_pnl)`.
    /// Fills before the session window are ignored.
    pub fn apply_fills<I>(&mut self, fills: I) -> Decimal
    where
        I: IntoIterator<Item = (i64, Decimal)>,
    {
        let mut profit = Decimal::ZERO;
        let mut loss = Decimal::ZERO;
        let mut session_pnl = Decimal::ZERO;

        for (ts_ms, net) in fills {
            if ts_ms < self.session_start_ms {
                continue;
            }
            session_pnl += net;
            if net > Decimal::ZERO {
                profit += net;
            } else {
                loss += net.abs();
            }
        }

        self.total_trade_profit = profit;
        self.total_trade_loss = loss;
        session_pnl
    }

    pub fn total_trade_profit(&self) -> Decimal {
        self.total_trade_profit
    }

    pub fn total_trade_loss(&self) -> Decimal {
        self.total_trade_loss
    }

    pub fn net_trade_profit(&self) -> Decimal {
        self.total_trade_profit - self.total_trade_loss
    }

    pub fn daily_reports(&self) -> &[DailyReport] {
        &self.daily_reports
    }

    /// Snapshot a daily report at the first call of each UTC day.
    /// Returns the new report when one was taken.
    pub fn maybe_daily_report(
        &mut self,
        total_equity: Decimal,
        now: DateTime<Utc>,
    ) -> Option<DailyReport> {
        let today = now.format("%Y-%m-%d").to_string();
        if self.daily_reports.last().is_some_and(|r| r.date == today) {
            return None;
        }

        let prev_capital = self
            .daily_reports
            .last()
            .map(|r| r.total_capital)
            .unwrap_or(total_equity);
        let compound_interest = if prev_capital > Decimal::ZERO {
            (total_equity / prev_capital).round_dp(4)
        } else {
            Decimal::ONE
        };

        let report = DailyReport {
            date: today,
            total_capital: total_equity,
            net_trade_profit: self.net_trade_profit(),
            compound_interest,
        };
        info!(
            date = %report.date,
            capital = %report.total_capital,
            net = %report.net_trade_profit,
            "daily report saved"
        );
        self.daily_reports.push(report.clone());
        if let Err(e) = self.save() {
            warn!(error = %e, "could not persist daily reports");
        }
        Some(report)
    }

    fn load(&mut self) -> TelemetryResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| TelemetryError::Persistence(e.to_string()))?;
        let persisted: PersistedStats =
            serde_json::from_str(&content).map_err(|e| TelemetryError::Persistence(e.to_string()))?;
        self.daily_reports = persisted.daily_reports;
        Ok(())
    }

    fn save(&self) -> TelemetryResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let persisted = PersistedStats {
            daily_reports: self.daily_reports.clone(),
        };
        let content = serde_json::to_string_pretty(&persisted)
            .map_err(|e| TelemetryError::Persistence(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| TelemetryError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fills_split_into_profit_and_loss() {
        let mut stats = SessionStats::new(None);
        stats.reset_session(1000);

        let session_pnl = stats.apply_fills(vec![
            (500, dec!(99)),   // before session start: ignored
            (1500, dec!(10)),  // win
            (1600, dec!(-4)),  // loss
            (1700, dec!(6)),   // win
        ]);
        assert_eq!(session_pnl, dec!(12));
        assert_eq!(stats.total_trade_profit(), dec!(16));
        assert_eq!(stats.total_trade_loss(), dec!(4));
        assert_eq!(stats.net_trade_profit(), dec!(12));
    }

    #[test]
    fn test_apply_fills_rebuilds_rather_than_accumulates() {
        let mut stats = SessionStats::new(None);
        stats.reset_session(0);
        stats.apply_fills(vec![(1, dec!(10))]);
        // The same window scanned again must not double-count.
        stats.apply_fills(vec![(1, dec!(10))]);
        assert_eq!(stats.total_trade_profit(), dec!(10));
    }

    #[test]
    fn test_daily_report_once_per_day() {
        let mut stats = SessionStats::new(None);
        stats.reset_session(0);
        stats.apply_fills(vec![(1, dec!(50))]);

        let day = Utc.with_ymd_and_hms(2024, 3, 5, 0, 1, 0).unwrap();
        let report = stats.maybe_daily_report(dec!(1100), day).unwrap();
        assert_eq!(report.date, "2024-03-05");
        assert_eq!(report.net_trade_profit, dec!(50));
        // First report measures against itself.
        assert_eq!(report.compound_interest, dec!(1.0000));

        // Same day: no second report.
        assert!(stats.maybe_daily_report(dec!(1200), day).is_none());

        // Next day: compound vs yesterday's capital.
        let next = Utc.with_ymd_and_hms(2024, 3, 6, 0, 1, 0).unwrap();
        let report = stats.maybe_daily_report(dec!(1210), next).unwrap();
        assert_eq!(report.compound_interest, dec!(1.1000));
    }
}
