//! Subscription confirmation tracking and the dual-stream readiness gate.
//!
//! A stream is Ready only when every channel it requested has been echoed
//! back by an `event:subscribe` acknowledgement. Anything waiting for "the
//! connection" waits on the shared [`ReadinessGate`], which covers both the
//! market and the account stream.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Connection lifecycle phase of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Disconnected,
    Connecting,
    /// Connected (and, for the private stream, logged in), waiting for
    /// subscription acknowledgements.
    SubscriptionsPending,
    Ready,
}

impl std::fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::SubscriptionsPending => "SUBSCRIPTIONS_PENDING",
            Self::Ready => "READY",
        };
        write!(f, "{s}")
    }
}

/// Requested-vs-confirmed channel bookkeeping for one connection attempt.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    requested: HashSet<String>,
    confirmed: HashSet<String>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a channel we are about to subscribe to.
    pub fn request(&mut self, key: String) {
        self.requested.insert(key);
    }

    /// Record a subscribe acknowledgement. Returns true once the confirmed
    /// set equals the requested set.
    pub fn confirm(&mut self, key: &str) -> bool {
        if self.requested.contains(key) {
            self.confirmed.insert(key.to_string());
            debug!(
                channel = key,
                confirmed = self.confirmed.len(),
                requested = self.requested.len(),
                "subscription confirmed"
            );
        }
        self.all_confirmed()
    }

    pub fn all_confirmed(&self) -> bool {
        !self.requested.is_empty() && self.confirmed == self.requested
    }

    /// Drop all state for a fresh connection attempt.
    pub fn reset(&mut self) {
        self.requested.clear();
        self.confirmed.clear();
    }
}

#[derive(Debug, Default)]
struct GateState {
    market_ready: bool,
    account_ready: bool,
}

/// Shared readiness gate spanning the market and account streams.
///
/// Waiters are woken on every transition; "connected" means both streams
/// report Ready simultaneously.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_market_ready(&self, ready: bool) {
        self.state.lock().market_ready = ready;
        self.notify.notify_waiters();
    }

    pub fn set_account_ready(&self, ready: bool) {
        self.state.lock().account_ready = ready;
        self.notify.notify_waiters();
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.market_ready && state.account_ready
    }

    pub fn market_ready(&self) -> bool {
        self.state.lock().market_ready
    }

    pub fn account_ready(&self) -> bool {
        self.state.lock().account_ready
    }

    /// Wait until both streams are ready, bounded by `timeout`.
    pub async fn wait_both_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.is_ready() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.is_ready();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_requires_full_confirmation() {
        let mut tracker = SubscriptionTracker::new();
        tracker.request("trades:ETH-USDT-SWAP".to_string());
        tracker.request("tickers:ETH-USDT-SWAP".to_string());

        assert!(!tracker.confirm("trades:ETH-USDT-SWAP"));
        // Unknown channels do not count.
        assert!(!tracker.confirm("candle1m:ETH-USDT-SWAP"));
        assert!(tracker.confirm("tickers:ETH-USDT-SWAP"));
        assert!(tracker.all_confirmed());

        tracker.reset();
        assert!(!tracker.all_confirmed());
    }

    #[test]
    fn test_empty_tracker_is_not_confirmed() {
        let tracker = SubscriptionTracker::new();
        assert!(!tracker.all_confirmed());
    }

    #[tokio::test]
    async fn test_gate_requires_both_streams() {
        let gate = ReadinessGate::new();
        gate.set_market_ready(true);
        assert!(!gate.is_ready());
        assert!(!gate.wait_both_ready(Duration::from_millis(20)).await);

        gate.set_account_ready(true);
        assert!(gate.is_ready());
        assert!(gate.wait_both_ready(Duration::from_millis(20)).await);

        // Dropping one side drops readiness.
        gate.set_market_ready(false);
        assert!(!gate.is_ready());
    }

    #[tokio::test]
    async fn test_gate_wakes_waiter_on_transition() {
        use std::sync::Arc;
        let gate = Arc::new(ReadinessGate::new());
        gate.set_market_ready(true);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_both_ready(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.set_account_ready(true);

        assert!(waiter.await.unwrap());
    }
}
