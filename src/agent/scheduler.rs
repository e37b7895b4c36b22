use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::state::PollingMode;

/// Heartbeats are never sent more often than this
pub const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Adaptive polling cadence.
///
/// Polls at the active interval while there is work, then backs off by half
/// again on every quiet poll until reaching the idle interval.
pub struct PollingScheduler {
    active: Duration,
    idle: Duration,
    interval: Duration,
    mode: PollingMode,
}

impl PollingScheduler {
    /// Create a scheduler; both intervals are at least 1s and idle never
    /// undercuts active
    pub fn new(active_secs: u64, idle_secs: u64) -> Self {
        let active = Duration::from_secs(active_secs.max(1));
        let idle = Duration::from_secs(idle_secs.max(1)).max(active);
        Self {
            active,
            idle,
            interval: active,
            mode: PollingMode::Active,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> PollingMode {
        self.mode
    }

    /// Advance after a poll and return the next interval
    pub fn next(&mut self, has_active_work: bool) -> Duration {
        if has_active_work {
            self.interval = self.active;
            self.mode = PollingMode::Active;
        } else {
            let grown = Duration::from_secs(self.interval.as_secs().saturating_mul(3).div_ceil(2));
            self.interval = grown.max(self.active).min(self.idle);
            self.mode = PollingMode::Idle;
        }
        self.interval
    }

    /// Minimum spacing between heartbeats at the current cadence
    pub fn heartbeat_period(&self) -> Duration {
        self.interval.max(MIN_HEARTBEAT_PERIOD)
    }

    /// Sleep for the current interval; returns false if canceled first
    pub async fn sleep(&self, cancel: &CancellationToken) -> bool {
        tracing::debug!(
            "Sleeping for {} seconds until next poll ({})",
            self.interval.as_secs(),
            self.mode
        );
        sleep_or_cancel(self.interval, cancel).await
    }
}

/// Sleep for `duration` unless `cancel` fires first; returns false on cancel
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
