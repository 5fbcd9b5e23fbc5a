//! Liveness derivation from traffic recency
//!
//! The device reports every `iot.PMQint` seconds. A device that stays silent
//! for two intervals plus a grace period is considered offline; without a
//! known interval a fixed ten minute window applies.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Timeout when the device has not told us its reporting interval
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Lower bound for the adaptive timeout
pub const MIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack added on top of two reporting intervals
pub const GRACE: Duration = Duration::from_secs(15);

/// Recommended period for calling `StateAggregator::check_liveness`
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Silence window after which the device counts as offline
///
/// `max(60, 2 * interval + 15)` seconds, or 600 seconds without an interval.
pub fn adaptive_timeout(report_interval: Option<u64>) -> Duration {
    match report_interval {
        Some(secs) if secs > 0 => {
            let adaptive = Duration::from_secs(secs.saturating_mul(2)).saturating_add(GRACE);
            adaptive.max(MIN_TIMEOUT)
        }
        _ => DEFAULT_TIMEOUT,
    }
}

/// True when more than `timeout` has passed between `last_update` and `now`
pub fn is_expired(last_update: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let limit = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(last_update) > limit
}

/// Emitted once when the device is judged offline
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessTransition {
    /// Time of the last accepted merge
    pub last_update: DateTime<Utc>,
    /// Time of the check that detected the silence
    pub detected_at: DateTime<Utc>,
    /// Window that was exceeded
    pub timeout: Duration,
}

impl LivenessTransition {
    pub fn silent_for(&self) -> TimeDelta {
        self.detected_at.signed_duration_since(self.last_update)
    }
}

impl fmt::Display for LivenessTransition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "no message for {}s (timeout {}s, last update {})",
            self.silent_for().num_seconds(),
            self.timeout.as_secs(),
            self.last_update.to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_follows_reporting_interval() {
        assert_eq!(adaptive_timeout(Some(30)), Duration::from_secs(75));
        assert_eq!(adaptive_timeout(Some(120)), Duration::from_secs(255));
    }

    #[test]
    fn timeout_has_a_floor() {
        assert_eq!(adaptive_timeout(Some(5)), Duration::from_secs(60));
        assert_eq!(adaptive_timeout(Some(22)), Duration::from_secs(60));
    }

    #[test]
    fn timeout_defaults_without_interval() {
        assert_eq!(adaptive_timeout(None), Duration::from_secs(600));
        assert_eq!(adaptive_timeout(Some(0)), Duration::from_secs(600));
    }

    #[test]
    fn expiry_is_strict() {
        let last = Utc::now();
        let timeout = Duration::from_secs(75);
        assert!(!is_expired(last, last + TimeDelta::seconds(74), timeout));
        assert!(!is_expired(last, last + TimeDelta::seconds(75), timeout));
        assert!(is_expired(last, last + TimeDelta::seconds(76), timeout));
    }

    #[test]
    fn transition_reports_silence() {
        let last = Utc::now();
        let transition = LivenessTransition {
            last_update: last,
            detected_at: last + TimeDelta::seconds(90),
            timeout: Duration::from_secs(75),
        };
        assert_eq!(transition.silent_for().num_seconds(), 90);
        assert!(transition.to_string().starts_with("no message for 90s (timeout 75s"));
    }
}
