//! Pure retry and escalation decisions
//!
//! Kept free of I/O so every branch of the supervisor's decision making can be
//! tested without a broker or a clock.

use std::fmt;
use std::time::Duration;

/// Fixed reconnect delay between dial attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Bounded, fixed-delay retry for dialing the broker.
///
/// No exponential growth and no jitter: the delay between attempts is always
/// `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total dial attempts per acquisition (0 means never dial)
    pub max_attempts: u64,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: RECONNECT_DELAY,
        }
    }
}

/// Decision result for the next dial attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dial now; `attempt` is 1-based
    Proceed { attempt: u64 },
    /// Supervisor is shutting down
    AbortShutdownRequested,
    /// Every configured attempt has been used
    AbortExhausted,
}

impl RetryPolicy {
    /// Decide what to do after `completed` failed attempts
    pub fn decide(&self, completed: u64, shutdown_requested: bool) -> RetryDecision {
        if shutdown_requested {
            return RetryDecision::AbortShutdownRequested;
        }
        if completed >= self.max_attempts {
            return RetryDecision::AbortExhausted;
        }
        RetryDecision::Proceed {
            attempt: completed + 1,
        }
    }

    /// Whether a failure on `attempt` is followed by another attempt
    pub fn has_attempt_after(&self, attempt: u64) -> bool {
        attempt < self.max_attempts
    }

    /// Longest time an acquisition spends sleeping between attempts
    pub fn max_total_delay(&self) -> Duration {
        let sleeps = self.max_attempts.saturating_sub(1);
        self.delay
            .saturating_mul(u32::try_from(sleeps).unwrap_or(u32::MAX))
    }
}

/// The two supervised resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Connection,
    Channel,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Connection => f.write_str("connection"),
            ResourceKind::Channel => f.write_str("channel"),
        }
    }
}

/// What happens when recovery of a resource fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Move the caller-facing signal to `Abandoned`
    NotifyCaller,
    /// Log and keep supervising
    LogOnly,
}

/// Escalation per resource kind.
///
/// A lost channel can be reopened on a healthy connection without the caller
/// noticing. A lost connection that cannot be re-established is total service
/// loss and the caller must rebuild the supervisor.
pub const ESCALATION_POLICY: [(ResourceKind, Escalation); 2] = [
    (ResourceKind::Connection, Escalation::NotifyCaller),
    (ResourceKind::Channel, Escalation::LogOnly),
];

/// Look up the escalation for `kind` in [`ESCALATION_POLICY`]
pub fn escalation_for(kind: ResourceKind) -> Escalation {
    ESCALATION_POLICY
        .iter()
        .find(|(candidate, _)| *candidate == kind)
        .map(|(_, escalation)| *escalation)
        .unwrap_or(Escalation::LogOnly)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(3));
    }

    #[test]
    fn test_decide_walks_through_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: RECONNECT_DELAY,
        };

        assert_eq!(policy.decide(0, false), RetryDecision::Proceed { attempt: 1 });
        assert_eq!(policy.decide(2, false), RetryDecision::Proceed { attempt: 3 });
        assert_eq!(policy.decide(3, false), RetryDecision::AbortExhausted);
    }

    #[test]
    fn test_zero_attempts_never_dials() {
        let policy = RetryPolicy {
            max_attempts: 0,
            delay: RECONNECT_DELAY,
        };
        assert_eq!(policy.decide(0, false), RetryDecision::AbortExhausted);
    }

    #[test]
    fn test_shutdown_wins_over_remaining_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, true),
            RetryDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_no_sleep_after_last_attempt() {
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: RECONNECT_DELAY,
        };
        assert!(policy.has_attempt_after(1));
        assert!(!policy.has_attempt_after(2));
        assert_eq!(policy.max_total_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_escalation_is_asymmetric() {
        assert_eq!(
            escalation_for(ResourceKind::Connection),
            Escalation::NotifyCaller
        );
        assert_eq!(escalation_for(ResourceKind::Channel), Escalation::LogOnly);
    }

    #[test]
    fn test_resource_kind_display() {
        assert_eq!(ResourceKind::Connection.to_string(), "connection");
        assert_eq!(ResourceKind::Channel.to_string(), "channel");
    }
}
