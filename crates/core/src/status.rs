//! Per-peer contact status and retry policy.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Time;

/// Outcome of the most recent contact attempt with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Last conversation completed
    Complete,
    /// Could not open a port
    PortFailed,
    /// Dialing failed
    DialFailed,
    /// Login failed
    LoginFailed,
    /// Handshake failed
    HandshakeFailed,
    /// Conversation failed after it started
    Failed,
    /// A conversation is in progress
    Talking,
    /// The peer may not be called at this time
    WrongTime,
}

impl StatusKind {
    /// Whether this outcome counts as a failed attempt.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StatusKind::PortFailed
                | StatusKind::DialFailed
                | StatusKind::LoginFailed
                | StatusKind::HandshakeFailed
                | StatusKind::Failed
        )
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusKind::Complete => "conversation complete",
            StatusKind::PortFailed => "port unavailable",
            StatusKind::DialFailed => "dial failed",
            StatusKind::LoginFailed => "login failed",
            StatusKind::HandshakeFailed => "handshake failed",
            StatusKind::Failed => "call failed",
            StatusKind::Talking => "talking",
            StatusKind::WrongTime => "wrong time to call",
        };
        f.write_str(text)
    }
}

/// Backoff thresholds. These only ever come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Wait after the first failure
    pub base_wait_secs: u64,
    /// Upper bound on the wait between attempts
    pub max_wait_secs: u64,
    /// Consecutive failures after which no retry is due
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_wait_secs: 600,
            max_wait_secs: 6 * 3600,
            max_retries: 26,
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt after `retries` consecutive failures.
    ///
    /// Doubles from `base_wait_secs` and is capped at `max_wait_secs`.
    pub fn wait_after(&self, retries: u32) -> u64 {
        if retries == 0 {
            return 0;
        }
        let factor = 1u64.checked_shl(retries - 1).unwrap_or(u64::MAX);
        self.base_wait_secs
            .saturating_mul(factor)
            .min(self.max_wait_secs)
    }
}

/// Record of the last contact attempt with one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Outcome
    pub kind: StatusKind,
    /// Consecutive failed attempts
    pub retries: u32,
    /// When the attempt was made
    pub last: Time,
    /// Seconds to wait after `last` before retrying
    pub wait_secs: u64,
}

impl Status {
    /// A successful contact resets the retry count.
    pub fn complete(now: Time) -> Self {
        Self {
            kind: StatusKind::Complete,
            retries: 0,
            last: now,
            wait_secs: 0,
        }
    }

    /// Mark a conversation as in progress, keeping the retry history.
    pub fn talking(previous: Option<&Status>, now: Time) -> Self {
        Self {
            kind: StatusKind::Talking,
            retries: previous.map_or(0, |s| s.retries),
            last: now,
            wait_secs: 0,
        }
    }

    /// Record a failed attempt following `previous`.
    pub fn failed(kind: StatusKind, previous: Option<&Status>, policy: &RetryPolicy, now: Time) -> Self {
        let retries = if kind.is_failure() {
            previous.map_or(0, |s| s.retries).saturating_add(1)
        } else {
            previous.map_or(0, |s| s.retries)
        };
        Self {
            kind,
            retries,
            last: now,
            wait_secs: policy.wait_after(retries),
        }
    }

    /// Earliest time another attempt is allowed, if any is.
    pub fn next_attempt(&self, policy: &RetryPolicy) -> Option<Time> {
        if !self.kind.is_failure() {
            return Some(self.last);
        }
        if self.retries >= policy.max_retries {
            return None;
        }
        let wait = i64::try_from(self.wait_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        self.last.checked_add_signed(chrono::Duration::seconds(wait))
    }

    /// Whether a new attempt is due at `now`.
    pub fn retry_due(&self, policy: &RetryPolicy, now: Time) -> bool {
        self.next_attempt(policy).is_some_and(|at| now >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_wait_secs: 60,
            max_wait_secs: 300,
            max_retries: 10,
        };
        assert_eq!(policy.wait_after(0), 0);
        assert_eq!(policy.wait_after(1), 60);
        assert_eq!(policy.wait_after(2), 120);
        assert_eq!(policy.wait_after(3), 240);
        assert_eq!(policy.wait_after(4), 300);
        assert_eq!(policy.wait_after(200), 300);
    }

    #[test]
    fn test_failure_defers_retry() {
        let policy = RetryPolicy {
            base_wait_secs: 60,
            max_wait_secs: 600,
            max_retries: 3,
        };
        let now = Utc::now();
        let status = Status::failed(StatusKind::DialFailed, None, &policy, now);
        assert_eq!(status.retries, 1);
        assert!(!status.retry_due(&policy, now + Duration::seconds(59)));
        assert!(status.retry_due(&policy, now + Duration::seconds(60)));

        let again = Status::failed(StatusKind::LoginFailed, Some(&status), &policy, now);
        assert_eq!(again.retries, 2);
        assert_eq!(again.wait_secs, 120);
    }

    #[test]
    fn test_retries_exhausted() {
        let policy = RetryPolicy {
            base_wait_secs: 1,
            max_wait_secs: 1,
            max_retries: 2,
        };
        let now = Utc::now();
        let first = Status::failed(StatusKind::Failed, None, &policy, now);
        let second = Status::failed(StatusKind::Failed, Some(&first), &policy, now);
        assert!(second.next_attempt(&policy).is_none());
        assert!(!second.retry_due(&policy, now + Duration::days(1)));
    }

    #[test]
    fn test_complete_resets() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let failed = Status::failed(StatusKind::Failed, None, &policy, now);
        let talking = Status::talking(Some(&failed), now);
        assert_eq!(talking.retries, 1);
        let done = Status::complete(now);
        assert_eq!(done.retries, 0);
        assert!(done.retry_due(&policy, now));
    }
}
