//! Reconnection backoff policy.
//!
//! A fixed schedule indexed by attempt count. Once attempts run past the end
//! of the schedule the last delay repeats, so retries never stop on their own.

// Rust guideline compliant 2026-02

use std::time::Duration;

use crate::constants::RECONNECT_SCHEDULE_MS;

/// Maps a reconnect attempt count to a wait duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    schedule: Vec<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            schedule: RECONNECT_SCHEDULE_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl BackoffPolicy {
    /// Build a policy from a millisecond schedule.
    ///
    /// Returns `None` for an empty schedule.
    pub fn from_millis(schedule_ms: &[u64]) -> Option<Self> {
        if schedule_ms.is_empty() {
            return None;
        }
        Some(Self {
            schedule: schedule_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        })
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let last = self.schedule.len().saturating_sub(1);
        let index = usize::try_from(attempt).map_or(last, |a| a.min(last));
        self.schedule.get(index).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(2), Duration::from_millis(5_000));
        assert_eq!(policy.delay(3), Duration::from_millis(10_000));
        assert_eq!(policy.delay(4), Duration::from_millis(20_000));
    }

    #[test]
    fn test_delay_clamps_to_last_entry() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(5), Duration::from_millis(20_000));
        assert_eq!(policy.delay(1_000), Duration::from_millis(20_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(20_000));
    }

    #[test]
    fn test_custom_schedule() {
        let policy = BackoffPolicy::from_millis(&[100, 250]).unwrap();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_empty_schedule_rejected() {
        assert!(BackoffPolicy::from_millis(&[]).is_none());
    }
}
