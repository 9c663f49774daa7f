//! Delay between recovery attempts.

use std::time::Duration;

/// How long to wait before each recovery attempt, and how many attempts to
/// make before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryBackoffPolicy {
    /// Same delay before every attempt.
    Fixed {
        delay: Duration,
        max_attempts: u32,
    },
    /// Starts at `initial`, doubles after each failed attempt, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl Default for RecoveryBackoffPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_secs(5),
            max_attempts: 12,
        }
    }
}

impl RecoveryBackoffPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self::Fixed {
            delay,
            max_attempts,
        }
    }

    /// `initial` larger than `max` is swapped.
    pub fn exponential(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        let (initial, max) = if initial > max {
            (max, initial)
        } else {
            (initial, max)
        };
        Self::Exponential {
            initial,
            max,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Fixed { max_attempts, .. } | Self::Exponential { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    /// Delay before attempt number `attempt`, counted from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay, .. } => delay,
            Self::Exponential { initial, max, .. } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial
                    .checked_mul(1u32 << shift)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}
