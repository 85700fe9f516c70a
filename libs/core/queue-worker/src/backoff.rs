//! Backoff between failed polls.
//!
//! The retriever never gives up on an operational error, it simply polls
//! again. `Backoff` makes the pause before that next poll explicit:
//!
//! ```text
//! None         0, 0, 0, ...
//! Constant(d)  d, d, d, ...
//! Exponential  base, 2*base, 4*base, ... capped at max
//! ```

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay policy applied after consecutive receive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Poll again immediately.
    #[default]
    None,
    /// Wait the same amount after every failure.
    Constant(Duration),
    /// Double the delay with every consecutive failure, up to `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Create an exponential backoff.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// Delay before the next poll after `consecutive_errors` failures in a row.
    ///
    /// `consecutive_errors` starts at 1 for the first failure.
    pub fn delay(&self, consecutive_errors: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Constant(delay) => delay,
            Backoff::Exponential { base, max } => {
                let exponent = consecutive_errors.saturating_sub(1).min(31);
                base.saturating_mul(2u32.saturating_pow(exponent)).min(max)
            }
        }
    }

    /// Sleep for the delay, returning early if `cancel` fires.
    ///
    /// Returns `false` when cancelled.
    pub async fn wait(&self, consecutive_errors: u32, cancel: &CancellationToken) -> bool {
        let delay = self.delay(consecutive_errors);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
