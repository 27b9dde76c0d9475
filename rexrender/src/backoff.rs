//! Backoff between polls of the job queue.
//!
//! By default a worker waits the same `polling` delay after every poll that did not yield a
//! job. A [`Backoff`] can instead grow the delay the longer the queue stays empty or
//! unreachable, and spread workers out with a random jitter.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use rexrender::prelude::*;
//! # use std::time::Duration;
//! let backoff = Backoff::exponential(Duration::from_secs(2))
//!     .with_max(Duration::from_secs(60))
//!     .with_jitter(Jitter::Absolute(Duration::from_secs(1)));
//!
//! assert!(backoff.delay(1) >= Duration::from_secs(1));
//! assert!(backoff.delay(1) <= Duration::from_secs(3));
//! assert!(backoff.delay(3) >= Duration::from_secs(7));
//! assert!(backoff.delay(3) <= Duration::from_secs(9));
//! // Note the max here is the max plus max jitter
//! assert!(backoff.delay(20) <= Duration::from_secs(61));
//! ```
use std::time::Duration;

use rand::Rng;

/// A random jitter to be applied to a given delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the delay in the range `-delta =< jitter =< delta`.
    Absolute(Duration),
    /// A random jitter to be added as a proportion of the current delay.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: Duration) -> Duration {
        let milliseconds = match self {
            Self::Absolute(delta) => as_millis(*delta),
            Self::Relative(ratio) => (as_millis(value) as f64 * ratio.abs()).round() as i64,
        };
        if milliseconds <= 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        let jittered = as_millis(value).saturating_add(jitter).max(0);
        Duration::from_millis(jittered as u64)
    }
}

fn as_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Growth {
    Constant,
    Exponential,
}

/// The delay to wait before the next poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    growth: Growth,
    max: Option<Duration>,
    jitter: Option<Jitter>,
}

impl Backoff {
    /// Always waits `delay`, no matter how many polls came back empty.
    ///
    /// ```
    /// # use rexrender::prelude::*;
    /// # use std::time::Duration;
    /// let backoff = Backoff::constant(Duration::from_secs(30));
    ///
    /// assert_eq!(backoff.delay(1), Duration::from_secs(30));
    /// assert_eq!(backoff.delay(12), Duration::from_secs(30));
    /// ```
    pub const fn constant(delay: Duration) -> Self {
        Self {
            base: delay,
            growth: Growth::Constant,
            max: None,
            jitter: None,
        }
    }

    /// Doubles the delay with each consecutive poll, starting from `base`. It is advisable to
    /// also set the maximum delay using [`Backoff::with_max`].
    ///
    /// ```
    /// # use rexrender::prelude::*;
    /// # use std::time::Duration;
    /// let backoff = Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(30));
    ///
    /// assert_eq!(backoff.delay(1), Duration::from_secs(2));
    /// assert_eq!(backoff.delay(2), Duration::from_secs(4));
    /// assert_eq!(backoff.delay(3), Duration::from_secs(8));
    /// assert_eq!(backoff.delay(4), Duration::from_secs(16));
    /// assert_eq!(backoff.delay(5), Duration::from_secs(30));
    /// assert_eq!(backoff.delay(6), Duration::from_secs(30));
    /// ```
    pub const fn exponential(base: Duration) -> Self {
        Self {
            base,
            growth: Growth::Exponential,
            max: None,
            jitter: None,
        }
    }

    /// Clamps the maximum value to be returned by [`Backoff::delay`] to `max_delay`, before any
    /// jitter is applied.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.max = Some(max_delay);
        self
    }

    /// Add a jitter to the backoff, see [`Jitter`] for more information about how this
    /// affects the delay.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The delay after the `attempt`th consecutive poll without a job, counting from one.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = match self.growth {
            Growth::Constant => self.base,
            Growth::Exponential => {
                let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor)
            }
        };
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        match self.jitter {
            Some(jitter) => jitter.apply_jitter(delay),
            None => delay,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let backoff = Backoff::exponential(Duration::from_secs(1));

        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn relative_jitter_stays_within_bounds() {
        let backoff = Backoff::constant(Duration::from_millis(1000)).with_jitter(Jitter::Relative(0.1));

        for attempt in 1..100 {
            let delay = backoff.delay(attempt);
            assert!(delay >= Duration::from_millis(900), "{delay:?} below bound");
            assert!(delay <= Duration::from_millis(1100), "{delay:?} above bound");
        }
    }

    #[test]
    fn jitter_never_goes_negative() {
        let backoff =
            Backoff::constant(Duration::from_millis(10)).with_jitter(Jitter::Absolute(Duration::from_secs(5)));

        for attempt in 1..100 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(5010));
        }
    }

    #[test]
    fn oversized_jitter_is_clamped() {
        let backoff = Backoff::constant(Duration::from_millis(10))
            .with_jitter(Jitter::Absolute(Duration::from_millis(u64::MAX)));

        for attempt in 1..20 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(i64::MAX as u64));
        }
    }
}
