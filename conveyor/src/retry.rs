//! Retry policies for failed queue items.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum jitter added to a computed retry delay.
const JITTER_CAP: Duration = Duration::from_millis(100);

/// How a failed item's next attempt is spaced from the current one.
///
/// Delays are serialized as integer milliseconds, so a policy stored by any
/// process can be read back by any other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Wait the same `delay` before every attempt.
    Constant {
        /// Delay before each retry.
        #[serde(with = "duration_ms")]
        delay: Duration,
        /// Total number of retries allowed after the first attempt.
        tries: u32,
    },
    /// Wait `delay * attempt`, capped at `max`.
    Linear {
        /// Base delay, multiplied by the attempt number.
        #[serde(with = "duration_ms")]
        delay: Duration,
        /// Upper bound on the computed delay.
        #[serde(with = "duration_ms")]
        max: Duration,
        /// Total number of retries allowed after the first attempt.
        tries: u32,
    },
    /// Wait `delay * attempt^2`, capped at `max`.
    Exponential {
        /// Base delay, multiplied by the square of the attempt number.
        #[serde(with = "duration_ms")]
        delay: Duration,
        /// Upper bound on the computed delay.
        #[serde(with = "duration_ms")]
        max: Duration,
        /// Total number of retries allowed after the first attempt.
        tries: u32,
    },
}

impl Default for RetryPolicy {
    /// Exponential backoff starting at ten seconds, capped at fifteen
    /// minutes, with five retries.
    fn default() -> Self {
        RetryPolicy::Exponential {
            delay: Duration::from_secs(10),
            max: Duration::from_secs(15 * 60),
            tries: 5,
        }
    }
}

impl RetryPolicy {
    /// The number of retries this policy permits.
    pub fn tries(&self) -> u32 {
        match self {
            RetryPolicy::Constant { tries, .. }
            | RetryPolicy::Linear { tries, .. }
            | RetryPolicy::Exponential { tries, .. } => *tries,
        }
    }

    /// How long to wait before the given attempt, or `None` once the policy
    /// is exhausted. Attempts are numbered from 1.
    ///
    /// Attempts after the first include a random jitter of up to 100ms so
    /// that items failing together do not all come due in the same poll.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.tries() {
            return None;
        }

        let jitter = |delay: &Duration| {
            if attempt > 0 {
                let cap = (*delay).min(JITTER_CAP);
                Duration::from_millis(rand::thread_rng().gen_range(0..=cap.as_millis() as u64))
            } else {
                Duration::ZERO
            }
        };

        let wait = match self {
            RetryPolicy::Constant { delay, .. } => *delay,
            RetryPolicy::Linear { delay, max, .. } => (*delay * attempt + jitter(delay)).min(*max),
            RetryPolicy::Exponential { delay, max, .. } => {
                (*delay * attempt.saturating_mul(attempt) + jitter(delay)).min(*max)
            }
        };

        Some(wait)
    }

    pub(crate) fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::InvalidRetryPolicy)
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::InvalidRetryPolicy)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
