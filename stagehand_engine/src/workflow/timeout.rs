//! Per-attempt stage timeouts.
//!
//! Every stage attempt runs under its own limit, independent of retry
//! backoff. An attempt that exceeds it fails with a retryable
//! [`StageError::Timeout`](super::StageError::Timeout).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Time limit for one stage attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageTimeout(#[serde(with = "stagehand_core::types::duration_ms")] Duration);

impl StageTimeout {
    /// Creates a new StageTimeout with the specified duration.
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Creates a StageTimeout from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Creates a StageTimeout from milliseconds.
    ///
    /// # Example
    ///
    /// ```
    /// use stagehand_engine::workflow::timeout::StageTimeout;
    ///
    /// let timeout = StageTimeout::from_millis(5000);
    /// assert_eq!(timeout.duration().as_secs(), 5);
    /// ```
    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Returns the timeout duration.
    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl Default for StageTimeout {
    /// Default timeout is 30 seconds.
    fn default() -> Self {
        Self(Duration::from_secs(30))
    }
}

impl From<Duration> for StageTimeout {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl fmt::Display for StageTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}
