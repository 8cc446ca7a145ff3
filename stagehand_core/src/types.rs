//! Core types shared across Stagehand.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Serde adapter storing a [`Duration`] as integer milliseconds.
///
/// Use with `#[serde(with = "stagehand_core::types::duration_ms")]`.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Name of a screen of the remote application (e.g. "search", "order-form").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScreenName(String);

impl ScreenName {
    /// Creates a new screen name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScreenName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScreenName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ScreenName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Classified reading of the remote application's current condition.
///
/// Computed on demand from live signals; never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageState {
    /// Nothing recognisable is on screen
    Unknown,
    /// Login or session-expired screen is showing
    AuthRequired,
    /// A known screen is showing and nothing covers it
    Ready(ScreenName),
    /// A dialog, modal or banner covers the page
    BlockingOverlay,
    /// The remote application reports a temporary error
    TransientError,
}

impl PageState {
    /// Shorthand for `PageState::Ready(ScreenName::new(name))`.
    pub fn ready(name: impl Into<String>) -> Self {
        PageState::Ready(ScreenName::new(name))
    }

    /// Returns the state discriminant, dropping the screen name.
    pub fn kind(&self) -> PageStateKind {
        match self {
            PageState::Unknown => PageStateKind::Unknown,
            PageState::AuthRequired => PageStateKind::AuthRequired,
            PageState::Ready(_) => PageStateKind::Ready,
            PageState::BlockingOverlay => PageStateKind::BlockingOverlay,
            PageState::TransientError => PageStateKind::TransientError,
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageState::Unknown => write!(f, "unknown"),
            PageState::AuthRequired => write!(f, "auth-required"),
            PageState::Ready(screen) => write!(f, "ready({})", screen),
            PageState::BlockingOverlay => write!(f, "blocking-overlay"),
            PageState::TransientError => write!(f, "transient-error"),
        }
    }
}

/// [`PageState`] without its payload, used as a recovery table key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageStateKind {
    Unknown,
    AuthRequired,
    Ready,
    BlockingOverlay,
    TransientError,
}

/// Named group of marker identifiers checked together.
///
/// Markers are opaque to the core: the probe decides what a marker means
/// (a dialog id, a heading text, a CSS class).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSet {
    /// Name used in logs and probe lookups
    pub name: String,
    /// Marker identifiers
    pub markers: Vec<String>,
    /// Require every marker instead of any one
    #[serde(default)]
    pub require_all: bool,
}

impl MarkerSet {
    /// Creates a set that matches when any marker is visible.
    pub fn any<I, S>(name: impl Into<String>, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            markers: markers.into_iter().map(Into::into).collect(),
            require_all: false,
        }
    }

    /// Creates a set that matches only when all markers are visible.
    pub fn all<I, S>(name: impl Into<String>, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            require_all: true,
            ..Self::any(name, markers)
        }
    }

    /// Returns true if the set has no markers.
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Evaluates the set against a list of currently visible markers.
    pub fn matches(&self, visible: &[String]) -> bool {
        if self.markers.is_empty() {
            return false;
        }
        let mut hits = self.markers.iter().map(|m| visible.contains(m));
        if self.require_all {
            hits.all(|hit| hit)
        } else {
            hits.any(|hit| hit)
        }
    }
}

/// Strategy used by a locator candidate.
///
/// The core only tries strategies in order; the probe interprets them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    /// Accessible name / aria-label
    AccessibleLabel,
    /// Visible text content
    VisibleText,
    /// Accessibility role plus name
    Role,
    /// Dedicated test attribute
    TestId,
    /// CSS selector
    Css,
    /// Structural path through the document tree
    StructuralPath,
    /// Driver-specific strategy
    Custom(String),
}

impl fmt::Display for LocatorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocatorStrategy::AccessibleLabel => write!(f, "accessible-label"),
            LocatorStrategy::VisibleText => write!(f, "visible-text"),
            LocatorStrategy::Role => write!(f, "role"),
            LocatorStrategy::TestId => write!(f, "test-id"),
            LocatorStrategy::Css => write!(f, "css"),
            LocatorStrategy::StructuralPath => write!(f, "structural-path"),
            LocatorStrategy::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// One way of finding a UI target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorCandidate {
    pub strategy: LocatorStrategy,
    pub selector_value: String,
    /// Zero means "use the resolver's default"
    #[serde(with = "duration_ms", rename = "timeout_ms", default)]
    pub per_candidate_timeout: Duration,
}

impl LocatorCandidate {
    /// Creates a new candidate.
    pub fn new(
        strategy: LocatorStrategy,
        selector_value: impl Into<String>,
        per_candidate_timeout: Duration,
    ) -> Self {
        Self {
            strategy,
            selector_value: selector_value.into(),
            per_candidate_timeout,
        }
    }
}

/// Ordered list of candidates for one logical UI target.
///
/// Candidates are tried in list order. When several elements match one
/// candidate the first usable one is taken; callers that need to
/// disambiguate put a more specific candidate earlier in the list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorSpec {
    /// Logical name of the target (for diagnostics)
    pub target: String,
    pub candidates: Vec<LocatorCandidate>,
}

impl LocatorSpec {
    /// Creates an empty spec for the named target.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            candidates: Vec::new(),
        }
    }

    /// Appends a candidate (builder pattern).
    pub fn candidate(
        mut self,
        strategy: LocatorStrategy,
        selector_value: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.candidates
            .push(LocatorCandidate::new(strategy, selector_value, timeout));
        self
    }
}

/// A single element reported by the probe for a candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMatch {
    /// Driver-opaque element reference
    pub element_id: String,
    pub visible: bool,
    pub interactable: bool,
}

impl ElementMatch {
    /// A visible, interactable match.
    pub fn usable(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
            visible: true,
            interactable: true,
        }
    }

    /// Returns true if the element can be interacted with.
    pub fn is_usable(&self) -> bool {
        self.visible && self.interactable
    }
}

/// Resolved element, tagged with the candidate that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub element_id: String,
    pub target: String,
    pub strategy: LocatorStrategy,
    pub selector_value: String,
    /// Position of the producing candidate in the spec
    pub candidate_index: usize,
}

/// Where a navigation action should go.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationTarget {
    /// The application's known-good landing page
    EntryPoint,
    /// A specific screen
    Screen(ScreenName),
}

/// Invalid retry policy values.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("backoff_multiplier must be >= 1.0, got {0}")]
    MultiplierTooSmall(f64),

    #[error("jitter_ratio must be within 0..=1, got {0}")]
    JitterOutOfRange(f64),

    #[error("base_delay {base:?} exceeds max_delay {max:?}")]
    BaseExceedsMax { base: Duration, max: Duration },
}

/// Numeric configuration governing attempt count and backoff shape.
///
/// Attempts are 1-indexed; `max_attempts == 1` disables retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the jitter ratio.
    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    /// Checks the policy's numeric constraints.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(PolicyError::MultiplierTooSmall(self.backoff_multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(PolicyError::JitterOutOfRange(self.jitter_ratio));
        }
        if self.base_delay > self.max_delay {
            return Err(PolicyError::BaseExceedsMax {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }

    /// Delay before the attempt following attempt number `attempt`, before jitter.
    ///
    /// `base_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Nominal delay perturbed by `unit * jitter_ratio`, where `unit` is in `[-1, 1]`.
    ///
    /// The result never goes below zero or above `max_delay`.
    pub fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let secs = nominal * (1.0 + ratio * unit.clamp(-1.0, 1.0));
        let secs = secs.clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}
