//! Page-state classification from cheap page signals.
//!
//! The classifier evaluates a fixed priority order:
//!
//! 1. authentication markers -> [`PageState::AuthRequired`]
//! 2. blocking-overlay markers -> [`PageState::BlockingOverlay`]
//! 3. transient-error markers -> [`PageState::TransientError`]
//! 4. per-screen ready rules, in declaration order -> [`PageState::Ready`]
//! 5. otherwise [`PageState::Unknown`]
//!
//! Overlays are checked before screens because an overlay can sit on top of
//! a screen whose own markers are still visible underneath it.

use crate::error::Result;
use crate::probe::PageProbe;
use crate::types::{MarkerSet, PageState, ScreenName};
use regex::Regex;
use tracing::{debug, warn};

/// Rule declaring when a screen counts as ready.
///
/// A rule matches when its address pattern (if any) matches the current
/// address and its marker set (if non-empty) matches the page. A rule with
/// neither never matches.
#[derive(Clone, Debug)]
pub struct ScreenRule {
    pub screen: ScreenName,
    pub markers: MarkerSet,
    pub address: Option<Regex>,
}

impl ScreenRule {
    /// Creates a rule matched by markers only.
    pub fn new(screen: impl Into<ScreenName>, markers: MarkerSet) -> Self {
        Self {
            screen: screen.into(),
            markers,
            address: None,
        }
    }

    /// Restricts the rule to addresses matching `pattern`.
    pub fn with_address_pattern(mut self, pattern: &str) -> std::result::Result<Self, regex::Error> {
        self.address = Some(Regex::new(pattern)?);
        Ok(self)
    }
}

/// Marker sets and screen rules used by [`PageStateClassifier`].
#[derive(Clone, Debug, Default)]
pub struct ClassifierRules {
    pub auth: MarkerSet,
    pub overlay: MarkerSet,
    pub transient_error: MarkerSet,
    pub screens: Vec<ScreenRule>,
}

impl ClassifierRules {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the authentication markers.
    pub fn auth_markers(mut self, markers: MarkerSet) -> Self {
        self.auth = markers;
        self
    }

    /// Sets the blocking-overlay markers.
    pub fn overlay_markers(mut self, markers: MarkerSet) -> Self {
        self.overlay = markers;
        self
    }

    /// Sets the transient-error markers.
    pub fn transient_error_markers(mut self, markers: MarkerSet) -> Self {
        self.transient_error = markers;
        self
    }

    /// Appends a screen rule. Earlier rules win.
    pub fn screen(mut self, rule: ScreenRule) -> Self {
        self.screens.push(rule);
        self
    }
}

/// Maps live page signals onto a [`PageState`].
///
/// Classification is side-effect free: it only calls read-only probe methods.
#[derive(Clone, Debug)]
pub struct PageStateClassifier {
    rules: ClassifierRules,
}

impl PageStateClassifier {
    /// Creates a classifier from a rule set.
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    /// Returns the rule set.
    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Classifies the current page.
    ///
    /// A probe failure while reading signals is itself a reading: the page
    /// is reported as [`PageState::TransientError`].
    pub async fn classify(&self, probe: &dyn PageProbe) -> PageState {
        match self.try_classify(probe).await {
            Ok(state) => {
                debug!(state = %state, "Classified page state");
                state
            }
            Err(e) => {
                warn!(error = %e, "Probe failed during classification");
                PageState::TransientError
            }
        }
    }

    async fn try_classify(&self, probe: &dyn PageProbe) -> Result<PageState> {
        let visible = probe.visible_markers().await?;

        if marker_hit(probe, &self.rules.auth, &visible).await? {
            return Ok(PageState::AuthRequired);
        }
        if marker_hit(probe, &self.rules.overlay, &visible).await? {
            return Ok(PageState::BlockingOverlay);
        }
        if marker_hit(probe, &self.rules.transient_error, &visible).await? {
            return Ok(PageState::TransientError);
        }

        if self.rules.screens.is_empty() {
            return Ok(PageState::Unknown);
        }

        let address = probe.current_address().await?;
        for rule in &self.rules.screens {
            if rule.address.is_none() && rule.markers.is_empty() {
                continue;
            }
            if let Some(pattern) = &rule.address {
                if !pattern.is_match(&address) {
                    continue;
                }
            }
            if !rule.markers.is_empty() && !marker_hit(probe, &rule.markers, &visible).await? {
                continue;
            }
            return Ok(PageState::Ready(rule.screen.clone()));
        }

        Ok(PageState::Unknown)
    }
}

/// Visible-marker list first, then the probe's own matcher.
async fn marker_hit(probe: &dyn PageProbe, set: &MarkerSet, visible: &[String]) -> Result<bool> {
    if set.is_empty() {
        return Ok(false);
    }
    if set.matches(visible) {
        return Ok(true);
    }
    probe.matches_markers(set).await
}
