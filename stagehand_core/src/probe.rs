//! Narrow interfaces onto the remote application.
//!
//! The calling application implements [`PageProbe`] (read-only signals) and
//! [`PageActions`] (corrective and interactive operations) on top of whatever
//! automation driver it uses. The core never talks to a driver directly.

use crate::error::{AutomationError, Result};
use crate::types::{ElementHandle, ElementMatch, LocatorCandidate, MarkerSet, NavigationTarget};
use async_trait::async_trait;
use std::time::Duration;

/// Read-only view of the remote page.
///
/// Implementations must not change remote state from any of these methods.
#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Returns the current address (URL or equivalent).
    async fn current_address(&self) -> Result<String>;

    /// Returns true if the marker set matches the current page.
    async fn matches_markers(&self, markers: &MarkerSet) -> Result<bool>;

    /// Returns the identifiers of markers currently visible.
    async fn visible_markers(&self) -> Result<Vec<String>>;

    /// Finds elements matching a candidate, waiting at most `timeout`.
    ///
    /// An empty vector means the candidate matched nothing.
    async fn find_matches(
        &self,
        candidate: &LocatorCandidate,
        timeout: Duration,
    ) -> Result<Vec<ElementMatch>>;
}

/// Operations that change remote state.
///
/// Corrective actions must be idempotent: dismissing an overlay that is
/// already gone returns `Ok(false)` rather than an error.
#[async_trait]
pub trait PageActions: Send + Sync {
    /// Navigates to the given target.
    async fn navigate(&self, target: &NavigationTarget) -> Result<()>;

    /// Dismisses the topmost overlay. Returns false if there was none.
    async fn dismiss_overlay(&self) -> Result<bool>;

    /// Reloads the current page.
    async fn reload(&self) -> Result<()> {
        Err(AutomationError::Unsupported("reload".to_string()))
    }

    /// Re-establishes an authenticated session.
    async fn authenticate(&self) -> Result<()> {
        Err(AutomationError::Unsupported("authenticate".to_string()))
    }

    /// Performs the normal interaction (click/focus) with an element.
    async fn interact(&self, handle: &ElementHandle) -> Result<()>;

    /// Performs the interaction bypassing non-blocking overlays.
    async fn force_interact(&self, handle: &ElementHandle) -> Result<()>;
}
