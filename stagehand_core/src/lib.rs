//! Stagehand core - page-state intelligence for UI automation
//!
//! This crate holds the pieces that reason about a remote application's
//! screen without owning the automation driver:
//!
//! - **Classifier**: maps cheap page signals onto a [`PageState`]
//! - **Recovery**: bounded corrective actions toward a desired state
//! - **Locator**: ordered-fallback element resolution
//!
//! The driver is reached only through the [`PageProbe`] and
//! [`PageActions`] traits, which the calling application implements.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stagehand_core::{
//!     ClassifierRules, MarkerSet, PageActions, PageProbe, PageState,
//!     PageStateClassifier, RecoveryController, ScreenRule,
//! };
//!
//! async fn ensure_search(probe: &dyn PageProbe, actions: &dyn PageActions) -> bool {
//!     let rules = ClassifierRules::new()
//!         .overlay_markers(MarkerSet::any("overlay", ["cookie-banner"]))
//!         .screen(ScreenRule::new("search", MarkerSet::any("search", ["search-box"])));
//!     let controller = RecoveryController::new(Arc::new(PageStateClassifier::new(rules)));
//!
//!     controller
//!         .ensure_state(probe, actions, &PageState::ready("search"), 3)
//!         .await
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Shared value types (page states, locators, retry policy)
//! - [`error`]: Errors raised by the automation capability
//! - [`probe`]: Capability traits implemented by the caller
//! - [`classifier`]: Page-state classification
//! - [`recovery`]: Recovery controller
//! - [`locator`]: Locator resolver

pub mod error;
pub mod types;

pub mod probe;
pub mod classifier;
pub mod recovery;
pub mod locator;

#[cfg(test)]
mod test_support;

pub use error::{AutomationError, ErrorKind, Result};
pub use types::{
    ElementHandle, ElementMatch, LocatorCandidate, LocatorSpec, LocatorStrategy, MarkerSet,
    NavigationTarget, PageState, PageStateKind, PolicyError, RetryPolicy, ScreenName,
};
pub use probe::{PageActions, PageProbe};
pub use classifier::{ClassifierRules, PageStateClassifier, ScreenRule};
pub use recovery::{
    RecoveryAction, RecoveryConfig, RecoveryController, RecoveryReport, RecoveryTable,
};
pub use locator::{
    AttemptOutcome, CandidateAttempt, Interaction, LocatorNotFound, LocatorResolver,
};
