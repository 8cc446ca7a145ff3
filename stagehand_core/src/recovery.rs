//! Bounded recovery toward a desired page state.
//!
//! The controller reads the current [`PageState`], looks up a corrective
//! [`RecoveryAction`] in a [`RecoveryTable`], executes it through the
//! injected [`PageActions`], and re-classifies. It gives up after
//! `max_rounds` corrective actions.

use crate::classifier::PageStateClassifier;
use crate::error::AutomationError;
use crate::probe::{PageActions, PageProbe};
use crate::types::{NavigationTarget, PageState, PageStateKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Corrective action taken for a page state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Close the topmost overlay
    DismissOverlay,
    /// Go to the application's landing page
    NavigateToEntryPoint,
    /// Go to the desired screen (entry point if the desired state is not a screen)
    NavigateToDesired,
    /// Reload the current page
    Reload,
    /// Re-establish the session
    Authenticate,
    /// No corrective action exists; stop immediately
    Abandon,
}

/// Mapping from the current state to the action that corrects it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryTable {
    entries: HashMap<PageStateKind, RecoveryAction>,
}

impl Default for RecoveryTable {
    /// - `BlockingOverlay` -> `DismissOverlay`
    /// - `Unknown` -> `NavigateToEntryPoint`
    /// - `TransientError` -> `Reload`
    /// - `AuthRequired` -> `Authenticate`
    /// - `Ready` (wrong screen) -> `NavigateToDesired`
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert(PageStateKind::BlockingOverlay, RecoveryAction::DismissOverlay);
        entries.insert(PageStateKind::Unknown, RecoveryAction::NavigateToEntryPoint);
        entries.insert(PageStateKind::TransientError, RecoveryAction::Reload);
        entries.insert(PageStateKind::AuthRequired, RecoveryAction::Authenticate);
        entries.insert(PageStateKind::Ready, RecoveryAction::NavigateToDesired);
        Self { entries }
    }
}

impl RecoveryTable {
    /// Overrides the action for one state kind.
    pub fn with_action(mut self, kind: PageStateKind, action: RecoveryAction) -> Self {
        self.entries.insert(kind, action);
        self
    }

    /// Returns the action for a state. Unmapped states abandon.
    pub fn action_for(&self, state: &PageState) -> RecoveryAction {
        self.entries
            .get(&state.kind())
            .copied()
            .unwrap_or(RecoveryAction::Abandon)
    }
}

/// Timing knobs for recovery.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryConfig {
    /// Maximum number of corrective actions (default: 3)
    pub max_rounds: u32,
    /// How long to wait for the page to react to an action (default: 5s)
    pub settle_timeout: Duration,
    /// Interval between classifications while settling (default: 100ms)
    pub poll_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            settle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Result of a recovery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Whether the desired state was reached
    pub reached: bool,
    /// Corrective actions in the order they were executed
    pub actions: Vec<RecoveryAction>,
    /// Last classification
    pub final_state: PageState,
}

impl RecoveryReport {
    /// Number of corrective actions executed.
    pub fn rounds(&self) -> usize {
        self.actions.len()
    }
}

/// Drives the remote application back to a desired state.
#[derive(Clone, Debug)]
pub struct RecoveryController {
    classifier: Arc<PageStateClassifier>,
    table: RecoveryTable,
    config: RecoveryConfig,
}

impl RecoveryController {
    /// Creates a controller with the default table and timings.
    pub fn new(classifier: Arc<PageStateClassifier>) -> Self {
        Self {
            classifier,
            table: RecoveryTable::default(),
            config: RecoveryConfig::default(),
        }
    }

    /// Replaces the recovery table.
    pub fn with_table(mut self, table: RecoveryTable) -> Self {
        self.table = table;
        self
    }

    /// Replaces the timing configuration.
    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the classifier used for readings.
    pub fn classifier(&self) -> &PageStateClassifier {
        &self.classifier
    }

    /// Returns the timing configuration.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Returns true once `desired` is reached within `max_rounds` actions.
    pub async fn ensure_state(
        &self,
        probe: &dyn PageProbe,
        actions: &dyn PageActions,
        desired: &PageState,
        max_rounds: u32,
    ) -> bool {
        self.recover(probe, actions, desired, max_rounds).await.reached
    }

    /// Same as [`ensure_state`](Self::ensure_state) with the configured `max_rounds`.
    pub async fn ensure_default(
        &self,
        probe: &dyn PageProbe,
        actions: &dyn PageActions,
        desired: &PageState,
    ) -> bool {
        self.ensure_state(probe, actions, desired, self.config.max_rounds)
            .await
    }

    /// Runs the recovery loop and reports what happened.
    pub async fn recover(
        &self,
        probe: &dyn PageProbe,
        actions: &dyn PageActions,
        desired: &PageState,
        max_rounds: u32,
    ) -> RecoveryReport {
        let mut taken = Vec::new();
        let mut state = self.classifier.classify(probe).await;

        while state != *desired && (taken.len() as u32) < max_rounds {
            let action = self.table.action_for(&state);
            if action == RecoveryAction::Abandon {
                debug!(state = %state, "No corrective action for state");
                break;
            }

            warn!(
                state = %state,
                desired = %desired,
                action = ?action,
                round = taken.len() + 1,
                "Page drifted, applying corrective action"
            );
            taken.push(action);

            if let Err(e) = self.apply(action, actions, desired).await {
                if matches!(e, AutomationError::Unsupported(_)) {
                    warn!(action = ?action, "Corrective action unsupported, giving up");
                    break;
                }
                warn!(action = ?action, error = %e, "Corrective action failed");
            }

            state = self.settle(probe, &state).await;
        }

        let reached = state == *desired;
        if reached && !taken.is_empty() {
            info!(desired = %desired, rounds = taken.len(), "Recovered page state");
        }

        RecoveryReport {
            reached,
            actions: taken,
            final_state: state,
        }
    }

    async fn apply(
        &self,
        action: RecoveryAction,
        actions: &dyn PageActions,
        desired: &PageState,
    ) -> crate::error::Result<()> {
        match action {
            RecoveryAction::DismissOverlay => {
                if !actions.dismiss_overlay().await? {
                    debug!("Overlay already gone");
                }
                Ok(())
            }
            RecoveryAction::NavigateToEntryPoint => {
                actions.navigate(&NavigationTarget::EntryPoint).await
            }
            RecoveryAction::NavigateToDesired => {
                let target = match desired {
                    PageState::Ready(screen) => NavigationTarget::Screen(screen.clone()),
                    _ => NavigationTarget::EntryPoint,
                };
                actions.navigate(&target).await
            }
            RecoveryAction::Reload => actions.reload().await,
            RecoveryAction::Authenticate => actions.authenticate().await,
            RecoveryAction::Abandon => Ok(()),
        }
    }

    /// Polls until the reading differs from `previous` or the settle window closes.
    async fn settle(&self, probe: &dyn PageProbe, previous: &PageState) -> PageState {
        let deadline = Instant::now() + self.config.settle_timeout;
        loop {
            let state = self.classifier.classify(probe).await;
            if state != *previous || Instant::now() >= deadline {
                return state;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
