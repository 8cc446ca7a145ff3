//! Ordered-fallback element resolution.
//!
//! A [`LocatorSpec`] lists candidates for one logical target. The resolver
//! tries them strictly in order, each bounded by its own timeout, and stops
//! at the first candidate that yields a usable element.

use crate::probe::{PageActions, PageProbe};
use crate::types::{ElementHandle, LocatorCandidate, LocatorSpec, LocatorStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened when one candidate was tried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// The probe returned no elements
    NoMatches,
    /// The candidate's timeout elapsed
    TimedOut,
    /// The probe itself failed
    ProbeFailed(String),
    /// Elements matched but none was visible and interactable
    NotUsable { matches: usize },
    /// Normal and forced interaction both failed
    InteractionFailed(String),
    /// This candidate produced the handle
    Resolved,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::NoMatches => write!(f, "no matches"),
            AttemptOutcome::TimedOut => write!(f, "timed out"),
            AttemptOutcome::ProbeFailed(e) => write!(f, "probe failed: {}", e),
            AttemptOutcome::NotUsable { matches } => {
                write!(f, "{} match(es), none usable", matches)
            }
            AttemptOutcome::InteractionFailed(e) => write!(f, "interaction failed: {}", e),
            AttemptOutcome::Resolved => write!(f, "resolved"),
        }
    }
}

/// Diagnostic record for one tried candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAttempt {
    pub strategy: LocatorStrategy,
    pub selector_value: String,
    pub outcome: AttemptOutcome,
}

/// Every candidate was exhausted without a usable element.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("No candidate resolved target '{target}' ({} tried)", .attempts.len())]
pub struct LocatorNotFound {
    pub target: String,
    /// Tried candidates, in order
    pub attempts: Vec<CandidateAttempt>,
}

impl LocatorNotFound {
    /// Strategies tried, in order.
    pub fn strategies(&self) -> Vec<LocatorStrategy> {
        self.attempts.iter().map(|a| a.strategy.clone()).collect()
    }
}

/// Successful [`LocatorResolver::resolve_and_interact`] result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interaction {
    pub handle: ElementHandle,
    /// The normal interaction failed and the forced one succeeded
    pub forced: bool,
    /// Candidates tried before and including the successful one
    pub attempts: Vec<CandidateAttempt>,
}

/// Resolves a [`LocatorSpec`] against a probe.
#[derive(Clone, Debug)]
pub struct LocatorResolver {
    default_timeout: Duration,
}

impl Default for LocatorResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CANDIDATE_TIMEOUT)
    }
}

impl LocatorResolver {
    /// Creates a resolver. `default_timeout` applies to candidates without their own.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Returns the default per-candidate timeout.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn effective_timeout(&self, candidate: &LocatorCandidate) -> Duration {
        if candidate.per_candidate_timeout.is_zero() {
            self.default_timeout
        } else {
            candidate.per_candidate_timeout
        }
    }

    /// Returns the first usable element produced by the candidates, in order.
    ///
    /// Later candidates are not queried once one resolves.
    #[instrument(level = "debug", skip(self, spec, probe), fields(target = %spec.target))]
    pub async fn resolve(
        &self,
        spec: &LocatorSpec,
        probe: &dyn PageProbe,
    ) -> Result<ElementHandle, LocatorNotFound> {
        let mut attempts = Vec::with_capacity(spec.candidates.len());

        for (index, candidate) in spec.candidates.iter().enumerate() {
            match self.try_candidate(spec, index, candidate, probe).await {
                Ok(handle) => return Ok(handle),
                Err(outcome) => attempts.push(record(candidate, outcome)),
            }
        }

        Err(self.not_found(spec, attempts))
    }

    /// Resolves and interacts with the target.
    ///
    /// If the normal interaction fails, one forced interaction is tried on
    /// the same element. If that also fails, resolution continues with the
    /// next candidate.
    #[instrument(level = "debug", skip(self, spec, probe, actions), fields(target = %spec.target))]
    pub async fn resolve_and_interact(
        &self,
        spec: &LocatorSpec,
        probe: &dyn PageProbe,
        actions: &dyn PageActions,
    ) -> Result<Interaction, LocatorNotFound> {
        let mut attempts = Vec::with_capacity(spec.candidates.len());

        for (index, candidate) in spec.candidates.iter().enumerate() {
            let handle = match self.try_candidate(spec, index, candidate, probe).await {
                Ok(handle) => handle,
                Err(outcome) => {
                    attempts.push(record(candidate, outcome));
                    continue;
                }
            };

            let forced = match actions.interact(&handle).await {
                Ok(()) => false,
                Err(first) => {
                    debug!(
                        element = %handle.element_id,
                        error = %first,
                        "Interaction failed, forcing"
                    );
                    match actions.force_interact(&handle).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(
                                element = %handle.element_id,
                                strategy = %candidate.strategy,
                                error = %e,
                                "Forced interaction failed, trying next candidate"
                            );
                            attempts.push(record(
                                candidate,
                                AttemptOutcome::InteractionFailed(e.to_string()),
                            ));
                            continue;
                        }
                    }
                }
            };

            attempts.push(record(candidate, AttemptOutcome::Resolved));
            return Ok(Interaction {
                handle,
                forced,
                attempts,
            });
        }

        Err(self.not_found(spec, attempts))
    }

    async fn try_candidate(
        &self,
        spec: &LocatorSpec,
        index: usize,
        candidate: &LocatorCandidate,
        probe: &dyn PageProbe,
    ) -> Result<ElementHandle, AttemptOutcome> {
        let timeout = self.effective_timeout(candidate);
        let found = tokio::time::timeout(timeout, probe.find_matches(candidate, timeout)).await;

        let matches = match found {
            Err(_) => {
                debug!(strategy = %candidate.strategy, ?timeout, "Candidate timed out");
                return Err(AttemptOutcome::TimedOut);
            }
            Ok(Err(e)) => {
                debug!(strategy = %candidate.strategy, error = %e, "Probe failed for candidate");
                return Err(AttemptOutcome::ProbeFailed(e.to_string()));
            }
            Ok(Ok(matches)) => matches,
        };

        if matches.is_empty() {
            return Err(AttemptOutcome::NoMatches);
        }

        match matches.iter().find(|m| m.is_usable()) {
            Some(element) => {
                if matches.len() > 1 {
                    debug!(
                        strategy = %candidate.strategy,
                        count = matches.len(),
                        "Multiple matches, taking first usable"
                    );
                }
                Ok(ElementHandle {
                    element_id: element.element_id.clone(),
                    target: spec.target.clone(),
                    strategy: candidate.strategy.clone(),
                    selector_value: candidate.selector_value.clone(),
                    candidate_index: index,
                })
            }
            None => Err(AttemptOutcome::NotUsable {
                matches: matches.len(),
            }),
        }
    }

    fn not_found(&self, spec: &LocatorSpec, attempts: Vec<CandidateAttempt>) -> LocatorNotFound {
        warn!(
            target = %spec.target,
            tried = attempts.len(),
            "All locator candidates exhausted"
        );
        LocatorNotFound {
            target: spec.target.clone(),
            attempts,
        }
    }
}

fn record(candidate: &LocatorCandidate, outcome: AttemptOutcome) -> CandidateAttempt {
    CandidateAttempt {
        strategy: candidate.strategy.clone(),
        selector_value: candidate.selector_value.clone(),
        outcome,
    }
}
