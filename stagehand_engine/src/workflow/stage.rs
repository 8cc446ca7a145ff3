//! Stage abstraction, execution context and registry.
//!
//! A stage is one unit of business logic. It receives a [`StageContext`]
//! (prior outputs, the automation capability, cancellation) and returns an
//! opaque JSON detail on success or a [`StageError`].

use crate::workflow::cancellation::CancellationToken;
use crate::workflow::failure::{DefaultClassifier, FailureClassifier, StageError};
use crate::workflow::timeout::StageTimeout;
use async_trait::async_trait;
use serde_json::Value;
use stagehand_core::{
    ElementHandle, Interaction, LocatorResolver, LocatorSpec, PageActions, PageProbe, PageState,
    RecoveryController, RetryPolicy,
};
use stagehand_runtime::RuntimeConfig;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Everything a stage attempt can see.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub workflow_name: String,
    pub stage_name: String,
    /// 1-indexed attempt number
    pub attempt: u32,
    prior_outputs: Arc<BTreeMap<String, Value>>,
    probe: Option<Arc<dyn PageProbe>>,
    actions: Option<Arc<dyn PageActions>>,
    recovery: Option<Arc<RecoveryController>>,
    locator: LocatorResolver,
    cancellation: CancellationToken,
}

impl StageContext {
    /// Creates a context with no automation capability attached.
    pub fn new(
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        stage_name: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            stage_name: stage_name.into(),
            attempt: 1,
            prior_outputs: Arc::new(BTreeMap::new()),
            probe: None,
            actions: None,
            recovery: None,
            locator: LocatorResolver::default(),
            cancellation: CancellationToken::never(),
        }
    }

    pub fn with_prior_outputs(mut self, outputs: Arc<BTreeMap<String, Value>>) -> Self {
        self.prior_outputs = outputs;
        self
    }

    pub fn with_automation(
        mut self,
        probe: Arc<dyn PageProbe>,
        actions: Arc<dyn PageActions>,
    ) -> Self {
        self.probe = Some(probe);
        self.actions = Some(actions);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryController>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_locator(mut self, locator: LocatorResolver) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = attempt;
        ctx
    }

    /// Detail recorded by an earlier successful stage.
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.prior_outputs.get(stage)
    }

    /// All earlier outputs, keyed by stage name.
    pub fn prior_outputs(&self) -> &BTreeMap<String, Value> {
        &self.prior_outputs
    }

    /// Cancellation token of the run.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Read-only probe, or an error if none is attached.
    pub fn probe(&self) -> Result<&dyn PageProbe, StageError> {
        self.probe
            .as_deref()
            .ok_or_else(|| StageError::Other(anyhow::anyhow!("no page probe attached")))
    }

    /// Page actions, or an error if none are attached.
    pub fn actions(&self) -> Result<&dyn PageActions, StageError> {
        self.actions
            .as_deref()
            .ok_or_else(|| StageError::Other(anyhow::anyhow!("no page actions attached")))
    }

    /// Resolves a locator. Exhaustion becomes [`StageError::ElementNotFound`].
    pub async fn resolve(&self, spec: &LocatorSpec) -> Result<ElementHandle, StageError> {
        Ok(self.locator.resolve(spec, self.probe()?).await?)
    }

    /// Resolves a locator and interacts with it.
    pub async fn interact(&self, spec: &LocatorSpec) -> Result<Interaction, StageError> {
        Ok(self
            .locator
            .resolve_and_interact(spec, self.probe()?, self.actions()?)
            .await?)
    }

    /// Drives the page to `desired`, failing with [`StageError::RecoveryExhausted`].
    pub async fn ensure_state(&self, desired: &PageState) -> Result<(), StageError> {
        let recovery = self
            .recovery
            .as_ref()
            .ok_or_else(|| StageError::Other(anyhow::anyhow!("no recovery controller attached")))?;
        let report = recovery
            .recover(
                self.probe()?,
                self.actions()?,
                desired,
                recovery.config().max_rounds,
            )
            .await;
        if report.reached {
            Ok(())
        } else {
            Err(StageError::RecoveryExhausted(format!(
                "wanted {}, still {} after {} round(s)",
                desired,
                report.final_state,
                report.rounds()
            )))
        }
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("stage_name", &self.stage_name)
            .field("attempt", &self.attempt)
            .field("prior_outputs", &self.prior_outputs.len())
            .field("automation", &self.probe.is_some())
            .finish()
    }
}

/// One unit of work in a workflow.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Runs one attempt. The returned value is stored as the outcome's detail.
    async fn run(&self, context: &StageContext) -> Result<Value, StageError>;
}

type StageFn =
    dyn Fn(StageContext) -> Pin<Box<dyn Future<Output = Result<Value, StageError>> + Send>>
        + Send
        + Sync;

/// Stage backed by an async closure.
///
/// # Example
///
/// ```ignore
/// use stagehand_engine::workflow::FnStage;
///
/// let stage = FnStage::new(|ctx| async move {
///     Ok(serde_json::json!({ "attempt": ctx.attempt }))
/// });
/// ```
pub struct FnStage {
    f: Box<StageFn>,
}

impl FnStage {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StageError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| {
                Box::pin(f(ctx))
                    as Pin<Box<dyn Future<Output = Result<Value, StageError>> + Send>>
            }),
        }
    }
}

#[async_trait]
impl Stage for FnStage {
    async fn run(&self, context: &StageContext) -> Result<Value, StageError> {
        (self.f)(context.clone()).await
    }
}

/// Per-stage execution settings.
#[derive(Clone)]
pub struct StageSettings {
    pub retry_policy: RetryPolicy,
    /// Limit for each attempt
    pub timeout: StageTimeout,
    pub classifier: Arc<dyn FailureClassifier>,
    /// Page state recovery drives toward between attempts
    pub desired_state: Option<PageState>,
}

impl StageSettings {
    /// Settings taken from the runtime defaults.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            retry_policy: config.default_retry.clone(),
            timeout: StageTimeout::new(config.default_stage_timeout),
            classifier: Arc::new(DefaultClassifier),
            desired_state: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<StageTimeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_desired_state(mut self, state: PageState) -> Self {
        self.desired_state = Some(state);
        self
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl fmt::Debug for StageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSettings")
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("desired_state", &self.desired_state)
            .finish()
    }
}

/// Lookup from stage name to implementation and optional settings.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
    settings: HashMap<String, StageSettings>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage implementation under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, stage: impl Stage + 'static) -> &mut Self {
        self.stages.insert(name.into(), Arc::new(stage));
        self
    }

    /// Registers an async closure as a stage.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StageError>> + Send + 'static,
    {
        self.register(name, FnStage::new(f))
    }

    /// Overrides the settings for one stage.
    pub fn configure(&mut self, name: impl Into<String>, settings: StageSettings) -> &mut Self {
        self.settings.insert(name.into(), settings);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Settings registered for `name`, if any.
    pub fn settings(&self, name: &str) -> Option<&StageSettings> {
        self.settings.get(name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
