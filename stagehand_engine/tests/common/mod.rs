//! Common test utilities for stagehand engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use stagehand_core::{
    AutomationError, ClassifierRules, ElementHandle, ElementMatch, LocatorCandidate, MarkerSet,
    NavigationTarget, PageActions, PageProbe, PageStateClassifier, RecoveryTable, Result,
    RetryPolicy, ScreenRule,
};
use stagehand_engine::{RetryHandler, StageError, StageRegistry, WorkflowExecutor};
use stagehand_runtime::{MetricsSink, RunEvent, RuntimeConfig, StageEvent};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runtime config rooted at `dir` with jitter-free, fast retries.
pub fn test_config(dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        state_dir: dir.to_path_buf(),
        default_retry: RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter_ratio(0.0),
        recovery_settle_timeout: Duration::from_millis(200),
        recovery_poll_interval: Duration::from_millis(10),
        ..RuntimeConfig::default()
    }
}

/// Executor over a file store under `dir`.
pub fn test_executor(dir: &Path) -> WorkflowExecutor {
    WorkflowExecutor::new(test_config(dir)).with_retry_handler(RetryHandler::without_jitter())
}

pub fn stage_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Per-stage invocation counters.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stage: &str) {
        self.calls.lock().unwrap().push(stage.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, stage: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|s| *s == stage).count()
    }
}

/// Registers a stage that always succeeds with `{ "stage": name }`.
pub fn ok_stage(registry: &mut StageRegistry, name: &str, log: &CallLog) {
    let log = log.clone();
    let stage = name.to_string();
    registry.register_fn(name, move |_ctx| {
        let log = log.clone();
        let stage = stage.clone();
        async move {
            log.push(&stage);
            Ok(json!({ "stage": stage }))
        }
    });
}

/// Registers a stage that always fails with the error built by `error`.
pub fn failing_stage(
    registry: &mut StageRegistry,
    name: &str,
    log: &CallLog,
    error: fn() -> StageError,
) {
    let log = log.clone();
    let stage = name.to_string();
    registry.register_fn(name, move |_ctx| {
        let log = log.clone();
        let stage = stage.clone();
        async move {
            log.push(&stage);
            Err(error())
        }
    });
}

/// Registers a stage that fails with a network error `failures` times, then succeeds.
pub fn flaky_stage(registry: &mut StageRegistry, name: &str, log: &CallLog, failures: u32) {
    let log = log.clone();
    let stage = name.to_string();
    let seen = Arc::new(AtomicU32::new(0));
    registry.register_fn(name, move |_ctx| {
        let log = log.clone();
        let stage = stage.clone();
        let seen = seen.clone();
        async move {
            log.push(&stage);
            if seen.fetch_add(1, Ordering::SeqCst) < failures {
                Err(StageError::Network("connection reset".into()))
            } else {
                Ok(json!({ "stage": stage }))
            }
        }
    });
}

/// Metrics sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    pub stages: Mutex<Vec<StageEvent>>,
    pub runs: Mutex<Vec<RunEvent>>,
    pub recoveries: Mutex<Vec<String>>,
}

impl MetricsSink for RecordingSink {
    fn record_stage(&self, event: &StageEvent) -> anyhow::Result<()> {
        self.stages.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn record_run(&self, event: &RunEvent) -> anyhow::Result<()> {
        self.runs.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn record_recovery(&self, _run_id: &str, stage_name: &str, action: &str) -> anyhow::Result<()> {
        self.recoveries
            .lock()
            .unwrap()
            .push(format!("{}:{}", stage_name, action));
        Ok(())
    }
}

/// Scripted remote page.
///
/// Markers: `login-form` (auth), `modal` (overlay), `error-banner`
/// (transient error), `<screen>-header` (screen).
#[derive(Default)]
pub struct Page {
    pub visible: Vec<String>,
    /// selector value -> matches
    pub elements: HashMap<String, Vec<ElementMatch>>,
    pub find_calls: Vec<String>,
    pub blocked_elements: HashSet<String>,
    pub action_log: Vec<String>,
}

pub type SharedPage = Arc<Mutex<Page>>;

pub fn page(visible: &[&str]) -> SharedPage {
    Arc::new(Mutex::new(Page {
        visible: visible.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }))
}

pub fn rules() -> ClassifierRules {
    ClassifierRules::new()
        .auth_markers(MarkerSet::any("auth", ["login-form"]))
        .overlay_markers(MarkerSet::any("overlay", ["modal"]))
        .transient_error_markers(MarkerSet::any("transient", ["error-banner"]))
        .screen(ScreenRule::new("home", MarkerSet::any("home", ["home-header"])))
        .screen(ScreenRule::new("search", MarkerSet::any("search", ["search-header"])))
        .screen(ScreenRule::new("checkout", MarkerSet::any("checkout", ["checkout-header"])))
}

/// Executor with the scripted page and recovery attached.
pub fn automated_executor(dir: &Path, page: &SharedPage) -> WorkflowExecutor {
    automated_executor_with(test_config(dir), page)
}

pub fn automated_executor_with(config: RuntimeConfig, page: &SharedPage) -> WorkflowExecutor {
    WorkflowExecutor::new(config)
        .with_retry_handler(RetryHandler::without_jitter())
        .with_automation(
            Arc::new(ScriptedProbe(page.clone())),
            Arc::new(ScriptedActions(page.clone())),
        )
        .with_page_rules(
            Arc::new(PageStateClassifier::new(rules())),
            RecoveryTable::default(),
        )
}

pub struct ScriptedProbe(pub SharedPage);

#[async_trait]
impl PageProbe for ScriptedProbe {
    async fn current_address(&self) -> Result<String> {
        Ok("https://app.example/".to_string())
    }

    async fn matches_markers(&self, _markers: &MarkerSet) -> Result<bool> {
        Ok(false)
    }

    async fn visible_markers(&self) -> Result<Vec<String>> {
        Ok(self.0.lock().unwrap().visible.clone())
    }

    async fn find_matches(
        &self,
        candidate: &LocatorCandidate,
        _timeout: Duration,
    ) -> Result<Vec<ElementMatch>> {
        let mut page = self.0.lock().unwrap();
        page.find_calls.push(candidate.selector_value.clone());
        Ok(page
            .elements
            .get(&candidate.selector_value)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct ScriptedActions(pub SharedPage);

#[async_trait]
impl PageActions for ScriptedActions {
    async fn navigate(&self, target: &NavigationTarget) -> Result<()> {
        let mut page = self.0.lock().unwrap();
        let screen = match target {
            NavigationTarget::EntryPoint => "home".to_string(),
            NavigationTarget::Screen(name) => name.to_string(),
        };
        page.action_log.push(format!("navigate:{}", screen));
        page.visible = vec![format!("{}-header", screen)];
        Ok(())
    }

    async fn dismiss_overlay(&self) -> Result<bool> {
        let mut page = self.0.lock().unwrap();
        page.action_log.push("dismiss".to_string());
        let had_overlay = page.visible.iter().any(|m| m == "modal");
        page.visible.retain(|m| m != "modal");
        Ok(had_overlay)
    }

    async fn interact(&self, handle: &ElementHandle) -> Result<()> {
        let mut page = self.0.lock().unwrap();
        page.action_log.push(format!("interact:{}", handle.element_id));
        if page.blocked_elements.contains(&handle.element_id) {
            return Err(AutomationError::InteractionBlocked(handle.element_id.clone()));
        }
        Ok(())
    }

    async fn force_interact(&self, handle: &ElementHandle) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .action_log
            .push(format!("force:{}", handle.element_id));
        Ok(())
    }
}
