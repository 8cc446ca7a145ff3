//! In-memory page model shared by the unit tests of this crate.

use crate::classifier::{ClassifierRules, ScreenRule};
use crate::error::{AutomationError, Result};
use crate::probe::{PageActions, PageProbe};
use crate::types::{ElementHandle, ElementMatch, LocatorCandidate, MarkerSet, NavigationTarget};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) type SharedPage = Arc<Mutex<PageModel>>;

#[derive(Default)]
pub(crate) struct PageModel {
    pub address: String,
    pub visible: Vec<String>,
    /// selector value -> matches
    pub elements: HashMap<String, Vec<ElementMatch>>,
    pub slow_selectors: HashSet<String>,
    pub failing_selectors: HashSet<String>,
    pub find_calls: Vec<String>,
    /// element ids whose normal interaction is intercepted
    pub blocked_elements: HashSet<String>,
    /// element ids whose forced interaction also fails
    pub force_failing_elements: HashSet<String>,
    pub action_log: Vec<String>,
    /// marker set names the probe matches natively
    pub probe_matched_sets: Vec<String>,
    pub probe_unavailable: bool,
    pub auth_supported: bool,
    /// dismiss_overlay reports success but the overlay stays
    pub sticky_overlay: bool,
}

impl PageModel {
    pub fn shared(address: &str, visible: &[&str]) -> SharedPage {
        Arc::new(Mutex::new(PageModel {
            address: address.to_string(),
            visible: visible.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }))
    }
}

pub(crate) fn standard_rules() -> ClassifierRules {
    ClassifierRules::new()
        .auth_markers(MarkerSet::any("auth", ["login-form"]))
        .overlay_markers(MarkerSet::any("overlay", ["modal"]))
        .transient_error_markers(MarkerSet::any("transient", ["error-banner"]))
        .screen(ScreenRule::new("home", MarkerSet::any("home", ["home-header"])))
        .screen(ScreenRule::new("search", MarkerSet::any("search", ["search-header"])))
}

pub(crate) struct FakeProbe {
    page: SharedPage,
}

impl FakeProbe {
    pub fn new(page: SharedPage) -> Self {
        Self { page }
    }

    fn check_available(&self) -> Result<()> {
        if self.page.lock().unwrap().probe_unavailable {
            return Err(AutomationError::Network("probe disconnected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PageProbe for FakeProbe {
    async fn current_address(&self) -> Result<String> {
        self.check_available()?;
        Ok(self.page.lock().unwrap().address.clone())
    }

    async fn matches_markers(&self, markers: &MarkerSet) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .page
            .lock()
            .unwrap()
            .probe_matched_sets
            .contains(&markers.name))
    }

    async fn visible_markers(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.page.lock().unwrap().visible.clone())
    }

    async fn find_matches(
        &self,
        candidate: &LocatorCandidate,
        _timeout: Duration,
    ) -> Result<Vec<ElementMatch>> {
        let (slow, failing, matches) = {
            let mut page = self.page.lock().unwrap();
            page.find_calls.push(candidate.selector_value.clone());
            (
                page.slow_selectors.contains(&candidate.selector_value),
                page.failing_selectors.contains(&candidate.selector_value),
                page.elements
                    .get(&candidate.selector_value)
                    .cloned()
                    .unwrap_or_default(),
            )
        };
        if slow {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if failing {
            return Err(AutomationError::Other(anyhow::anyhow!("driver crashed")));
        }
        Ok(matches)
    }
}

pub(crate) struct FakeActions {
    page: SharedPage,
}

impl FakeActions {
    pub fn new(page: SharedPage) -> Self {
        Self { page }
    }
}

#[async_trait]
impl PageActions for FakeActions {
    async fn navigate(&self, target: &NavigationTarget) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        let screen = match target {
            NavigationTarget::EntryPoint => "home".to_string(),
            NavigationTarget::Screen(name) => name.to_string(),
        };
        page.action_log.push(format!("navigate:{}", screen));
        page.address = format!("/{}", screen);
        page.visible = vec![format!("{}-header", screen)];
        Ok(())
    }

    async fn dismiss_overlay(&self) -> Result<bool> {
        let mut page = self.page.lock().unwrap();
        page.action_log.push("dismiss".to_string());
        let had_overlay = page.visible.iter().any(|m| m == "modal");
        if !page.sticky_overlay {
            page.visible.retain(|m| m != "modal");
        }
        Ok(had_overlay)
    }

    async fn reload(&self) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        page.action_log.push("reload".to_string());
        page.visible.retain(|m| m != "error-banner");
        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        page.action_log.push("authenticate".to_string());
        if !page.auth_supported {
            return Err(AutomationError::Unsupported("authenticate".to_string()));
        }
        page.visible.retain(|m| m != "login-form");
        page.visible.push("home-header".to_string());
        Ok(())
    }

    async fn interact(&self, handle: &ElementHandle) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        page.action_log.push(format!("interact:{}", handle.element_id));
        if page.blocked_elements.contains(&handle.element_id) {
            return Err(AutomationError::InteractionBlocked(format!(
                "{} is covered",
                handle.element_id
            )));
        }
        Ok(())
    }

    async fn force_interact(&self, handle: &ElementHandle) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        page.action_log.push(format!("force:{}", handle.element_id));
        if page.force_failing_elements.contains(&handle.element_id) {
            return Err(AutomationError::InteractionBlocked(format!(
                "{} still covered",
                handle.element_id
            )));
        }
        Ok(())
    }
}
