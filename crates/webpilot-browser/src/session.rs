//! Session governor: tab hygiene and lifecycle limits.
//!
//! The browser session is a shared, stateful, single-writer resource, and a
//! model-driven agent cannot be trusted to manage its own tabs. The governor
//! sits between the loop and the gateway and enforces, on every call: idle-tab
//! closure, a page-count ceiling (refused up front and evicted after the
//! fact), and a forced session restart after a configured number of page
//! creations.
//!
//! Tab indices are renumbered by the browser whenever a tab closes, so they
//! are never cached across an invoke: every decision re-lists the live tabs
//! first, and sweeps close at most one tab before re-listing.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    GatewayError, ToolBackend, ToolResult, ToolSchema, NAVIGATE_TOOL, TAB_CLOSE_TOOL,
    TAB_LIST_TOOL, TAB_NEW_TOOL,
};

/// Pause between consecutive tab closures so each close settles before the
/// next listing.
const CLOSE_SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Maximum simultaneously open tabs. 0 = unlimited.
    pub max_pages: usize,
    /// Restart the whole session after this many page creations. 0 = never.
    pub restart_after_pages: usize,
    /// Close inactive tabs idle longer than this. Zero duration = disabled.
    pub idle_tab_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_pages: 0,
            restart_after_pages: 0,
            idle_tab_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TabRecord {
    pub index: usize,
    pub active: bool,
    pub title: String,
    pub url: String,
    /// Maintained by the governor, not the browser.
    pub last_activity: Instant,
}

pub struct SessionGovernor<B: ToolBackend> {
    backend: B,
    limits: SessionLimits,
    blocked_tools: Vec<String>,
    /// Last-activity stamps keyed by tab URL; indices are too unstable to key on.
    activity: Mutex<HashMap<String, Instant>>,
    pages_created: AtomicUsize,
}

impl<B: ToolBackend> SessionGovernor<B> {
    pub fn new(backend: B, limits: SessionLimits, blocked_tools: Vec<String>) -> Self {
        Self {
            backend,
            limits,
            blocked_tools,
            activity: Mutex::new(HashMap::new()),
            pages_created: AtomicUsize::new(0),
        }
    }

    /// The wrapped backend, for callers that need raw transport access.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.backend.connect().await
    }

    pub async fn close(&self) -> Result<(), GatewayError> {
        self.backend.close().await
    }

    /// Tool schemas exposed to the model, with unsafe tools filtered out.
    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>, GatewayError> {
        let tools = self.backend.list_tools().await?;
        Ok(tools
            .into_iter()
            .filter(|tool| !self.blocked_tools.iter().any(|b| b == &tool.name))
            .collect())
    }

    /// Current tabs, in listing order, with governor-maintained activity
    /// stamps. Stamps for tabs that no longer exist are discarded.
    pub async fn tabs(&self) -> Result<Vec<TabRecord>, GatewayError> {
        let listing = self.backend.invoke(TAB_LIST_TOOL, &json!({})).await?;
        let text = listing.text_content();
        let now = Instant::now();

        let mut activity = self.activity.lock().unwrap();
        let mut records = Vec::new();
        for line in text.lines() {
            let Some((index, active, title, url)) = parse_tab_line(line) else {
                continue;
            };
            let last_activity = *activity.entry(url.clone()).or_insert(now);
            records.push(TabRecord {
                index,
                active,
                title,
                url,
                last_activity,
            });
        }
        activity.retain(|url, _| records.iter().any(|tab| &tab.url == url));
        Ok(records)
    }

    /// The guarded equivalent of the gateway's `invoke`.
    pub async fn invoke(&self, name: &str, args: &Value) -> Result<ToolResult, GatewayError> {
        if !self.limits.idle_tab_timeout.is_zero() {
            if let Err(e) = self.idle_sweep().await {
                warn!("Idle tab sweep failed: {}", e);
            }
        }

        let page_creating = self.is_page_creating(name).await;

        if page_creating && self.limits.max_pages > 0 {
            let count = self.tabs().await.map(|tabs| tabs.len()).unwrap_or(0);
            if count >= self.limits.max_pages {
                info!(
                    "Refusing {}: page limit reached ({}/{})",
                    name, count, self.limits.max_pages
                );
                return Ok(ToolResult::error(format!(
                    "Page limit reached ({} of {} tabs open). Close an existing tab with \
                     {} before opening a new one.",
                    count, self.limits.max_pages, TAB_CLOSE_TOOL
                )));
            }
        }

        let result = self.backend.invoke(name, args).await?;

        self.stamp_active_tab().await;

        if self.limits.max_pages > 0 {
            if let Err(e) = self.evict_excess_tabs().await {
                warn!("Tab eviction failed: {}", e);
            }
        }

        if page_creating && !result.is_error {
            let created = self.pages_created.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Lifetime page creations: {}", created);
            if self.limits.restart_after_pages > 0 && created >= self.limits.restart_after_pages {
                info!(
                    "Restarting browser session after {} page creations",
                    created
                );
                self.backend.restart().await?;
                self.pages_created.store(0, Ordering::SeqCst);
                self.activity.lock().unwrap().clear();
            }
        }

        Ok(result)
    }

    /// A call creates a page if it opens a tab outright, or if it navigates
    /// while no tabs exist yet (the first navigation creates the first page).
    async fn is_page_creating(&self, name: &str) -> bool {
        if self.limits.max_pages == 0 && self.limits.restart_after_pages == 0 {
            return false;
        }
        match name {
            TAB_NEW_TOOL => true,
            NAVIGATE_TOOL => match self.tabs().await {
                Ok(tabs) => tabs.is_empty(),
                Err(e) => {
                    debug!("Could not list tabs for admission check: {}", e);
                    false
                }
            },
            _ => false,
        }
    }

    /// Close at most ONE idle inactive tab. Closing renumbers the indices of
    /// every later tab, so closing more than one per sweep risks closing the
    /// wrong tab; the next invoke sweeps again for any remaining.
    async fn idle_sweep(&self) -> Result<(), GatewayError> {
        let tabs = self.tabs().await?;
        let now = Instant::now();

        {
            let mut activity = self.activity.lock().unwrap();
            for tab in tabs.iter().filter(|tab| tab.active) {
                activity.insert(tab.url.clone(), now);
            }
        }

        let idle = tabs.iter().find(|tab| {
            !tab.active
                && now.duration_since(tab.last_activity) >= self.limits.idle_tab_timeout
        });
        if let Some(tab) = idle {
            info!(
                "Closing idle tab {} ({}), inactive for {:?}",
                tab.index,
                tab.url,
                now.duration_since(tab.last_activity)
            );
            self.close_tab(tab.index).await?;
            self.activity.lock().unwrap().remove(&tab.url);
        }
        Ok(())
    }

    /// Stamp whichever tab is active after an execution; a tool call may have
    /// activated a different tab as a side effect.
    async fn stamp_active_tab(&self) {
        match self.tabs().await {
            Ok(tabs) => {
                let now = Instant::now();
                let mut activity = self.activity.lock().unwrap();
                for tab in tabs.iter().filter(|tab| tab.active) {
                    activity.insert(tab.url.clone(), now);
                }
            }
            Err(e) => debug!("Could not stamp active tab: {}", e),
        }
    }

    /// Page-script side effects (window.open, target="_blank") can bypass
    /// admission control; close the excess here. Oldest activity first, never
    /// the active tab, one at a time with a settle pause, re-listing between
    /// closes because each close renumbers the survivors.
    async fn evict_excess_tabs(&self) -> Result<(), GatewayError> {
        let mut previous_count = usize::MAX;
        loop {
            let tabs = self.tabs().await?;
            if tabs.len() <= self.limits.max_pages {
                return Ok(());
            }
            if tabs.len() >= previous_count {
                warn!(
                    "Tab count did not drop after eviction ({} tabs); giving up this round",
                    tabs.len()
                );
                return Ok(());
            }
            previous_count = tabs.len();
            let Some(victim) = tabs
                .iter()
                .filter(|tab| !tab.active)
                .min_by_key(|tab| tab.last_activity)
            else {
                return Ok(());
            };
            info!(
                "Evicting tab {} ({}): {} tabs open, limit {}",
                victim.index,
                victim.url,
                tabs.len(),
                self.limits.max_pages
            );
            self.close_tab(victim.index).await?;
            self.activity.lock().unwrap().remove(&victim.url);
            tokio::time::sleep(CLOSE_SETTLE).await;
        }
    }

    async fn close_tab(&self, index: usize) -> Result<(), GatewayError> {
        let result = self
            .backend
            .invoke(TAB_CLOSE_TOOL, &json!({ "index": index }))
            .await?;
        if result.is_error {
            warn!("Closing tab {} failed: {}", index, result.text_content());
        }
        Ok(())
    }
}

/// Parse one line of a tab listing: `- <index>: [(current) ]<title> (<url>)`.
/// Unparsable lines are ignored, never fatal.
pub fn parse_tab_line(line: &str) -> Option<(usize, bool, String, String)> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^-\s*(\d+):\s*(\(current\)\s*)?(.*?)\s*\(([^()]*)\)\s*$")
            .expect("tab listing pattern is valid")
    });
    let captures = pattern.captures(line.trim())?;
    let index = captures.get(1)?.as_str().parse().ok()?;
    let active = captures.get(2).is_some();
    let title = captures.get(3)?.as_str().to_string();
    let url = captures.get(4)?.as_str().to_string();
    Some((index, active, title, url))
}
