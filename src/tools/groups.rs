//! Tool group registry - which tool schemas the model currently sees.
//!
//! Tools are bundled into groups. Only loaded groups contribute schemas to a
//! request, which keeps the prompt small for local models. Groups come in:
//!
//! - explicitly, through [`ToolGroupRegistry::load`]
//! - by intent, when an observed message mentions one of the group keywords
//! - at startup, from the enabled-groups setting
//!
//! and go out explicitly or when they sit unused for too many tool calls.
//! Every change is broadcast as a [`ToolListChanged`] event.
//!
//! # Example
//!
//! ```rust
//! use mirrorclaw::config::ToolsConfig;
//! use mirrorclaw::tools::ToolGroupRegistry;
//!
//! # tokio_test::block_on(async {
//! let registry = ToolGroupRegistry::from_config(&ToolsConfig::default());
//! let report = registry.load("browser").await;
//! tokio_test::assert_ok!(&report);
//! assert!(registry.is_loaded("screen").await);
//! # });
//! ```

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use super::catalog;
use super::ToolDescriptor;
use crate::config::ToolsConfig;
use crate::error::{MirrorError, Result};

/// A named bundle of tools.
#[derive(Debug, Clone)]
pub struct ToolGroup {
    pub name: String,
    pub description: String,
    pub tools: Vec<ToolDescriptor>,
    /// Always-loaded groups cannot be unloaded.
    pub always_loaded: bool,
    /// Lowercase substrings that pull the group in when seen in a message.
    pub keywords: Vec<String>,
    /// Groups that are loaded along with this one.
    pub dependencies: Vec<String>,
}

impl ToolGroup {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            tools: Vec::new(),
            always_loaded: false,
            keywords: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn always_loaded(mut self) -> Self {
        self.always_loaded = true;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_lowercase()).collect();
        self
    }

    pub fn depends_on(mut self, groups: &[&str]) -> Self {
        self.dependencies = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    fn matches_intent(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

/// Why the active tool list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Load,
    Unload,
    Intent,
    Idle,
    Startup,
}

/// Broadcast whenever the set of loaded groups changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolListChanged {
    pub loaded: Vec<String>,
    pub unloaded: Vec<String>,
    pub reason: ChangeReason,
}

/// One line of `list_tool_groups` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub loaded: bool,
    pub always_loaded: bool,
    pub tool_count: usize,
    pub tool_names: Vec<String>,
    pub description: String,
}

impl fmt::Display for GroupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.loaded, self.always_loaded) {
            (_, true) => "always",
            (true, false) => "loaded",
            (false, false) => "unloaded",
        };
        write!(
            f,
            "[{}] {} ({} tools) -- {}",
            status, self.name, self.tool_count, self.description
        )
    }
}

/// Result of a [`ToolGroupRegistry::load`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub group: String,
    /// Groups activated by this call, dependencies included.
    pub activated: Vec<String>,
    pub tool_names: Vec<String>,
}

impl LoadReport {
    pub fn already_loaded(&self) -> bool {
        self.activated.is_empty()
    }
}

#[derive(Debug, Default)]
struct LoadState {
    loaded: HashSet<String>,
    /// Group name -> value of `call_count` when last used.
    last_used: HashMap<String, u64>,
    call_count: u64,
}

/// Registry of tool groups and their load state.
///
/// Shared as `Arc<ToolGroupRegistry>` between the mailbox handlers and the
/// provider session. All mutation goes through an internal `RwLock`.
pub struct ToolGroupRegistry {
    groups: Vec<ToolGroup>,
    by_name: HashMap<String, usize>,
    /// Tool name -> owning group index, built once.
    tool_index: HashMap<String, usize>,
    idle_limit: u64,
    state: RwLock<LoadState>,
    changes: broadcast::Sender<ToolListChanged>,
}

impl ToolGroupRegistry {
    /// Build a registry over `groups`, with always-loaded groups active.
    ///
    /// # Arguments
    /// * `groups` - Catalog, in listing order
    /// * `idle_limit` - Tool calls a dynamic group may go unused before eviction
    pub fn new(groups: Vec<ToolGroup>, idle_limit: u64) -> Self {
        let mut by_name = HashMap::new();
        let mut tool_index = HashMap::new();
        let mut state = LoadState::default();

        for (idx, group) in groups.iter().enumerate() {
            by_name.insert(group.name.clone(), idx);
            for tool in &group.tools {
                tool_index.insert(tool.name.clone(), idx);
            }
            if group.always_loaded {
                state.loaded.insert(group.name.clone());
            }
        }

        let (changes, _) = broadcast::channel(32);
        Self {
            groups,
            by_name,
            tool_index,
            idle_limit,
            state: RwLock::new(state),
            changes,
        }
    }

    /// The built-in catalog, with the configured groups pre-loaded.
    ///
    /// Unknown names in `enabled_groups` are logged and skipped.
    pub fn from_config(config: &ToolsConfig) -> Self {
        let registry = Self::new(catalog::default_groups(), config.idle_unload_after_calls);
        if let Ok(mut state) = registry.state.try_write() {
            for name in &config.enabled_groups {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                match registry.by_name.get(name) {
                    Some(&idx) => {
                        let mut activated = Vec::new();
                        registry.activate(&mut state, idx, &mut activated);
                    }
                    None => debug!(group = name, "Ignoring unknown enabled group"),
                }
            }
        }
        registry
    }

    /// Pre-load a comma-separated list of groups.
    ///
    /// Returns the groups that were activated. Unknown names are skipped.
    pub async fn apply_enabled_groups(&self, list: &str) -> Vec<String> {
        let mut activated = Vec::new();
        {
            let mut state = self.state.write().await;
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                match self.by_name.get(name) {
                    Some(&idx) => self.activate(&mut state, idx, &mut activated),
                    None => debug!(group = name, "Ignoring unknown enabled group"),
                }
            }
        }
        if !activated.is_empty() {
            info!(groups = ?activated, "Pre-loaded tool groups");
            self.notify(activated.clone(), Vec::new(), ChangeReason::Startup);
        }
        activated
    }

    /// Subscribe to tool list changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ToolListChanged> {
        self.changes.subscribe()
    }

    pub fn groups(&self) -> &[ToolGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&ToolGroup> {
        self.by_name.get(name).map(|&idx| &self.groups[idx])
    }

    /// Name of the group that owns `tool`.
    pub fn group_of(&self, tool: &str) -> Option<&str> {
        self.tool_index
            .get(tool)
            .map(|&idx| self.groups[idx].name.as_str())
    }

    pub fn descriptor(&self, tool: &str) -> Option<&ToolDescriptor> {
        let idx = *self.tool_index.get(tool)?;
        self.groups[idx].tools.iter().find(|t| t.name == tool)
    }

    pub fn is_destructive(&self, tool: &str) -> bool {
        self.descriptor(tool).map(|t| t.destructive).unwrap_or(false)
    }

    pub async fn is_loaded(&self, group: &str) -> bool {
        self.state.read().await.loaded.contains(group)
    }

    /// Names of the loaded groups, in catalog order.
    pub async fn loaded_groups(&self) -> Vec<String> {
        let state = self.state.read().await;
        self.groups
            .iter()
            .filter(|g| state.loaded.contains(&g.name))
            .map(|g| g.name.clone())
            .collect()
    }

    /// Descriptors of every tool in a loaded group.
    pub async fn active_tools(&self) -> Vec<ToolDescriptor> {
        let state = self.state.read().await;
        self.groups
            .iter()
            .filter(|g| state.loaded.contains(&g.name))
            .flat_map(|g| g.tools.iter().cloned())
            .collect()
    }

    /// Load a group and its dependencies.
    ///
    /// Loading an already loaded group succeeds and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::ToolGroup`] naming the available groups when
    /// `name` is not in the catalog.
    pub async fn load(&self, name: &str) -> Result<LoadReport> {
        let idx = self.index_of(name)?;
        let mut activated = Vec::new();
        {
            let mut state = self.state.write().await;
            self.activate(&mut state, idx, &mut activated);
            let now = state.call_count;
            state.last_used.insert(name.to_string(), now);
        }

        if !activated.is_empty() {
            info!(group = name, activated = ?activated, "Loaded tool group");
            self.notify(activated.clone(), Vec::new(), ChangeReason::Load);
        }

        Ok(LoadReport {
            group: name.to_string(),
            activated,
            tool_names: self.groups[idx].tool_names(),
        })
    }

    /// Unload a group. Returns the number of tools removed from context.
    ///
    /// Unloading a group that is not loaded succeeds and returns 0.
    ///
    /// # Errors
    ///
    /// Fails for unknown groups and for always-loaded groups.
    pub async fn unload(&self, name: &str) -> Result<usize> {
        let idx = self.index_of(name)?;
        let group = &self.groups[idx];
        if group.always_loaded {
            return Err(MirrorError::ToolGroup(format!(
                "Cannot unload \"{}\": it is always loaded",
                name
            )));
        }

        let removed = {
            let mut state = self.state.write().await;
            state.last_used.remove(name);
            state.loaded.remove(name)
        };
        if !removed {
            return Ok(0);
        }

        info!(group = name, "Unloaded tool group");
        self.notify(Vec::new(), vec![name.to_string()], ChangeReason::Unload);
        Ok(group.tools.len())
    }

    /// Every group with its status.
    pub async fn list(&self) -> Vec<GroupSummary> {
        let state = self.state.read().await;
        self.groups
            .iter()
            .map(|g| GroupSummary {
                name: g.name.clone(),
                loaded: state.loaded.contains(&g.name),
                always_loaded: g.always_loaded,
                tool_count: g.tools.len(),
                tool_names: g.tool_names(),
                description: g.description.clone(),
            })
            .collect()
    }

    /// Load every unloaded group whose keywords appear in `text`.
    ///
    /// Matching is a case-insensitive substring test. Returns the activated
    /// groups, dependencies included; one notification covers all of them.
    pub async fn auto_load_by_intent(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut activated = Vec::new();
        {
            let mut state = self.state.write().await;
            for (idx, group) in self.groups.iter().enumerate() {
                if group.always_loaded || state.loaded.contains(&group.name) {
                    continue;
                }
                if group.matches_intent(&lowered) {
                    self.activate(&mut state, idx, &mut activated);
                }
            }
        }

        if !activated.is_empty() {
            info!(groups = ?activated, "Auto-loaded tool groups by intent");
            self.notify(activated.clone(), Vec::new(), ChangeReason::Intent);
        }
        activated
    }

    /// Count a tool call and mark its group (and the group's dependencies) used.
    pub async fn record_tool_call(&self, tool: &str) {
        let mut state = self.state.write().await;
        state.call_count += 1;
        let now = state.call_count;

        if let Some(&idx) = self.tool_index.get(tool) {
            let group = &self.groups[idx];
            state.last_used.insert(group.name.clone(), now);
            for dep in &group.dependencies {
                state.last_used.insert(dep.clone(), now);
            }
        }
    }

    /// Unload dynamic groups unused for more than the idle limit.
    ///
    /// Returns the unloaded group names.
    pub async fn auto_unload_idle(&self) -> Vec<String> {
        let mut unloaded = Vec::new();
        {
            let mut state = self.state.write().await;
            let now = state.call_count;
            for group in self.groups.iter().filter(|g| !g.always_loaded) {
                if !state.loaded.contains(&group.name) {
                    continue;
                }
                let last = state.last_used.get(&group.name).copied().unwrap_or(0);
                if now.saturating_sub(last) > self.idle_limit {
                    state.loaded.remove(&group.name);
                    state.last_used.remove(&group.name);
                    unloaded.push(group.name.clone());
                }
            }
        }

        if !unloaded.is_empty() {
            info!(groups = ?unloaded, "Auto-unloaded idle tool groups");
            self.notify(Vec::new(), unloaded.clone(), ChangeReason::Idle);
        }
        unloaded
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.by_name.get(name).copied().ok_or_else(|| {
            let available: Vec<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
            MirrorError::ToolGroup(format!(
                "Unknown tool group \"{}\". Available: {}",
                name,
                available.join(", ")
            ))
        })
    }

    /// Mark a group and, transitively, its dependencies loaded.
    fn activate(&self, state: &mut LoadState, idx: usize, activated: &mut Vec<String>) {
        let group = &self.groups[idx];
        if !state.loaded.insert(group.name.clone()) {
            return;
        }
        let now = state.call_count;
        state.last_used.insert(group.name.clone(), now);
        activated.push(group.name.clone());

        for dep in &group.dependencies {
            match self.by_name.get(dep) {
                Some(&dep_idx) => self.activate(state, dep_idx, activated),
                None => debug!(group = %group.name, dependency = %dep, "Unknown dependency"),
            }
        }
    }

    fn notify(&self, loaded: Vec<String>, unloaded: Vec<String>, reason: ChangeReason) {
        // No subscribers is fine
        let _ = self.changes.send(ToolListChanged {
            loaded,
            unloaded,
            reason,
        });
    }
}
