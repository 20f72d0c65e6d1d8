//! User-facing route/budget schema and its loader.
//!
//! The config file is JSON with three required-ish top-level keys:
//! `settings` (needs `baseUrl`), `routes` (non-empty) and the optional
//! `budgets` map whose reserved `global` key applies to every route.
//! `plugins` and `runtime` are optional and feed tool selection and target
//! provisioning. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{Result, WapmError};

/// Reserved budget key applied to all routes.
pub const GLOBAL_BUDGET: &str = "global";

/// Sample count used when `settings.numberOfRuns` is absent.
pub const DEFAULT_NUMBER_OF_RUNS: u32 = 3;

/// Project-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    /// Origin that relative routes are resolved against.
    pub base_url: String,

    /// Repeated measurements per route. Must be >= 1 when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_runs: Option<u32>,

    /// Collection preset forwarded to the audit tool (e.g. `desktop`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl ProjectSettings {
    /// Effective run count.
    pub fn number_of_runs(&self) -> u32 {
        self.number_of_runs.unwrap_or(DEFAULT_NUMBER_OF_RUNS)
    }
}

/// A resource size or count ceiling. Recorded, not asserted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBudget {
    pub resource_type: String,
    pub budget: f64,
}

/// Named set of metric ceilings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Metric identifier (e.g. `largest-contentful-paint`) to ceiling.
    #[serde(default)]
    pub timings: BTreeMap<String, f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_sizes: Vec<ResourceBudget>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_counts: Vec<ResourceBudget>,
}

impl Budget {
    /// Budget with only timing ceilings.
    pub fn with_timings<I, K>(timings: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            timings: timings.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            ..Self::default()
        }
    }
}

/// A route: either a bare path/URL or a path with a named budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RouteConfig {
    Path(String),
    Detailed {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        budget: Option<String>,
    },
}

impl RouteConfig {
    pub fn path(&self) -> &str {
        match self {
            RouteConfig::Path(path) => path,
            RouteConfig::Detailed { path, .. } => path,
        }
    }

    /// Named budget reference, if any. Empty references count as none.
    pub fn budget(&self) -> Option<&str> {
        match self {
            RouteConfig::Path(_) => None,
            RouteConfig::Detailed { budget, .. } => {
                budget.as_deref().filter(|b| !b.trim().is_empty())
            }
        }
    }
}

impl From<&str> for RouteConfig {
    fn from(path: &str) -> Self {
        RouteConfig::Path(path.to_string())
    }
}

/// Persisted per-tool entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginEntry {
    pub name: String,

    #[serde(default = "enabled_by_default")]
    pub enabled: bool,

    /// Per-tool persisted configuration layer.
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn enabled_by_default() -> bool {
    true
}

/// Local start command settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_timeout_ms: Option<u64>,

    /// URL the started server listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Persisted target hints. Run-level inputs win field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dist_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartConfig>,
}

/// Validated configuration. Read-only after load; downstream components
/// derive new structures from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedConfig {
    pub settings: ProjectSettings,

    #[serde(default)]
    pub budgets: BTreeMap<String, Budget>,

    pub routes: Vec<RouteConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginEntry>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl NormalizedConfig {
    /// Minimal config with the given base URL and bare routes.
    pub fn new(base_url: impl Into<String>, routes: &[&str]) -> Self {
        Self {
            settings: ProjectSettings {
                base_url: base_url.into(),
                number_of_runs: None,
                preset: None,
            },
            budgets: BTreeMap::new(),
            routes: routes.iter().map(|r| RouteConfig::from(*r)).collect(),
            plugins: Vec::new(),
            runtime: RuntimeConfig::default(),
        }
    }

    /// Add or replace a named budget.
    pub fn with_budget(mut self, name: impl Into<String>, budget: Budget) -> Self {
        self.budgets.insert(name.into(), budget);
        self
    }

    /// The `global` budget, if declared.
    pub fn global_budget(&self) -> Option<&Budget> {
        self.budgets.get(GLOBAL_BUDGET)
    }

    /// Enabled tool names in file order.
    pub fn enabled_tools(&self) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Persisted config layer for one tool.
    pub fn tool_config(&self, name: &str) -> Option<&Map<String, Value>> {
        self.plugins.iter().find(|p| p.name == name).map(|p| &p.config)
    }

    /// Derive a config whose routes are replaced by bare paths.
    pub fn with_routes_override(&self, routes: &[String]) -> Result<Self> {
        let mut derived = self.clone();
        derived.routes = routes
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(RouteConfig::from)
            .collect();
        derived.validate()?;
        Ok(derived)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.settings.base_url.trim().is_empty() {
            return Err(WapmError::ConfigInvalid(
                "'settings.baseUrl' is required".to_string(),
            ));
        }
        if self.settings.number_of_runs == Some(0) {
            return Err(WapmError::ConfigInvalid(
                "'settings.numberOfRuns' must be at least 1".to_string(),
            ));
        }
        if self.routes.is_empty() {
            return Err(WapmError::ConfigInvalid(
                "'routes' must be a non-empty array".to_string(),
            ));
        }
        if let Some(route) = self.routes.iter().find(|r| r.path().trim().is_empty()) {
            return Err(WapmError::ConfigInvalid(format!(
                "route path must not be empty: {:?}",
                route
            )));
        }
        for (name, budget) in &self.budgets {
            if let Some((metric, _)) = budget.timings.iter().find(|(_, v)| !v.is_finite()) {
                return Err(WapmError::ConfigInvalid(format!(
                    "budget '{}' has a non-finite value for '{}'",
                    name, metric
                )));
            }
        }
        Ok(())
    }
}

/// Parse and validate config text.
pub fn parse_config(raw: &str) -> Result<NormalizedConfig> {
    let config: NormalizedConfig = serde_json::from_str(raw)
        .map_err(|e| WapmError::ConfigInvalid(format!("failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load the config file at `path`.
///
/// Fails with `ConfigNotFound` when the file is absent and `ConfigInvalid`
/// when it is not JSON or misses required fields. Reads exactly one file.
pub fn load_config(path: impl AsRef<Path>) -> Result<NormalizedConfig> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(WapmError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let raw = std::fs::read_to_string(path)?;
    parse_config(&raw)
}
