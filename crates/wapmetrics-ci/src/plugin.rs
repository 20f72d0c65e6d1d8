//! Measurement tool contract.
//!
//! A tool declares itself through [`MeasurementTool::init`], may opt out via
//! `detect`, and produces findings from `run`. Hooks return
//! `anyhow::Result`; the orchestrator turns an error into a failure
//! attributed to the tool and keeps going.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use wapmetrics_core::{BudgetResolution, Finding, NormalizedConfig, Provenance};

use crate::target::TargetInfo;

/// What a tool needs from the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginCapabilities {
    pub needs_base_url: bool,
    pub needs_static_dir: bool,
    /// Requires exclusive control of the local server process.
    pub needs_local_server: bool,
    /// May overlap with other parallel-safe tools.
    pub parallel_safe: bool,
}

impl PluginCapabilities {
    /// Whether the target has to be provisioned before the tool runs.
    pub fn needs_target(&self) -> bool {
        self.needs_base_url || self.needs_static_dir || self.needs_local_server
    }
}

/// Static description returned by `init`.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub capabilities: PluginCapabilities,
    /// Lowest-precedence config layer.
    pub defaults: Map<String, Value>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: PluginCapabilities::default(),
            defaults: Map::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: PluginCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }
}

/// Everything a tool sees during one invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub tool: String,
    pub target: TargetInfo,
    /// Per-tool scratch directory inside the run's work dir.
    pub scratch_dir: PathBuf,
    /// Directory tool processes are started in.
    pub cwd: PathBuf,
    /// Merged config: defaults < persisted < run-level override.
    pub config: Map<String, Value>,
    pub project: Arc<NormalizedConfig>,
    pub budgets: Arc<BudgetResolution>,
    pub provenance: Provenance,
}

impl RunContext {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }

    /// A list of strings, or a single whitespace-separated string.
    pub fn config_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.config.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            Value::String(s) => Some(s.split_whitespace().map(str::to_string).collect()),
            _ => None,
        }
    }

    /// Base URL of the target, or an error naming the tool.
    pub fn base_url(&self) -> anyhow::Result<&str> {
        self.target
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("{} requires a base URL but the target has none", self.tool))
    }

    /// Route paths this run measures.
    pub fn route_paths(&self) -> Vec<String> {
        self.project
            .routes
            .iter()
            .map(|r| r.path().to_string())
            .collect()
    }
}

/// What `run` hands back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub findings: Vec<Finding>,
    pub artifacts: Vec<PathBuf>,
}

impl ToolOutput {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }
}

/// A pluggable measurement or scanning tool.
#[async_trait]
pub trait MeasurementTool: Send + Sync {
    fn init(&self) -> anyhow::Result<PluginDescriptor>;

    /// Return `Ok(false)` to skip the tool for this run.
    async fn detect(&self, _ctx: &RunContext) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn prepare(&self, _ctx: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &RunContext) -> anyhow::Result<ToolOutput>;

    /// Markdown section for the status comment.
    async fn summarize(&self, _ctx: &RunContext, _output: &ToolOutput) -> Option<String> {
        None
    }
}
