//! axe accessibility scanner adapter.

use std::fs;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use wapmetrics_core::{resolve_url, violation_finding, ScannerViolation};

use super::cell;
use crate::plugin::{MeasurementTool, PluginCapabilities, PluginDescriptor, RunContext, ToolOutput};
use crate::runner::{CommandRunner, CommandSpec};

pub const AXE_TOOL: &str = "axe";

fn default_command() -> Vec<&'static str> {
    vec!["npx", "-y", "@axe-core/cli"]
}

fn default_tags() -> Vec<&'static str> {
    vec!["wcag2a", "wcag2aa"]
}

/// Violations from a saved scanner result: either one result object or
/// an array of them.
pub fn parse_axe_results(raw: &str) -> anyhow::Result<Vec<ScannerViolation>> {
    let value: Value = serde_json::from_str(raw).context("parsing axe output")?;
    let results = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    let mut violations = Vec::new();
    for result in results {
        if let Some(Value::Array(items)) = result.get("violations") {
            for item in items {
                violations.push(serde_json::from_value(item.clone())?);
            }
        }
    }
    Ok(violations)
}

pub struct AxeTool;

#[async_trait]
impl MeasurementTool for AxeTool {
    fn init(&self) -> anyhow::Result<PluginDescriptor> {
        Ok(PluginDescriptor::new(AXE_TOOL, wapmetrics_core::VERSION)
            .with_capabilities(PluginCapabilities {
                needs_base_url: true,
                parallel_safe: true,
                ..PluginCapabilities::default()
            })
            .with_default("command", json!(default_command()))
            .with_default("tags", json!(default_tags())))
    }

    async fn run(&self, ctx: &RunContext) -> anyhow::Result<ToolOutput> {
        let base_url = ctx.base_url()?;
        let argv = ctx
            .config_string_list("command")
            .unwrap_or_else(|| default_command().into_iter().map(str::to_string).collect());
        let tags = ctx
            .config_string_list("tags")
            .unwrap_or_else(|| default_tags().into_iter().map(str::to_string).collect());

        let mut output = ToolOutput::default();
        for (index, route) in ctx.route_paths().iter().enumerate() {
            let url = resolve_url(base_url, route);
            let file = format!("axe-{}.json", index);
            let spec = CommandSpec::new(AXE_TOOL, argv.clone())?
                .with_args([
                    url.clone(),
                    "--tags".to_string(),
                    tags.join(","),
                    "--dir".to_string(),
                    ctx.scratch_dir.to_string_lossy().to_string(),
                    "--save".to_string(),
                    file.clone(),
                ])
                .with_cwd(&ctx.cwd)
                .with_timeout(ctx.config_u64("timeoutMs"));

            let outcome = CommandRunner::execute(&spec).await?;
            let saved = ctx.scratch_dir.join(&file);
            if !saved.is_file() {
                anyhow::bail!(
                    "axe produced no results for {} (exit code {}): {}",
                    url,
                    outcome.exit_code,
                    outcome.stderr_tail(5)
                );
            }

            let raw = fs::read_to_string(&saved)
                .with_context(|| format!("reading {}", saved.display()))?;
            let violations = parse_axe_results(&raw)?;
            debug!(tool = AXE_TOOL, url = %url, violations = violations.len(), "Scanned route");

            output
                .findings
                .extend(violations.iter().map(|v| violation_finding(AXE_TOOL, route, v)));
            output.artifacts.push(saved);
        }
        Ok(output)
    }

    async fn summarize(&self, ctx: &RunContext, output: &ToolOutput) -> Option<String> {
        let mut lines = vec![
            "### Accessibility (axe)".to_string(),
            String::new(),
            "| Route | Violations | Blocking |".to_string(),
            "| --- | --- | --- |".to_string(),
        ];
        for route in ctx.route_paths() {
            let on_route = output
                .findings
                .iter()
                .filter(|f| f.route.as_deref() == Some(route.as_str()));
            let (total, blocking) = on_route.fold((0, 0), |(t, b), f| {
                (t + 1, b + usize::from(f.severity.is_blocking()))
            });
            lines.push(format!("| {} | {} | {} |", cell(&route), total, blocking));
        }
        Some(lines.join("\n"))
    }
}
