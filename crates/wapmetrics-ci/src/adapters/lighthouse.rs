//! Lighthouse CI adapter.
//!
//! Writes the generated `lighthouserc` into the scratch dir, runs
//! `lhci autorun` against it and turns the filesystem reports into
//! budget-breach findings and `lhci-summary.json`.

use std::collections::BTreeSet;
use std::fs;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use wapmetrics_core::report::CORE_METRICS;
use wapmetrics_core::{
    aggregate_route, budget_findings, collect_reports, collect_urls, rekey_reports, transform,
    ReportSummary, ResolvedThresholds, TransformOptions,
};

use super::findings_table;
use crate::plugin::{MeasurementTool, PluginCapabilities, PluginDescriptor, RunContext, ToolOutput};
use crate::runner::{CommandRunner, CommandSpec};

pub const LHCI_TOOL: &str = "lhci";

/// Generated config snapshot, kept as an artifact.
pub const GENERATED_RC: &str = "lighthouserc.generated.json";

pub const SUMMARY_FILE: &str = "lhci-summary.json";

const REPORTS_DIR: &str = "lhci-reports";

fn default_command() -> Vec<&'static str> {
    vec!["npx", "-y", "@lhci/cli@0.15.x", "autorun"]
}

pub struct LighthouseTool;

#[async_trait]
impl MeasurementTool for LighthouseTool {
    fn init(&self) -> anyhow::Result<PluginDescriptor> {
        Ok(PluginDescriptor::new(LHCI_TOOL, wapmetrics_core::VERSION)
            .with_capabilities(PluginCapabilities {
                needs_base_url: true,
                parallel_safe: true,
                ..PluginCapabilities::default()
            })
            .with_default("command", json!(default_command())))
    }

    async fn run(&self, ctx: &RunContext) -> anyhow::Result<ToolOutput> {
        if ctx.target.base_url.is_none() && ctx.target.static_dir.is_none() {
            anyhow::bail!("lhci requires a base URL or a static directory");
        }

        let reports_dir = ctx.scratch_dir.join(REPORTS_DIR);
        fs::create_dir_all(&reports_dir)
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut options = TransformOptions::new(&reports_dir);
        if let Some(base_url) = &ctx.target.base_url {
            options = options.with_base_url(base_url.clone());
        }
        if let Some(dir) = &ctx.target.static_dir {
            options = options.with_static_dist_dir(dir.to_string_lossy().to_string());
        }

        let rc = transform(&ctx.project, &ctx.budgets, &options);
        let rc_path = ctx.scratch_dir.join(GENERATED_RC);
        fs::write(&rc_path, rc.to_json_pretty()?)
            .with_context(|| format!("writing {}", rc_path.display()))?;

        let argv = ctx
            .config_string_list("command")
            .unwrap_or_else(|| default_command().into_iter().map(str::to_string).collect());
        let spec = CommandSpec::new(LHCI_TOOL, argv)?
            .with_args(["--config".to_string(), rc_path.to_string_lossy().to_string()])
            .with_cwd(&ctx.cwd)
            .with_timeout(ctx.config_u64("timeoutMs"));

        let outcome = CommandRunner::execute(&spec).await?;
        let url_match = options.url_match();
        let grouped = rekey_reports(collect_reports(&reports_dir)?, url_match);

        if !outcome.passed() {
            if grouped.is_empty() {
                anyhow::bail!(
                    "lhci exited with code {} and produced no reports: {}",
                    outcome.exit_code,
                    outcome.stderr_tail(5)
                );
            }
            warn!(
                tool = LHCI_TOOL,
                exit_code = outcome.exit_code,
                "lhci exited non-zero; using the reports it produced"
            );
        }

        let unconstrained = ResolvedThresholds::new();
        let urls = collect_urls(&ctx.project, &options);
        let mut findings = Vec::new();
        let mut measured = Vec::new();

        for (route, url) in ctx.project.routes.iter().zip(urls) {
            let thresholds = ctx.budgets.for_route(route.path()).unwrap_or(&unconstrained);
            let tracked: BTreeSet<&str> = CORE_METRICS
                .iter()
                .copied()
                .chain(thresholds.metrics())
                .collect();

            let reports = grouped
                .get(&url_match.key(&url))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if reports.is_empty() {
                warn!(tool = LHCI_TOOL, url = %url, "No reports collected for route");
            }
            let metrics = aggregate_route(&url, reports, tracked);
            findings.extend(budget_findings(LHCI_TOOL, route.path(), &metrics, thresholds));
            if metrics.samples > 0 {
                measured.push(metrics);
            }
        }

        let summary_path = ctx.scratch_dir.join(SUMMARY_FILE);
        let summary = ReportSummary::from_routes(&measured);
        fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("writing {}", summary_path.display()))?;

        info!(
            tool = LHCI_TOOL,
            routes = measured.len(),
            findings = findings.len(),
            "Parsed Lighthouse reports"
        );

        Ok(ToolOutput::new(findings)
            .with_artifact(rc_path)
            .with_artifact(reports_dir)
            .with_artifact(summary_path))
    }

    async fn summarize(&self, _ctx: &RunContext, output: &ToolOutput) -> Option<String> {
        let body = if output.findings.is_empty() {
            "No budget violations.".to_string()
        } else {
            findings_table(&output.findings)
        };
        Some(format!("### Performance (Lighthouse CI)\n\n{}", body))
    }
}
