//! Findings aggregation and the pass/fail gate.
//!
//! The gate passes iff no finding is `high` or `critical`. Budget breaches
//! (`value > threshold`, never `>=`) are always `high`. Scanner violations
//! are `high` for `critical`/`serious` impact and `medium` otherwise.
//! Nothing is deduplicated here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::budget::ResolvedThresholds;
use crate::domain::finding::{Finding, Severity};
use crate::report::{MetricValue, RouteMetrics, CLS};

// ---------------------------------------------------------------------------
// Budget breaches
// ---------------------------------------------------------------------------

/// Docs link attached to performance findings.
pub const WEB_VITALS_DOCS: &str = "https://web.dev/vitals/";

fn metric_label(metric: &str) -> String {
    match metric {
        "largest-contentful-paint" => "LCP".to_string(),
        "cumulative-layout-shift" => "CLS".to_string(),
        "interaction-to-next-paint" => "INP".to_string(),
        "total-blocking-time" => "TBT".to_string(),
        "first-contentful-paint" => "FCP".to_string(),
        "speed-index" => "SI".to_string(),
        other => other.to_string(),
    }
}

fn format_metric(metric: &str, value: f64) -> String {
    if metric == CLS {
        format!("{:.3}", value)
    } else {
        format!("{:.2}s", value / 1000.0)
    }
}

/// Compare aggregated metrics against thresholds. Unmeasured metrics never
/// breach.
pub fn budget_findings(
    tool: &str,
    route: &str,
    metrics: &RouteMetrics,
    thresholds: &ResolvedThresholds,
) -> Vec<Finding> {
    thresholds
        .iter()
        .filter_map(|(metric, ceiling)| match metrics.get(metric) {
            MetricValue::Measured(value) if value > ceiling => {
                let label = metric_label(metric);
                Some(
                    Finding::new(
                        tool,
                        Severity::High,
                        format!("{} over budget", label),
                        format!(
                            "{} {} > {}",
                            label,
                            format_metric(metric, value),
                            format_metric(metric, ceiling)
                        ),
                    )
                    .with_route(route)
                    .with_tags(["performance", "cwv"])
                    .with_docs_url(WEB_VITALS_DOCS),
                )
            }
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scanner violations
// ---------------------------------------------------------------------------

/// Scanner impact classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScannerImpact {
    Critical,
    Serious,
    Moderate,
    Minor,
}

pub fn severity_for_impact(impact: Option<ScannerImpact>) -> Severity {
    match impact {
        Some(ScannerImpact::Critical) | Some(ScannerImpact::Serious) => Severity::High,
        _ => Severity::Medium,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViolationNode {
    #[serde(default)]
    pub failure_summary: Option<String>,
}

/// One accessibility rule violation as reported by the scanner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScannerViolation {
    pub id: String,
    #[serde(default)]
    pub impact: Option<ScannerImpact>,
    #[serde(default)]
    pub help: Option<String>,
    #[serde(default)]
    pub help_url: Option<String>,
    #[serde(default)]
    pub nodes: Vec<ViolationNode>,
}

pub fn violation_finding(tool: &str, route: &str, violation: &ScannerViolation) -> Finding {
    let mut finding = Finding::new(
        tool,
        severity_for_impact(violation.impact),
        format!("A11y: {}", violation.id),
        violation.help.clone().unwrap_or_default(),
    )
    .with_route(route)
    .with_tags(["accessibility", "wcag"]);

    if let Some(url) = &violation.help_url {
        finding = finding.with_docs_url(url.clone());
    }
    if let Some(summary) = violation
        .nodes
        .first()
        .and_then(|n| n.failure_summary.clone())
    {
        finding = finding.with_suggestion(summary);
    }
    finding
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// How a tool invocation ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolStatus {
    Completed,
    Skipped { reason: String },
    Failed { reason: String },
}

/// Per-tool outcome handed to the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool: String,
    pub status: ToolStatus,
    pub findings: Vec<Finding>,
    pub artifacts: Vec<PathBuf>,
    /// Markdown section for the status comment.
    pub summary: String,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn failed(&self) -> bool {
        matches!(self.status, ToolStatus::Failed { .. })
    }
}

/// The aggregated outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateVerdict {
    pub findings: Vec<Finding>,
    pub pass: bool,
    pub blocking: usize,
    pub failed_tools: Vec<String>,
    pub tools_run: usize,
}

impl GateVerdict {
    /// True when tools were selected but none produced a result.
    pub fn run_failed(&self) -> bool {
        self.tools_run > 0 && self.failed_tools.len() == self.tools_run
    }

    pub fn message(&self) -> String {
        if self.pass {
            format!("Gate passed with {} finding(s)", self.findings.len())
        } else {
            format!(
                "Gate failed: {} blocking finding(s) of {}",
                self.blocking,
                self.findings.len()
            )
        }
    }
}

/// Merge per-tool results, in order, and decide pass/fail.
pub fn aggregate(results: &[ToolResult]) -> GateVerdict {
    let findings: Vec<Finding> = results
        .iter()
        .flat_map(|r| r.findings.iter().cloned())
        .collect();
    let blocking = findings.iter().filter(|f| f.severity.is_blocking()).count();
    let failed_tools = results
        .iter()
        .filter(|r| r.failed())
        .map(|r| r.tool.clone())
        .collect();

    GateVerdict {
        pass: blocking == 0,
        blocking,
        findings,
        failed_tools,
        tools_run: results.len(),
    }
}
