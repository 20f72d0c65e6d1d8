//! WAPMetrics Core Library
//!
//! Turns one user-facing route/budget config into measurement-tool
//! configuration, reduces noisy repeated measurements, converts breaches
//! and scanner violations into findings and decides pass/fail.

pub mod budget;
pub mod domain;
pub mod gate;
pub mod manifest;
pub mod obs;
pub mod report;
pub mod reporting;
pub mod telemetry;
pub mod transform;

pub use budget::{resolve, resolve_with_overrides, BudgetResolution, BudgetWarning, ResolvedThresholds};

pub use domain::{
    fingerprint, load_config, parse_config, Budget, Finding, NormalizedConfig, PluginEntry,
    ProjectSettings, ResourceBudget, Result, RouteConfig, RuntimeConfig, Severity, StartConfig,
    WapmError, DEFAULT_NUMBER_OF_RUNS, GLOBAL_BUDGET,
};

pub use gate::{
    aggregate, budget_findings, severity_for_impact, violation_finding, GateVerdict,
    ScannerImpact, ScannerViolation, ToolResult, ToolStatus,
};
pub use manifest::{Manifest, ManifestBuilder, Provenance, MANIFEST_VERSION};
pub use report::{
    aggregate_route, aggregate_samples, collect_reports, normalize_url, rekey_reports, url_path,
    LighthouseReport, MetricValue, ReportSummary, RouteMetrics, UrlMatch,
};
pub use reporting::{render_status, with_marker, REPORT_TITLE, STICKY_MARKER};
pub use transform::{
    collect_urls, resolve_url, resolve_urls, transform, AssertionLevel, LighthouseRc,
    TransformOptions, STATIC_ORIGIN,
};

pub use obs::{
    emit_gate_evaluated, emit_phase, emit_run_finished, emit_run_started, emit_tool_failed,
    emit_tool_finished, emit_tool_started, run_span,
};
pub use telemetry::init_tracing;

/// WAPMetrics version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
