//! Structured observability hooks for the run lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span via [`run_span`]
//! - Emission functions for lifecycle events: run start/finish, phase
//!   transitions, per-tool start/finish/failure, budget warnings, gate
//!
//! Events are emitted at `info!` level except failures and warnings.

use tracing::{info, warn};

/// Span tagged with the run id. Attach it to the run future with
/// `tracing::Instrument` so every event below carries `run_id`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("wapmetrics.run", run_id = %run_id)
}

/// Emit event: run started with the selected tools.
pub fn emit_run_started(run_id: &str, tools: &[String]) {
    info!(event = "run.started", run_id = %run_id, tools = ?tools);
}

/// Emit event: state machine transition.
pub fn emit_phase(run_id: &str, phase: &str) {
    info!(event = "run.phase", run_id = %run_id, phase = %phase);
}

pub fn emit_tool_started(tool: &str, version: &str) {
    info!(event = "tool.started", tool = %tool, version = %version);
}

pub fn emit_tool_finished(tool: &str, findings: usize, duration_ms: u64) {
    info!(
        event = "tool.finished",
        tool = %tool,
        findings = findings,
        duration_ms = duration_ms,
    );
}

pub fn emit_tool_failed(tool: &str, error: &dyn std::fmt::Display) {
    warn!(event = "tool.failed", tool = %tool, error = %error);
}

/// Emit event: a route references a budget that does not exist.
pub fn emit_budget_unresolved(route: &str, budget: &str) {
    warn!(event = "budget.unresolved", route = %route, budget = %budget);
}

/// Emit event: gate evaluation completed.
pub fn emit_gate_evaluated(run_id: &str, findings: usize, blocking: usize, passed: bool) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        findings = findings,
        blocking = blocking,
        passed = passed,
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, passed: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        passed = passed,
    );
}
