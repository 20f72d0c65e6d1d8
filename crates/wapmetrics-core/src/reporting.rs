//! Status comment rendering.
//!
//! The comment body is a header with the gate status followed by one
//! Markdown section per tool, in run order. Sinks identify the comment by
//! [`STICKY_MARKER`], which is prepended on its own line.

use crate::domain::finding::Finding;
use crate::gate::{GateVerdict, ToolResult, ToolStatus};

/// Hidden marker identifying the single status comment on a PR.
pub const STICKY_MARKER: &str = "<!-- wapmetrics-sticky -->";

/// Check-run / comment title.
pub const REPORT_TITLE: &str = "Web Quality";

/// One-line section used when a tool has no summarize hook.
pub fn fallback_section(tool: &str, findings: &[Finding]) -> String {
    format!("### {}\n\n_{} findings_", tool, findings.len())
}

pub fn failure_section(tool: &str, reason: &str) -> String {
    format!("### {}\n\n**Tool failed:** {}", tool, reason.trim())
}

pub fn skipped_section(tool: &str, reason: &str) -> String {
    format!("### {}\n\n_Skipped: {}_", tool, reason.trim())
}

/// Section for a tool result, whatever its status.
pub fn section_for(result: &ToolResult) -> String {
    match &result.status {
        ToolStatus::Completed if !result.summary.trim().is_empty() => {
            result.summary.trim().to_string()
        }
        ToolStatus::Completed => fallback_section(&result.tool, &result.findings),
        ToolStatus::Skipped { reason } => skipped_section(&result.tool, reason),
        ToolStatus::Failed { reason } => failure_section(&result.tool, reason),
    }
}

/// Render the status body (without marker).
pub fn render_status(verdict: &GateVerdict, results: &[ToolResult], warnings: &[String]) -> String {
    let status = if verdict.pass { "Passing" } else { "Failing" };
    let mut parts = vec![format!("## {}\n**Status:** {}", REPORT_TITLE, status)];

    if !warnings.is_empty() {
        let list = warnings
            .iter()
            .map(|w| format!("- {}", w))
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(format!("**Warnings:**\n{}", list));
    }

    parts.extend(results.iter().map(section_for));
    parts.join("\n\n")
}

/// Prepend the sticky marker.
pub fn with_marker(marker: &str, body: &str) -> String {
    format!("{}\n{}", marker, body.trim())
}
