//! Built-in measurement tool adapters.

pub mod axe;
pub mod lighthouse;

pub use axe::{AxeTool, AXE_TOOL};
pub use lighthouse::{LighthouseTool, LHCI_TOOL};

use wapmetrics_core::{Finding, Severity};

/// Markdown table cell: pipes escaped, newlines flattened.
pub(crate) fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// `Route | Issue | Detail | Severity` rows for `findings`.
pub(crate) fn findings_table(findings: &[Finding]) -> String {
    let mut lines = vec![
        "| Route | Issue | Detail | Severity |".to_string(),
        "| --- | --- | --- | --- |".to_string(),
    ];
    lines.extend(findings.iter().map(|f| {
        format!(
            "| {} | {} | {} | {} |",
            cell(f.route.as_deref().unwrap_or("-")),
            cell(&f.title),
            cell(&f.message),
            severity_badge(f.severity)
        )
    }));
    lines.join("\n")
}

fn severity_badge(severity: Severity) -> String {
    if severity.is_blocking() {
        format!("**{}**", severity)
    } else {
        severity.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_escapes_pipes() {
        assert_eq!(cell("a|b\nc"), "a\\|b c");
    }

    #[test]
    fn test_findings_table_rows() {
        let findings = vec![
            Finding::new("lhci", Severity::High, "LCP over budget", "LCP 2.60s > 2.50s")
                .with_route("/"),
            Finding::new("axe", Severity::Medium, "A11y: region", "Landmarks"),
        ];
        let table = findings_table(&findings);
        assert!(table.contains("| / | LCP over budget | LCP 2.60s > 2.50s | **high** |"));
        assert!(table.contains("| - | A11y: region | Landmarks | medium |"));
    }
}
