//! End-to-end properties of config -> thresholds -> tool config -> gate.

use std::collections::BTreeMap;

use wapmetrics_core::report::{Audit, LCP};
use wapmetrics_core::{
    aggregate, aggregate_route, budget_findings, parse_config, resolve, transform, AssertionLevel,
    Finding, LighthouseReport, MetricValue, Severity, ToolResult, ToolStatus, TransformOptions,
};

fn lhr(url: &str, lcp: f64) -> LighthouseReport {
    let mut audits = BTreeMap::new();
    audits.insert(
        LCP.to_string(),
        Audit {
            numeric_value: Some(lcp),
        },
    );
    LighthouseReport {
        requested_url: Some(url.to_string()),
        final_url: Some(url.to_string()),
        audits,
    }
}

fn completed(tool: &str, findings: Vec<Finding>) -> ToolResult {
    ToolResult {
        tool: tool.to_string(),
        status: ToolStatus::Completed,
        findings,
        artifacts: Vec::new(),
        summary: String::new(),
        duration_ms: 10,
    }
}

/// Scenario A: two routes, one global LCP budget.
#[test]
fn test_global_budget_two_routes() {
    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "budgets": { "global": { "timings": { "largest-contentful-paint": 2500 } } },
            "routes": ["/", "/pricing"]
        }"#,
    )
    .expect("valid config");

    let rc = transform(&config, &resolve(&config), &TransformOptions::new(".wapmetrics/lhci"));

    assert_eq!(
        rc.ci.collect.url,
        vec!["https://x.test/".to_string(), "https://x.test/pricing".to_string()]
    );
    let assertions = rc.assertions().expect("assertions present");
    assert_eq!(assertions.len(), 1);
    let (level, value) = assertions["largest-contentful-paint"];
    assert_eq!(level, AssertionLevel::Warn);
    assert_eq!(value.max_numeric_value, 2500.0);
}

/// Scenario B: no budgets anywhere -> collect only, no assert section.
#[test]
fn test_no_budgets_omits_assert_section() {
    let config = parse_config(
        r#"{ "settings": { "baseUrl": "https://x.test" }, "routes": ["/", "/about"] }"#,
    )
    .unwrap();
    let rc = transform(&config, &resolve(&config), &TransformOptions::new("out"));

    assert_eq!(rc.ci.collect.url.len(), 2);
    assert!(rc.ci.assert.is_none());
    let value = serde_json::to_value(&rc).unwrap();
    assert!(value["ci"].get("assert").is_none());
    assert!(value["ci"].get("collect").is_some());
}

/// Route budget wins over global for the same metric.
#[test]
fn test_named_budget_overlays_global() {
    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "budgets": {
                "global": { "timings": { "largest-contentful-paint": 2500, "total-blocking-time": 300 } },
                "checkout": { "timings": { "largest-contentful-paint": 1500 } }
            },
            "routes": [{ "path": "/checkout", "budget": "checkout" }]
        }"#,
    )
    .unwrap();
    let resolution = resolve(&config);
    let thresholds = resolution.for_route("/checkout").unwrap();
    assert_eq!(thresholds.get("largest-contentful-paint"), Some(1500.0));
    assert_eq!(thresholds.get("total-blocking-time"), Some(300.0));
    assert!(resolution.warnings.is_empty());
}

/// Missing named budget: warning, no panic, route unconstrained.
#[test]
fn test_missing_budget_is_warning_and_unconstrained() {
    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "routes": [{ "path": "/", "budget": "ghost" }]
        }"#,
    )
    .unwrap();
    let resolution = resolve(&config);
    assert_eq!(resolution.warnings.len(), 1);
    assert!(resolution.warnings[0].to_string().contains("ghost"));

    let thresholds = resolution.for_route("/").unwrap();
    let metrics = aggregate_route("https://x.test/", &[lhr("https://x.test/", 99_999.0)], [LCP]);
    let findings = budget_findings("lhci", "/", &metrics, thresholds);
    assert!(findings.is_empty());
    assert!(aggregate(&[completed("lhci", findings)]).pass);
}

/// Best-of-three passes even though two samples exceed the threshold.
#[test]
fn test_best_of_n_aggregation_passes() {
    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "budgets": { "global": { "timings": { "largest-contentful-paint": 1000 } } },
            "routes": ["/"]
        }"#,
    )
    .unwrap();
    let resolution = resolve(&config);
    let url = "https://x.test/";
    let samples = vec![lhr(url, 1200.0), lhr(url, 900.0), lhr(url, 1500.0)];
    let metrics = aggregate_route(url, &samples, [LCP]);
    assert_eq!(metrics.get(LCP), MetricValue::Measured(900.0));

    let findings = budget_findings("lhci", "/", &metrics, resolution.for_route("/").unwrap());
    assert!(findings.is_empty());
    assert!(aggregate(&[completed("lhci", findings)]).pass);
}

/// A value equal to its threshold passes; one unit over fails.
#[test]
fn test_threshold_boundary() {
    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "budgets": { "global": { "timings": { "largest-contentful-paint": 1000 } } },
            "routes": ["/"]
        }"#,
    )
    .unwrap();
    let resolution = resolve(&config);
    let thresholds = resolution.for_route("/").unwrap();
    let url = "https://x.test/";

    let at = aggregate_route(url, &[lhr(url, 1000.0)], [LCP]);
    assert!(budget_findings("lhci", "/", &at, thresholds).is_empty());

    let over = aggregate_route(url, &[lhr(url, 1001.0)], [LCP]);
    let findings = budget_findings("lhci", "/", &over, thresholds);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, Severity::High);
    assert!(!aggregate(&[completed("lhci", findings)]).pass);
}

/// Scenario C: one high finding fails the gate; removing it passes.
#[test]
fn test_single_high_finding_flips_gate() {
    let high = Finding::new("lhci", Severity::High, "LCP over budget", "LCP 3.00s > 2.50s")
        .with_route("/");
    let failing = aggregate(&[completed("lhci", vec![high]), completed("axe", vec![])]);
    assert!(!failing.pass);

    let passing = aggregate(&[completed("lhci", vec![]), completed("axe", vec![])]);
    assert!(passing.pass);
}

/// Identical issues across repeated inputs share an id.
#[test]
fn test_finding_ids_are_stable_across_runs() {
    let url = "https://x.test/";
    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "budgets": { "global": { "timings": { "largest-contentful-paint": 100 } } },
            "routes": ["/"]
        }"#,
    )
    .unwrap();
    let resolution = resolve(&config);
    let run = || {
        let metrics = aggregate_route(url, &[lhr(url, 500.0)], [LCP]);
        budget_findings("lhci", "/", &metrics, resolution.for_route("/").unwrap())
    };
    assert_eq!(run()[0].id, run()[0].id);
}
