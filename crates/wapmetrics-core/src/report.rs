//! Lighthouse report parsing and multi-run aggregation.
//!
//! Headless measurements are noisy in one direction only (system jitter
//! inflates timings), so every tracked metric is reduced to the minimum
//! observed across the N samples of a route.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::error::Result;

pub const LCP: &str = "largest-contentful-paint";
pub const CLS: &str = "cumulative-layout-shift";
pub const INP: &str = "interaction-to-next-paint";
pub const TBT: &str = "total-blocking-time";
pub const FCP: &str = "first-contentful-paint";

/// Metrics always summarized, in addition to any budgeted metric.
pub const CORE_METRICS: [&str; 5] = [LCP, CLS, INP, TBT, FCP];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    #[serde(default)]
    pub numeric_value: Option<f64>,
}

/// The subset of a Lighthouse result this crate reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LighthouseReport {
    #[serde(default)]
    pub requested_url: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    pub audits: BTreeMap<String, Audit>,
}

impl LighthouseReport {
    /// URL the sample belongs to. Prefers the requested URL so redirects
    /// group with the route that was asked for.
    pub fn url(&self) -> Option<&str> {
        self.requested_url.as_deref().or(self.final_url.as_deref())
    }

    pub fn metric(&self, metric: &str) -> Option<f64> {
        self.audits
            .get(metric)
            .and_then(|a| a.numeric_value)
            .filter(|v| v.is_finite())
    }
}

/// Aggregated value of one metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Measured(f64),
    Unmeasured,
}

impl MetricValue {
    pub fn measured(&self) -> Option<f64> {
        match self {
            MetricValue::Measured(v) => Some(*v),
            MetricValue::Unmeasured => None,
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Measured(v) => write!(f, "{}", v),
            MetricValue::Unmeasured => write!(f, "unmeasured"),
        }
    }
}

/// Best-of-N reduction. Absent samples are skipped; all-absent is
/// `Unmeasured`, never zero.
pub fn aggregate_samples<I>(samples: I) -> MetricValue
where
    I: IntoIterator<Item = Option<f64>>,
{
    samples
        .into_iter()
        .flatten()
        .filter(|v| v.is_finite())
        .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.min(v))))
        .map_or(MetricValue::Unmeasured, MetricValue::Measured)
}

/// Aggregated metrics for one URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteMetrics {
    pub url: String,
    pub samples: usize,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl RouteMetrics {
    pub fn get(&self, metric: &str) -> MetricValue {
        self.metrics
            .get(metric)
            .copied()
            .unwrap_or(MetricValue::Unmeasured)
    }
}

/// Aggregate the samples of one URL over `metrics`.
pub fn aggregate_route<'a, M>(url: &str, reports: &[LighthouseReport], metrics: M) -> RouteMetrics
where
    M: IntoIterator<Item = &'a str>,
{
    let metrics = metrics
        .into_iter()
        .map(|metric| {
            let value = aggregate_samples(reports.iter().map(|r| r.metric(metric)));
            (metric.to_string(), value)
        })
        .collect();
    RouteMetrics {
        url: url.to_string(),
        samples: reports.len(),
        metrics,
    }
}

/// Parse one report file. Returns `None` for JSON that is not a
/// Lighthouse result (e.g. LHCI's own `manifest.json`).
pub fn parse_report_file(path: &Path) -> Result<Option<LighthouseReport>> {
    let raw = std::fs::read_to_string(path)?;
    let value: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Skipping unparseable report");
            return Ok(None);
        }
    };
    if !value.get("audits").map(Value::is_object).unwrap_or(false) {
        debug!(path = %path.display(), "Skipping non-Lighthouse JSON");
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}

/// Canonical form of an absolute URL for report lookup.
///
/// Lighthouse echoes `requestedUrl` the way the browser parsed it: scheme
/// and host lowercased, default ports dropped, an empty path written as
/// `/`. Strings without a scheme are returned trimmed.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let scheme = scheme.to_ascii_lowercase();
    let split = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(split);

    let mut authority = authority.to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" => Some(":80"),
        "https" => Some(":443"),
        _ => None,
    };
    if let Some(port) = default_port {
        if authority.ends_with(port) {
            authority.truncate(authority.len() - port.len());
        }
    }

    let tail = if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{}", tail)
    };
    format!("{}://{}{}", scheme, authority, tail)
}

/// Path (with query) of an absolute URL, after normalization.
pub fn url_path(url: &str) -> String {
    let normalized = normalize_url(url);
    match normalized.split_once("://") {
        Some((_, rest)) => match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        },
        None if normalized.starts_with('/') => normalized,
        None => format!("/{}", normalized),
    }
}

/// How reports are matched to configured routes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UrlMatch {
    /// Normalized absolute URL.
    #[default]
    Exact,
    /// URL path only. Used when LHCI serves a static directory on an
    /// ephemeral localhost port.
    Path,
}

impl UrlMatch {
    pub fn key(&self, url: &str) -> String {
        match self {
            UrlMatch::Exact => normalize_url(url),
            UrlMatch::Path => url_path(url),
        }
    }
}

/// Re-group collected reports under `mode`'s key.
pub fn rekey_reports(
    grouped: BTreeMap<String, Vec<LighthouseReport>>,
    mode: UrlMatch,
) -> BTreeMap<String, Vec<LighthouseReport>> {
    let mut rekeyed: BTreeMap<String, Vec<LighthouseReport>> = BTreeMap::new();
    for (url, reports) in grouped {
        rekeyed.entry(mode.key(&url)).or_default().extend(reports);
    }
    rekeyed
}

/// Read every Lighthouse report in `dir`, grouped by normalized URL.
pub fn collect_reports(dir: &Path) -> Result<BTreeMap<String, Vec<LighthouseReport>>> {
    let mut grouped: BTreeMap<String, Vec<LighthouseReport>> = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(grouped);
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        if let Some(report) = parse_report_file(&path)? {
            if let Some(url) = report.url().map(normalize_url) {
                grouped.entry(url).or_default().push(report);
            }
        }
    }
    Ok(grouped)
}

/// One row of `lhci-summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tbt: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportSummary {
    pub summaries: Vec<SummaryItem>,
}

impl ReportSummary {
    pub fn from_routes(routes: &[RouteMetrics]) -> Self {
        Self {
            summaries: routes
                .iter()
                .map(|r| SummaryItem {
                    url: r.url.clone(),
                    lcp: r.get(LCP).measured(),
                    cls: r.get(CLS).measured(),
                    inp: r.get(INP).measured(),
                    tbt: r.get(TBT).measured(),
                })
                .collect(),
        }
    }
}
