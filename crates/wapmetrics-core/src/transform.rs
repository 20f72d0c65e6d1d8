//! Normalized config -> Lighthouse CI configuration.
//!
//! Produces the native `ci.collect` / `ci.assert` / `ci.upload` shape.
//! The assert section is omitted entirely when no route has a threshold:
//! LHCI treats an empty assertion set as a fatal misconfiguration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::budget::{BudgetResolution, ResolvedThresholds};
use crate::domain::config::NormalizedConfig;
use crate::report::{url_path, UrlMatch};

/// Placeholder substituted with the base URL inside route strings.
pub const BASE_URL_PLACEHOLDER: &str = "$BASE_URL";

/// Origin routes are resolved against when LHCI serves `staticDistDir`
/// itself. LHCI rewrites localhost URLs to the port it picked.
pub const STATIC_ORIGIN: &str = "http://localhost";

/// Assertion severity in LHCI's vocabulary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssertionLevel {
    Off,
    #[default]
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NumericAssertion {
    pub max_numeric_value: f64,
}

/// Serialized as `["warn", { "maxNumericValue": 2500 }]`.
pub type Assertion = (AssertionLevel, NumericAssertion);

pub type AssertionMap = BTreeMap<String, Assertion>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectSettings {
    pub preset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectSection {
    pub url: Vec<String>,
    pub number_of_runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dist_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<CollectSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssertMatrixEntry {
    pub matching_url_pattern: String,
    pub assertions: AssertionMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssertSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertions: Option<AssertionMap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assert_matrix: Vec<AssertMatrixEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSection {
    pub target: String,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LhciSection {
    pub collect: CollectSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<AssertSection>,
    pub upload: UploadSection,
}

/// Root of a `lighthouserc.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LighthouseRc {
    pub ci: LhciSection,
}

impl LighthouseRc {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Flat assertions, when present.
    pub fn assertions(&self) -> Option<&AssertionMap> {
        self.ci.assert.as_ref().and_then(|a| a.assertions.as_ref())
    }
}

/// Caller-controlled transform inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOptions {
    /// Where the audit tool must write its reports.
    pub output_dir: PathBuf,
    pub level: AssertionLevel,
    /// Replaces `settings.baseUrl` (preview or local server URL).
    pub base_url: Option<String>,
    pub static_dist_dir: Option<String>,
}

impl TransformOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            level: AssertionLevel::Warn,
            base_url: None,
            static_dist_dir: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_static_dist_dir(mut self, dir: impl Into<String>) -> Self {
        self.static_dist_dir = Some(dir.into());
        self
    }

    pub fn with_level(mut self, level: AssertionLevel) -> Self {
        self.level = level;
        self
    }

    /// Static dir without an explicit base URL: LHCI picks the origin.
    pub fn serves_static(&self) -> bool {
        self.base_url.is_none() && self.static_dist_dir.is_some()
    }

    /// How reports produced under these options map back to routes.
    pub fn url_match(&self) -> UrlMatch {
        if self.serves_static() {
            UrlMatch::Path
        } else {
            UrlMatch::Exact
        }
    }
}

/// URLs LHCI is asked to collect, in route order.
pub fn collect_urls(config: &NormalizedConfig, options: &TransformOptions) -> Vec<String> {
    if options.serves_static() {
        resolve_urls(config, Some(STATIC_ORIGIN))
    } else {
        resolve_urls(config, options.base_url.as_deref())
    }
}

/// Resolve a route against `base_url`.
///
/// Absolute URLs pass through; `$BASE_URL` is substituted; anything else is
/// joined with exactly one `/`.
pub fn resolve_url(base_url: &str, route: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if route.starts_with("http://") || route.starts_with("https://") {
        route.to_string()
    } else if route.contains(BASE_URL_PLACEHOLDER) {
        route.replace(BASE_URL_PLACEHOLDER, base)
    } else {
        format!("{}/{}", base, route.trim_start_matches('/'))
    }
}

/// Absolute URLs for every configured route, in config order.
pub fn resolve_urls(config: &NormalizedConfig, base_url: Option<&str>) -> Vec<String> {
    let base = base_url.unwrap_or(&config.settings.base_url);
    config
        .routes
        .iter()
        .map(|route| resolve_url(base, route.path()))
        .collect()
}

fn assertion_map(thresholds: &ResolvedThresholds, level: AssertionLevel) -> AssertionMap {
    thresholds
        .iter()
        .map(|(metric, ceiling)| {
            (
                metric.to_string(),
                (level, NumericAssertion { max_numeric_value: ceiling }),
            )
        })
        .collect()
}

fn build_assert_section(
    config: &NormalizedConfig,
    urls: &[String],
    resolution: &BudgetResolution,
    level: AssertionLevel,
    url_match: UrlMatch,
) -> Option<AssertSection> {
    if resolution.is_unconstrained() {
        return None;
    }

    if resolution.is_uniform() {
        let thresholds = resolution.routes.values().next()?;
        return Some(AssertSection {
            assertions: Some(assertion_map(thresholds, level)),
            assert_matrix: Vec::new(),
        });
    }

    let assert_matrix = config
        .routes
        .iter()
        .zip(urls)
        .filter_map(|(route, url)| {
            let thresholds = resolution.for_route(route.path())?;
            if thresholds.is_empty() {
                return None;
            }
            Some(AssertMatrixEntry {
                matching_url_pattern: match url_match {
                    UrlMatch::Exact => format!("^{}$", regex::escape(url)),
                    UrlMatch::Path => format!("^https?://[^/]+{}$", regex::escape(&url_path(url))),
                },
                assertions: assertion_map(thresholds, level),
            })
        })
        .collect();

    Some(AssertSection {
        assertions: None,
        assert_matrix,
    })
}

/// Transform `config` plus resolved thresholds into an LHCI config.
pub fn transform(
    config: &NormalizedConfig,
    resolution: &BudgetResolution,
    options: &TransformOptions,
) -> LighthouseRc {
    let urls = collect_urls(config, options);
    let assert = build_assert_section(config, &urls, resolution, options.level, options.url_match());

    LighthouseRc {
        ci: LhciSection {
            collect: CollectSection {
                url: urls,
                number_of_runs: config.settings.number_of_runs(),
                static_dist_dir: options.static_dist_dir.clone(),
                settings: config
                    .settings
                    .preset
                    .clone()
                    .map(|preset| CollectSettings { preset }),
            },
            assert,
            upload: UploadSection {
                target: "filesystem".to_string(),
                output_dir: options.output_dir.clone(),
            },
        },
    }
}
