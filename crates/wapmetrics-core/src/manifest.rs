//! Versioned, portable description of a run.
//!
//! The manifest carries enough of the normalized configuration (routes,
//! budgets, resolved thresholds, base URL, run count) to explain every
//! applied threshold without the original config file.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetResolution, ResolvedThresholds};
use crate::domain::config::{Budget, NormalizedConfig};
use crate::domain::error::{Result, WapmError};
use crate::transform::resolve_urls;

pub const MANIFEST_VERSION: u32 = 1;

/// Preset recorded when the config does not name one.
pub const DEFAULT_PRESET: &str = "mobile";

/// Who and what a run measured.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEnv {
    pub preset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    #[serde(flatten)]
    pub provenance: Provenance,
    /// Absolute URLs measured, in config order.
    pub routes: Vec<String>,
    pub base_url: String,
    pub number_of_runs: u32,
    pub budgets: BTreeMap<String, Budget>,
    /// Effective ceilings per route path.
    pub thresholds: BTreeMap<String, ResolvedThresholds>,
    pub tools: Vec<String>,
    pub collectors: BTreeMap<String, bool>,
    pub env: ManifestEnv,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// Persist with create-new semantics; a manifest is written once.
    pub fn write_once(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    WapmError::ManifestExists(path.to_path_buf())
                } else {
                    WapmError::Io(e)
                }
            })?;
        let json = serde_json::to_string_pretty(self)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&raw)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(WapmError::ConfigInvalid(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}

/// Builds a [`Manifest`] from config, resolved budgets and provenance.
pub struct ManifestBuilder<'a> {
    config: &'a NormalizedConfig,
    resolution: &'a BudgetResolution,
    provenance: Provenance,
    base_url: Option<String>,
    tools: Vec<String>,
    created_at: Option<DateTime<Utc>>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(config: &'a NormalizedConfig, resolution: &'a BudgetResolution) -> Self {
        Self {
            config,
            resolution,
            provenance: Provenance::default(),
            base_url: None,
            tools: Vec::new(),
            created_at: None,
        }
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Effective base URL when the target replaced `settings.baseUrl`.
    pub fn base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Pin the timestamp; otherwise `Utc::now()` at build time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn build(self) -> Manifest {
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| self.config.settings.base_url.clone());
        Manifest {
            version: MANIFEST_VERSION,
            provenance: self.provenance,
            routes: resolve_urls(self.config, Some(&base_url)),
            base_url,
            number_of_runs: self.config.settings.number_of_runs(),
            budgets: self.config.budgets.clone(),
            thresholds: self.resolution.routes.clone(),
            collectors: self.tools.iter().map(|t| (t.clone(), true)).collect(),
            tools: self.tools,
            env: ManifestEnv {
                preset: self
                    .config
                    .settings
                    .preset
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PRESET.to_string()),
            },
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}
