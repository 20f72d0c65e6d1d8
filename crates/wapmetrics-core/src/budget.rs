//! Budget resolution: one numeric ceiling set per route.
//!
//! Per metric, precedence is route budget > run-level override > `global`.
//! Metrics absent from every layer are unconstrained. A route naming a
//! budget that does not exist yields a [`BudgetWarning`] and keeps only the
//! lower layers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::config::NormalizedConfig;
use crate::obs::emit_budget_unresolved;

/// Metric ceilings for one route.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ResolvedThresholds(BTreeMap<String, f64>);

impl ResolvedThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    /// Overlay `timings`; incoming values win.
    pub fn overlay<'a, I>(&mut self, timings: I)
    where
        I: IntoIterator<Item = (&'a String, &'a f64)>,
    {
        for (metric, value) in timings {
            self.0.insert(metric.clone(), *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ResolvedThresholds {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Non-fatal problems found while resolving budgets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetWarning {
    UnresolvedBudgetReference { route: String, budget: String },
}

impl std::fmt::Display for BudgetWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetWarning::UnresolvedBudgetReference { route, budget } => write!(
                f,
                "route '{}' references unknown budget '{}'; using global thresholds only",
                route, budget
            ),
        }
    }
}

/// Resolved thresholds keyed by route path, plus warnings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BudgetResolution {
    pub routes: BTreeMap<String, ResolvedThresholds>,
    pub warnings: Vec<BudgetWarning>,
}

impl BudgetResolution {
    pub fn for_route(&self, path: &str) -> Option<&ResolvedThresholds> {
        self.routes.get(path)
    }

    /// True when no route has any ceiling.
    pub fn is_unconstrained(&self) -> bool {
        self.routes.values().all(ResolvedThresholds::is_empty)
    }

    /// True when every route carries the same ceilings.
    pub fn is_uniform(&self) -> bool {
        let mut iter = self.routes.values();
        match iter.next() {
            Some(first) => iter.all(|t| t == first),
            None => true,
        }
    }
}

/// Resolve per-route thresholds from the config alone.
pub fn resolve(config: &NormalizedConfig) -> BudgetResolution {
    resolve_with_overrides(config, &BTreeMap::new())
}

/// Resolve per-route thresholds with a run-level override layered over
/// the `global` budget.
pub fn resolve_with_overrides(
    config: &NormalizedConfig,
    overrides: &BTreeMap<String, f64>,
) -> BudgetResolution {
    let mut base = ResolvedThresholds::new();
    if let Some(global) = config.global_budget() {
        base.overlay(&global.timings);
    }
    base.overlay(overrides);

    let mut resolution = BudgetResolution::default();
    for route in &config.routes {
        let mut thresholds = base.clone();
        if let Some(name) = route.budget() {
            match config.budgets.get(name) {
                Some(budget) => thresholds.overlay(&budget.timings),
                None => {
                    emit_budget_unresolved(route.path(), name);
                    resolution.warnings.push(BudgetWarning::UnresolvedBudgetReference {
                        route: route.path().to_string(),
                        budget: name.to_string(),
                    });
                }
            }
        }
        resolution.routes.insert(route.path().to_string(), thresholds);
    }
    resolution
}
