//! Domain model for WAPMetrics.
//!
//! Holds the user-facing configuration schema, the uniform finding model
//! and the error taxonomy used across the workspace.

pub mod config;
pub mod error;
pub mod finding;

pub use config::{
    load_config, parse_config, Budget, NormalizedConfig, PluginEntry, ProjectSettings,
    ResourceBudget, RouteConfig, RuntimeConfig, StartConfig, DEFAULT_NUMBER_OF_RUNS,
    GLOBAL_BUDGET,
};
pub use error::{Result, WapmError};
pub use finding::{fingerprint, Finding, Severity};
