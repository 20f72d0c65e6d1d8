//! Error taxonomy for WAPMetrics runs.

use std::path::PathBuf;

/// Errors produced while loading configuration or driving a run.
#[derive(Debug, thiserror::Error)]
pub enum WapmError {
    #[error("configuration file not found at {}", path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("duplicate tool registration: {0}")]
    DuplicateTool(String),

    #[error("local server did not become ready within {timeout_ms}ms")]
    ServerStartTimeout { timeout_ms: u64 },

    #[error("local server failed to start: {0}")]
    ServerStartFailed(String),

    #[error("tool '{tool}' failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    #[error("run cancelled: {0}")]
    RunCancelled(String),

    #[error("manifest already written at {}", .0.display())]
    ManifestExists(PathBuf),

    #[error("reporting sink error: {0}")]
    Sink(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WapmError {
    /// Whether this error must stop the run before any tool executes.
    pub fn is_fatal_before_tools(&self) -> bool {
        matches!(
            self,
            WapmError::ConfigNotFound { .. }
                | WapmError::ConfigInvalid(_)
                | WapmError::UnknownTool(_)
                | WapmError::DuplicateTool(_)
        )
    }
}

/// Result type for WAPMetrics operations.
pub type Result<T> = std::result::Result<T, WapmError>;
