//! Name -> tool factory registry.
//!
//! Tools are constructed only when a run selects them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use wapmetrics_core::{Result, WapmError};

use crate::adapters::{AxeTool, LighthouseTool, AXE_TOOL, LHCI_TOOL};
use crate::plugin::MeasurementTool;

/// Builds a fresh tool instance.
pub type ToolFactory = Arc<dyn Fn() -> Arc<dyn MeasurementTool> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ToolRegistry {
    factories: BTreeMap<String, ToolFactory>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Lighthouse CI and axe adapters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Names are distinct constants; registration cannot collide.
        let _ = registry.register(LHCI_TOOL, || Arc::new(LighthouseTool));
        let _ = registry.register(AXE_TOOL, || Arc::new(AxeTool));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn MeasurementTool> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(WapmError::DuplicateTool(name));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Construct the tool registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn MeasurementTool>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| WapmError::UnknownTool(name.to_string()))
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
