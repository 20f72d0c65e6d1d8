//! Per-tool configuration layering.

use serde_json::{Map, Value};

/// Merge tool config layers. Keys are replaced whole, never deep-merged;
/// precedence is `run_override` > `persisted` > `defaults`.
pub fn merge_layers(
    defaults: &Map<String, Value>,
    persisted: Option<&Map<String, Value>>,
    run_override: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for layer in [persisted, run_override].into_iter().flatten() {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
