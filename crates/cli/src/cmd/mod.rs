mod build;
mod features;
mod mounts;
mod phases;

use std::path::Path;

use anyhow::{Context, Result};

use layerforge_lib::build::{LayerPlan, plan_layer};
use layerforge_lib::collect::JsonFileResolver;
use layerforge_lib::layer::LayerDefinition;

pub use build::cmd_build;
pub use features::cmd_features;
pub use mounts::cmd_mounts;
pub use phases::cmd_phases;

/// Load a definition and compose it, expanding feature sets from disk.
fn load_plan(definition: &Path) -> Result<LayerPlan> {
  let definition = LayerDefinition::load(definition)
    .with_context(|| format!("Failed to load layer definition: {}", definition.display()))?;
  let resolver = JsonFileResolver::new(&definition.base_dir);
  let label = definition.label.clone();
  let spec = definition
    .into_spec()
    .with_context(|| format!("Failed to load parent of {label}"))?;

  plan_layer(spec, Some(&resolver)).with_context(|| format!("Failed to compose {label}"))
}
