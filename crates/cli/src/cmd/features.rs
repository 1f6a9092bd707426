use std::path::Path;

use anyhow::Result;

use layerforge_lib::feature::Feature;

use crate::output::{OutputFormat, print_info, print_json};

pub fn cmd_features(definition: &Path, format: OutputFormat) -> Result<()> {
  let plan = super::load_plan(definition)?;
  let features: Vec<&Feature> = plan.phases.iter().flat_map(|set| set.features.iter()).collect();

  if format.is_json() {
    return print_json(&features);
  }

  print_info(&format!("{}: {} unique feature(s)", plan.label, features.len()));
  for feature in features {
    println!("  {:<16} {}", feature.kind(), feature.label);
  }
  Ok(())
}
