//! Phases command implementation.
//!
//! Prints the phase partition of a layer without running any backend.

use std::path::Path;

use anyhow::Result;

use crate::output::{OutputFormat, print_info, print_json, print_stat};

pub fn cmd_phases(definition: &Path, format: OutputFormat) -> Result<()> {
  let plan = super::load_plan(definition)?;

  if format.is_json() {
    return print_json(&plan);
  }

  if plan.phases.is_empty() {
    print_info(&format!("{} has no phases; it republishes its parent", plan.label));
    return Ok(());
  }

  print_info(&format!("{}: {} phase(s)", plan.label, plan.phases.len()));
  for set in &plan.phases {
    println!();
    println!("{}", set.phase);
    print_stat("Features", &set.features.len().to_string());
    print_stat("Planned", yes_no(set.requires_planning()));
    print_stat("Predictable", yes_no(set.is_predictable()));
    for feature in &set.features {
      println!("    {} {}", feature.kind(), feature.label);
    }
  }
  Ok(())
}

fn yes_no(value: bool) -> &'static str {
  if value { "yes" } else { "no" }
}
