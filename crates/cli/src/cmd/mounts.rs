use std::path::Path;

use anyhow::Result;

use crate::output::{OutputFormat, mount_line, print_info, print_json};

pub fn cmd_mounts(definition: &Path, format: OutputFormat) -> Result<()> {
  let plan = super::load_plan(definition)?;

  if format.is_json() {
    return print_json(&plan.mounts);
  }

  if plan.mounts.is_empty() {
    print_info(&format!("{} has no mounts", plan.label));
    return Ok(());
  }

  for mount in &plan.mounts {
    println!("{}", mount_line(mount));
  }
  Ok(())
}
