//! Terminal rendering for layerforge commands.
//!
//! Status lines are colored when the stream supports it. The `*_line`
//! helpers return plain strings so they can be checked without a terminal.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use layerforge_lib::build::PhaseOutput;
use layerforge_lib::mount::{Mount, MountSource};

/// Digits of a depgraph hash shown in build summaries.
const HASH_DIGITS: usize = 12;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
}

fn short_hash(hash: &str) -> &str {
  hash.get(..HASH_DIGITS).unwrap_or(hash)
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

/// `host:<path>` or `layer:<label>`.
pub fn mount_source(source: &MountSource) -> String {
  match source {
    MountSource::Host { path, .. } => format!("host:{}", path.display()),
    MountSource::Layer { label, .. } => format!("layer:{label}"),
  }
}

pub fn mount_line(mount: &Mount) -> String {
  format!(
    "{} {} {}",
    mount.mountpoint.display(),
    symbols::ARROW,
    mount_source(&mount.source)
  )
}

/// Short depgraph hash of a finished phase, tagged with whether the facts
/// were observed from the subvolume or taken from the declared features.
pub fn phase_depgraph(phase: &PhaseOutput) -> String {
  let origin = if phase.observed { "observed" } else { "declared" };
  format!("{} ({origin})", short_hash(&phase.depgraph.hash.0))
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// Print a finished phase as a stat line keyed by the phase name.
pub fn print_phase(phase: &PhaseOutput) {
  print_stat(phase.phase.as_str(), &phase_depgraph(phase));
}

pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use layerforge_lib::compiler::{DepgraphArtifact, Plan};
  use layerforge_lib::feature::Label;
  use layerforge_lib::phase::BuildPhase;
  use layerforge_lib::util::hash::ContentHash;

  use super::*;

  fn phase_output(hash: &str, observed: bool) -> PhaseOutput {
    PhaseOutput {
      phase: BuildPhase::Compile,
      subvolume: PathBuf::from("/work/compile/subvol"),
      depgraph: DepgraphArtifact {
        path: PathBuf::from("/work/compile/depgraph.json"),
        hash: ContentHash(hash.to_string()),
      },
      plan: Plan::Empty,
      observed,
    }
  }

  #[test]
  fn phase_depgraph_is_tagged_with_its_origin() {
    assert_eq!(
      phase_depgraph(&phase_output("abcdef1234567890", false)),
      "abcdef123456 (declared)"
    );
    assert_eq!(phase_depgraph(&phase_output("abc", true)), "abc (observed)");
  }

  #[test]
  fn mount_lines_name_their_source() {
    let host = Mount {
      mountpoint: PathBuf::from("/mnt/data"),
      source: MountSource::Host {
        path: PathBuf::from("/data"),
        is_directory: true,
      },
    };
    let layer = Mount {
      mountpoint: PathBuf::from("/opt/tools"),
      source: MountSource::Layer {
        label: Label::new("//tools:layer"),
        subvolume: PathBuf::from("/work/tools/subvol"),
      },
    };

    assert_eq!(mount_line(&host), "/mnt/data → host:/data");
    assert_eq!(mount_line(&layer), "/opt/tools → layer://tools:layer");
  }

  #[test]
  fn formats_build_durations() {
    assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
  }
}
