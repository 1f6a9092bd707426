//! Build configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::paths::working_dir;

/// Default name of the external compiler binary, looked up on `PATH`.
pub const DEFAULT_COMPILER: &str = "layerforge-compiler";

/// Which implementation produces depgraphs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepgraphBackend {
  /// The in-process facts engine.
  #[default]
  Native,
  /// The external compiler's `depgraph` subcommand.
  External,
}

impl std::str::FromStr for DepgraphBackend {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "native" => Ok(DepgraphBackend::Native),
      "external" => Ok(DepgraphBackend::External),
      other => Err(format!("unknown depgraph backend '{other}' (expected 'native' or 'external')")),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
  /// Root of the per-layer staging directories.
  pub working_dir: PathBuf,
  pub compiler: PathBuf,
  pub depgraph: DepgraphBackend,
  /// Leave staged phase outputs behind when a build fails.
  pub keep_failed: bool,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      working_dir: working_dir(),
      compiler: PathBuf::from(DEFAULT_COMPILER),
      depgraph: DepgraphBackend::default(),
      keep_failed: false,
    }
  }
}
