//! Types shared by the compiler and depgraph backends.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::facts::FactsError;
use crate::feature::{Feature, Label};
use crate::layer::LayerRef;
use crate::mount::Mount;
use crate::phase::BuildPhase;
use crate::util::hash::{ContentHash, FileHashError, hash_file};

/// A facts artifact on disk, identified by the hash of its contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DepgraphArtifact {
  pub path: PathBuf,
  pub hash: ContentHash,
}

impl DepgraphArtifact {
  /// Hash an artifact a backend has just written.
  pub fn from_file(path: &Path) -> Result<Self, BackendError> {
    Ok(Self {
      path: path.to_path_buf(),
      hash: hash_file(path)?,
    })
  }
}

/// The outcome of the plan step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
  /// No feature in the phase needed planning; the plan step was not run.
  Empty,
  /// A resolved plan written by the compiler.
  Resolved(PathBuf),
}

impl Plan {
  pub fn path(&self) -> Option<&Path> {
    match self {
      Plan::Empty => None,
      Plan::Resolved(path) => Some(path),
    }
  }
}

/// Which backend step an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  Depgraph,
  Plan,
  Compile,
}

impl std::fmt::Display for Step {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Step::Depgraph => write!(f, "depgraph"),
      Step::Plan => write!(f, "plan"),
      Step::Compile => write!(f, "compile"),
    }
  }
}

/// Everything a backend may need to know about the phase being built.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
  pub label: &'a Label,
  pub phase: BuildPhase,
  pub features: &'a [Feature],
  /// `features` serialized as the compiler's feature JSON.
  pub features_json: &'a Path,
  /// The layer's flattened mounts.
  pub mounts: &'a [Mount],
}

impl PhaseContext<'_> {
  /// Artifacts and runnables the features declared, in a stable order.
  pub fn inputs(&self) -> Vec<String> {
    let mut inputs: Vec<String> = self
      .features
      .iter()
      .flat_map(|f| {
        f.resources
          .artifacts
          .iter()
          .map(|a| a.display().to_string())
          .chain(f.resources.runnables.iter().cloned())
      })
      .collect();
    inputs.sort();
    inputs.dedup();
    inputs
  }
}

pub struct DepgraphRequest<'a> {
  pub ctx: &'a PhaseContext<'a>,
  /// Facts of the previous phase (or the parent layer).
  pub parent: Option<&'a DepgraphArtifact>,
  /// Layers read by features of this phase.
  pub layers: Vec<&'a LayerRef>,
  /// When set, derive path facts by walking this directory instead of
  /// trusting the declared features.
  pub observe: Option<&'a Path>,
  pub out: &'a Path,
}

pub struct PlanRequest<'a> {
  pub ctx: &'a PhaseContext<'a>,
  pub depgraph: &'a DepgraphArtifact,
  pub parent_subvolume: Option<&'a Path>,
  pub out: &'a Path,
}

pub struct CompileRequest<'a> {
  pub ctx: &'a PhaseContext<'a>,
  pub depgraph: &'a DepgraphArtifact,
  pub plan: &'a Plan,
  pub parent_subvolume: Option<&'a Path>,
  /// Directory the new filesystem state is materialized into.
  pub subvolume: &'a Path,
}

/// Errors raised by a backend while running one step.
#[derive(Debug, Error)]
pub enum BackendError {
  /// The backend process could not be started.
  #[error("failed to run {bin} {step}: {source}")]
  Spawn {
    step: Step,
    bin: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The backend ran and reported failure.
  #[error("{step} exited with code {code:?}: {stderr}")]
  Failed {
    step: Step,
    code: Option<i32>,
    stderr: String,
  },

  /// The backend reported success but left no output behind.
  #[error("{step} succeeded but did not write {path}")]
  MissingOutput { step: Step, path: PathBuf },

  /// The facts engine rejected the phase.
  #[error(transparent)]
  Facts(#[from] FactsError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error(transparent)]
  Hash(#[from] FileHashError),
}
