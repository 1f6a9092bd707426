use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::collect::{FeatureSetRef, FeatureSpec};
use crate::compiler::{BackendError, DepgraphArtifact, Plan};
use crate::feature::{ComposeError, Label};
use crate::layer::{LayerRecordError, LayerRef};
use crate::mount::{Mount, MountError};
use crate::phase::{BuildPhase, PhaseSet};

use super::lock::LayerLockError;

/// What a layer is built from.
#[derive(Debug, Clone)]
pub struct LayerSpec {
  pub label: Label,
  pub parent: Option<LayerRef>,
  pub default_mountpoint: Option<PathBuf>,
  pub features: Vec<FeatureSpec>,
}

impl LayerSpec {
  pub fn new(label: impl Into<Label>) -> Self {
    Self {
      label: label.into(),
      parent: None,
      default_mountpoint: None,
      features: Vec::new(),
    }
  }

  pub fn with_parent(mut self, parent: LayerRef) -> Self {
    self.parent = Some(parent);
    self
  }

  pub fn with_feature(mut self, feature: impl Into<FeatureSpec>) -> Self {
    self.features.push(feature.into());
    self
  }
}

/// A layer after composition: everything known before any backend runs.
#[derive(Debug, Clone, Serialize)]
pub struct LayerPlan {
  pub label: Label,
  #[serde(skip)]
  pub parent: Option<LayerRef>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub default_mountpoint: Option<PathBuf>,
  pub mounts: Vec<Mount>,
  #[serde(serialize_with = "serialize_phases")]
  pub phases: Vec<PhaseSet>,
  /// Feature-set references left unexpanded (no resolver was given).
  #[serde(skip_serializing_if = "BTreeSet::is_empty")]
  pub feature_sets: BTreeSet<FeatureSetRef>,
}

fn serialize_phases<S: serde::Serializer>(phases: &[PhaseSet], serializer: S) -> Result<S::Ok, S::Error> {
  use serde::ser::SerializeSeq;

  #[derive(Serialize)]
  struct Entry<'a> {
    phase: BuildPhase,
    requires_planning: bool,
    predictable: bool,
    features: &'a [crate::feature::Feature],
  }

  let mut seq = serializer.serialize_seq(Some(phases.len()))?;
  for set in phases {
    seq.serialize_element(&Entry {
      phase: set.phase,
      requires_planning: set.requires_planning(),
      predictable: set.is_predictable(),
      features: &set.features,
    })?;
  }
  seq.end()
}

/// What one phase left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutput {
  pub phase: BuildPhase,
  pub subvolume: PathBuf,
  pub depgraph: DepgraphArtifact,
  pub plan: Plan,
  /// The depgraph was re-derived from the compiled filesystem.
  pub observed: bool,
}

/// A successfully built and published layer.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
  pub layer: LayerRef,
  pub phases: Vec<PhaseOutput>,
  /// The published `layer.json`.
  pub record: PathBuf,
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Compose(#[from] ComposeError),

  #[error(transparent)]
  Mount(#[from] MountError),

  #[error("depgraph failed for phase {phase} of {label}: {source}")]
  Depgraph {
    label: Label,
    phase: BuildPhase,
    #[source]
    source: BackendError,
  },

  #[error("could not resolve plan for phase {phase} of {label}: {source}")]
  Plan {
    label: Label,
    phase: BuildPhase,
    #[source]
    source: BackendError,
  },

  #[error("compile failed for phase {phase} of {label}: {source}")]
  Compile {
    label: Label,
    phase: BuildPhase,
    #[source]
    source: BackendError,
  },

  #[error("failed to stage phase {phase} of {label} in {dir}: {source}")]
  Stage {
    label: Label,
    phase: BuildPhase,
    dir: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Only reachable for a parent-less layer with no phases, which the
  /// partitioner never produces.
  #[error("{label} has no parent and produced no phases")]
  NoPhases { label: Label },

  #[error(transparent)]
  Lock(#[from] LayerLockError),

  #[error("failed to publish {path}: {source}")]
  Publish {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  LayerRecord(#[from] LayerRecordError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

impl BuildError {
  /// The phase an error occurred in, if any.
  pub fn phase(&self) -> Option<BuildPhase> {
    match self {
      BuildError::Depgraph { phase, .. }
      | BuildError::Plan { phase, .. }
      | BuildError::Compile { phase, .. }
      | BuildError::Stage { phase, .. } => Some(*phase),
      _ => None,
    }
  }
}
