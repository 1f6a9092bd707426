//! Layer composition and phased execution.
//!
//! A layer build runs in two halves. [`plan_layer`] is pure: it collects and
//! deduplicates features, flattens mounts and partitions the result into
//! phases. [`LayerBuilder::build`] then drives each phase through the
//! backends in order, threading the subvolume and depgraph of one phase into
//! the next, and publishes the layer record only once every phase succeeded.
//!
//! # Working directory layout
//!
//! ```text
//! <working_dir>/<label hash>/
//!   .lock
//!   <phase>/
//!     features.json
//!     pre-depgraph.json
//!     plan.json        (only if the phase was planned)
//!     subvol/
//!     depgraph.json    (only if the phase was observed)
//! ```

mod execute;
mod lock;
mod publish;
mod types;

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::collect::{FeatureSetResolver, collect, collect_with};
use crate::compiler::{Compiler, DepgraphArtifact, Depgrapher};
use crate::config::BuildConfig;
use crate::feature::{ComposeError, Label};
use crate::layer::LayerRef;
use crate::mount::flatten_mounts;
use crate::phase::partition;
use crate::util::hash::Hashable;

pub use execute::{PhaseInput, execute_phase};
pub use lock::{LayerLock, LayerLockError, LockMetadata};
pub use publish::publish;
pub use types::*;

/// Compose a layer without running anything.
///
/// Feature-set references are expanded through `resolver` when one is given
/// and recorded in [`LayerPlan::feature_sets`] otherwise.
pub fn plan_layer(spec: LayerSpec, resolver: Option<&dyn FeatureSetResolver>) -> Result<LayerPlan, BuildError> {
  let LayerSpec {
    label,
    parent,
    default_mountpoint,
    features,
  } = spec;

  let collection = match resolver {
    Some(resolver) => collect_with(features, resolver)?,
    None => collect(features)?,
  };
  debug!(label = %label, features = collection.len(), "collected features");

  let feature_sets = collection.feature_sets().clone();
  let features = collection.into_features(&label)?;

  let parent_mounts = parent.as_ref().map(|p| p.mounts.as_slice()).unwrap_or_default();
  let mounts = flatten_mounts(&features, parent_mounts)?;
  let phases = partition(features, parent.is_some());

  Ok(LayerPlan {
    label,
    parent,
    default_mountpoint,
    mounts,
    phases,
    feature_sets,
  })
}

/// Builds layers through a compiler and a depgraph backend.
pub struct LayerBuilder<'a> {
  config: BuildConfig,
  compiler: &'a dyn Compiler,
  depgrapher: &'a dyn Depgrapher,
  resolver: Option<&'a dyn FeatureSetResolver>,
}

impl<'a> LayerBuilder<'a> {
  pub fn new(config: BuildConfig, compiler: &'a dyn Compiler, depgrapher: &'a dyn Depgrapher) -> Self {
    Self {
      config,
      compiler,
      depgrapher,
      resolver: None,
    }
  }

  pub fn with_resolver(mut self, resolver: &'a dyn FeatureSetResolver) -> Self {
    self.resolver = Some(resolver);
    self
  }

  /// Staging directory for a label's phases.
  pub fn layer_work_dir(&self, label: &Label) -> Result<PathBuf, BuildError> {
    Ok(self.config.working_dir.join(label.compute_hash()?.0))
  }

  /// Build `spec` and publish its record into `out_dir`.
  pub async fn build(&self, spec: LayerSpec, out_dir: &Path) -> Result<BuiltLayer, BuildError> {
    let plan = plan_layer(spec, self.resolver)?;
    if let Some(set) = plan.feature_sets.iter().next() {
      return Err(
        ComposeError::UnresolvedFeatureSet {
          set: set.to_string(),
          message: "no feature-set resolver configured".to_string(),
        }
        .into(),
      );
    }

    let work = self.layer_work_dir(&plan.label)?;
    let _lock = LayerLock::acquire(&work, &plan.label)?;

    info!(
      label = %plan.label,
      phases = plan.phases.len(),
      mounts = plan.mounts.len(),
      work = ?work,
      "building layer"
    );

    let phases = match self.run_phases(&plan, &work).await {
      Ok(phases) => phases,
      Err(err) => {
        error!(label = %plan.label, error = %err, "layer build failed");
        if self.config.keep_failed {
          warn!(label = %plan.label, work = ?work, "keeping failed phase directories");
        } else {
          discard_phases(&plan, &work).await;
        }
        return Err(err);
      }
    };

    // A layer without phases is its parent, re-labelled.
    let (subvolume, depgraph) = match (phases.last(), &plan.parent) {
      (Some(last), _) => (last.subvolume.clone(), last.depgraph.clone()),
      (None, Some(parent)) => (parent.subvolume.clone(), parent.depgraph.clone()),
      (None, None) => {
        return Err(BuildError::NoPhases {
          label: plan.label.clone(),
        });
      }
    };

    let layer = LayerRef {
      label: plan.label,
      subvolume,
      depgraph,
      mounts: plan.mounts,
      default_mountpoint: plan.default_mountpoint,
    };
    let record = publish(out_dir, &layer)?;
    info!(label = %layer.label, record = ?record, depgraph = %layer.depgraph.hash, "layer published");

    Ok(BuiltLayer { layer, phases, record })
  }

  async fn run_phases(&self, plan: &LayerPlan, work: &Path) -> Result<Vec<PhaseOutput>, BuildError> {
    let mut subvolume: Option<PathBuf> = plan.parent.as_ref().map(|p| p.subvolume.clone());
    let mut depgraph: Option<DepgraphArtifact> = plan.parent.as_ref().map(|p| p.depgraph.clone());
    let mut outputs = Vec::with_capacity(plan.phases.len());

    for set in &plan.phases {
      let output = execute_phase(
        self.compiler,
        self.depgrapher,
        PhaseInput {
          label: &plan.label,
          set,
          mounts: &plan.mounts,
          parent_subvolume: subvolume.as_deref(),
          parent_depgraph: depgraph.as_ref(),
          dir: work.join(set.phase.as_str()),
        },
      )
      .await?;

      subvolume = Some(output.subvolume.clone());
      depgraph = Some(output.depgraph.clone());
      outputs.push(output);
    }
    Ok(outputs)
  }
}

async fn discard_phases(plan: &LayerPlan, work: &Path) {
  for set in &plan.phases {
    let dir = work.join(set.phase.as_str());
    match tokio::fs::remove_dir_all(&dir).await {
      Ok(()) => debug!(dir = ?dir, "removed phase directory"),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!(dir = ?dir, error = %e, "failed to remove phase directory"),
    }
  }
}
