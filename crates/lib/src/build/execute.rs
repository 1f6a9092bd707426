//! Single phase execution.
//!
//! A phase is pre-depgraph, optional plan, compile, then post-depgraph. Every
//! artifact lands in the phase's own working directory.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use crate::compiler::{
  CompileRequest, Compiler, DepgraphArtifact, DepgraphRequest, Depgrapher, PhaseContext, Plan, PlanRequest,
};
use crate::consts::{DEPGRAPH_FILE, FEATURES_FILE, PLAN_FILE, PRE_DEPGRAPH_FILE, SUBVOLUME_DIR};
use crate::feature::Label;
use crate::mount::Mount;
use crate::phase::PhaseSet;

use super::types::{BuildError, PhaseOutput};

/// Inputs threaded into one phase from the layer and the phase before it.
pub struct PhaseInput<'a> {
  pub label: &'a Label,
  pub set: &'a PhaseSet,
  pub mounts: &'a [Mount],
  pub parent_subvolume: Option<&'a Path>,
  pub parent_depgraph: Option<&'a DepgraphArtifact>,
  /// Working directory for this phase. Replaced if it already exists.
  pub dir: PathBuf,
}

pub async fn execute_phase(
  compiler: &dyn Compiler,
  depgrapher: &dyn Depgrapher,
  input: PhaseInput<'_>,
) -> Result<PhaseOutput, BuildError> {
  let PhaseInput {
    label,
    set,
    mounts,
    parent_subvolume,
    parent_depgraph,
    dir,
  } = input;
  let phase = set.phase;

  info!(label = %label, phase = %phase, features = set.features.len(), "executing phase");

  let stage = |source: std::io::Error| BuildError::Stage {
    label: label.clone(),
    phase,
    dir: dir.clone(),
    source,
  };

  if fs::try_exists(&dir).await.map_err(stage)? {
    debug!(dir = ?dir, "removing stale phase directory");
    fs::remove_dir_all(&dir).await.map_err(stage)?;
  }
  fs::create_dir_all(&dir).await.map_err(stage)?;

  let features_json = dir.join(FEATURES_FILE);
  let features = serde_json::to_vec_pretty(&set.features).map_err(|e| stage(e.into()))?;
  fs::write(&features_json, features).await.map_err(stage)?;

  let ctx = PhaseContext {
    label,
    phase,
    features: &set.features,
    features_json: &features_json,
    mounts,
  };
  let layers: Vec<_> = set.dependency_layers().into_iter().collect();

  let pre_depgraph = depgrapher
    .depgraph(&DepgraphRequest {
      ctx: &ctx,
      parent: parent_depgraph,
      layers: layers.clone(),
      observe: None,
      out: &dir.join(PRE_DEPGRAPH_FILE),
    })
    .await
    .map_err(|source| BuildError::Depgraph {
      label: label.clone(),
      phase,
      source,
    })?;
  debug!(label = %label, phase = %phase, hash = %pre_depgraph.hash, "pre-depgraph ready");

  let plan = if set.requires_planning() {
    let out = dir.join(PLAN_FILE);
    let path = compiler
      .plan(&PlanRequest {
        ctx: &ctx,
        depgraph: &pre_depgraph,
        parent_subvolume,
        out: &out,
      })
      .await
      .map_err(|source| BuildError::Plan {
        label: label.clone(),
        phase,
        source,
      })?;
    debug!(label = %label, phase = %phase, plan = ?path, "plan resolved");
    Plan::Resolved(path)
  } else {
    Plan::Empty
  };

  let subvolume = dir.join(SUBVOLUME_DIR);
  compiler
    .compile(&CompileRequest {
      ctx: &ctx,
      depgraph: &pre_depgraph,
      plan: &plan,
      parent_subvolume,
      subvolume: &subvolume,
    })
    .await
    .map_err(|source| BuildError::Compile {
      label: label.clone(),
      phase,
      source,
    })?;

  let observed = !set.is_predictable();
  let depgraph = if observed {
    debug!(label = %label, phase = %phase, "phase is not predictable, observing subvolume");
    depgrapher
      .depgraph(&DepgraphRequest {
        ctx: &ctx,
        parent: parent_depgraph,
        layers,
        observe: Some(&subvolume),
        out: &dir.join(DEPGRAPH_FILE),
      })
      .await
      .map_err(|source| BuildError::Depgraph {
        label: label.clone(),
        phase,
        source,
      })?
  } else {
    pre_depgraph
  };

  info!(label = %label, phase = %phase, depgraph = %depgraph.hash, observed, "phase complete");

  Ok(PhaseOutput {
    phase,
    subvolume,
    depgraph,
    plan,
    observed,
  })
}
