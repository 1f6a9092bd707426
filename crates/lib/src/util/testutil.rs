//! Test fixtures: feature constructors, layer records and a recording backend.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::compiler::{
  BackendError, CompileRequest, Compiler, DepgraphArtifact, DepgraphRequest, Depgrapher, PlanRequest, Step,
};
use crate::feature::{
  CloneSpec, EnsureDirsExist, Feature, FeatureData, Group, Install, Label, MountFeature, MountFeatureSource, Remove,
  Symlink, User,
};
use crate::layer::LayerRef;
use crate::phase::BuildPhase;
use crate::util::hash::hash_bytes;

/// A built layer that exists only on paper.
pub fn layer_ref(label: &str) -> LayerRef {
  let dir = PathBuf::from("/layers").join(label.trim_start_matches('/').replace([':', '/'], "_"));
  LayerRef {
    label: Label::new(label),
    subvolume: dir.join("subvol"),
    depgraph: DepgraphArtifact {
      path: dir.join("depgraph.json"),
      hash: hash_bytes(label.as_bytes()),
    },
    mounts: Vec::new(),
    default_mountpoint: None,
  }
}

/// Install `/buck-out/<file name of dst>` at `dst`.
pub fn install(label: &str, dst: &str) -> Feature {
  let name = Path::new(dst)
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "artifact".to_string());
  let src = PathBuf::from("/buck-out").join(name);
  Feature::new(
    label,
    FeatureData::Install(Install {
      src: src.clone(),
      dst: PathBuf::from(dst),
      mode: None,
      user: "root".to_string(),
      group: "root".to_string(),
    }),
  )
  .with_artifact(src)
}

pub fn ensure_dirs(label: &str, into_dir: &str, subdirs: &str) -> Feature {
  Feature::new(
    label,
    FeatureData::EnsureDirsExist(EnsureDirsExist {
      into_dir: PathBuf::from(into_dir),
      subdirs_to_create: PathBuf::from(subdirs),
      mode: 0o755,
      user: "root".to_string(),
      group: "root".to_string(),
    }),
  )
}

pub fn symlink(label: &str, link: &str, target: &str) -> Feature {
  Feature::new(
    label,
    FeatureData::Symlink(Symlink {
      link: PathBuf::from(link),
      target: PathBuf::from(target),
      is_directory: false,
    }),
  )
}

pub fn remove(label: &str, path: &str) -> Feature {
  Feature::new(
    label,
    FeatureData::Remove(Remove {
      path: PathBuf::from(path),
      must_exist: true,
    }),
  )
}

/// A user whose primary group has the same name.
pub fn user(label: &str, name: &str) -> Feature {
  Feature::new(
    label,
    FeatureData::User(User {
      name: name.to_string(),
      uid: None,
      primary_group: name.to_string(),
      supplementary_groups: Vec::new(),
      home_dir: PathBuf::from("/home").join(name),
      shell: PathBuf::from("/bin/sh"),
      comment: None,
    }),
  )
}

pub fn group(label: &str, name: &str) -> Feature {
  Feature::new(
    label,
    FeatureData::Group(Group {
      name: name.to_string(),
      gid: None,
    }),
  )
}

pub fn host_mount(label: &str, mountpoint: &str, path: &str) -> Feature {
  Feature::new(
    label,
    FeatureData::Mount(MountFeature {
      mountpoint: Some(PathBuf::from(mountpoint)),
      source: MountFeatureSource::Host {
        path: PathBuf::from(path),
        is_directory: true,
      },
    }),
  )
}

pub fn layer_mount(label: &str, layer: LayerRef, mountpoint: Option<&str>) -> Feature {
  Feature::new(
    label,
    FeatureData::Mount(MountFeature {
      mountpoint: mountpoint.map(PathBuf::from),
      source: MountFeatureSource::Layer { layer: layer.clone() },
    }),
  )
  .with_layer(layer)
}

pub fn clone(label: &str, layer: LayerRef, src: &str, dst: &str) -> Feature {
  let spec = CloneSpec::new(&Label::new(label), layer.clone(), src, dst).unwrap();
  Feature::new(label, FeatureData::Clone(spec)).with_layer(layer)
}

/// One backend call, as seen by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
  pub step: Step,
  pub phase: BuildPhase,
  pub observed: bool,
}

/// A compiler and depgrapher that records what it was asked to do.
///
/// Depgraphs are written as a JSON summary of their inputs, so two calls
/// with the same inputs produce identical artifacts. Compile creates the
/// subvolume directory.
#[derive(Default)]
pub struct RecordingBackend {
  calls: Mutex<Vec<Call>>,
  walks: AtomicUsize,
  /// Fail the given step in the given phase.
  pub fail: Option<(Step, BuildPhase)>,
}

impl RecordingBackend {
  pub fn failing(step: Step, phase: BuildPhase) -> Self {
    Self {
      fail: Some((step, phase)),
      ..Self::default()
    }
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn count(&self, step: Step) -> usize {
    self.calls().iter().filter(|c| c.step == step).count()
  }

  /// Number of depgraph calls that had to observe a filesystem.
  pub fn walks(&self) -> usize {
    self.walks.load(Ordering::SeqCst)
  }

  fn record(&self, step: Step, phase: BuildPhase, observed: bool) -> Result<(), BackendError> {
    self.calls.lock().unwrap().push(Call { step, phase, observed });
    if self.fail == Some((step, phase)) {
      return Err(BackendError::Failed {
        step,
        code: Some(1),
        stderr: format!("injected {step} failure"),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl Depgrapher for RecordingBackend {
  async fn depgraph(&self, req: &DepgraphRequest<'_>) -> Result<DepgraphArtifact, BackendError> {
    self.record(Step::Depgraph, req.ctx.phase, req.observe.is_some())?;
    if req.observe.is_some() {
      self.walks.fetch_add(1, Ordering::SeqCst);
    }

    let features: Vec<_> = req.ctx.features.iter().map(|f| f.label.to_string()).collect();
    let summary = serde_json::json!({
      "label": req.ctx.label,
      "features": features,
      "parent": req.parent.map(|p| p.hash.0.clone()),
      "observed": req.observe.is_some(),
    });
    std::fs::write(req.out, serde_json::to_vec(&summary)?)?;
    DepgraphArtifact::from_file(req.out)
  }
}

#[async_trait]
impl Compiler for RecordingBackend {
  async fn plan(&self, req: &PlanRequest<'_>) -> Result<PathBuf, BackendError> {
    self.record(Step::Plan, req.ctx.phase, false)?;
    std::fs::write(req.out, b"{\"transaction\":[]}")?;
    Ok(req.out.to_path_buf())
  }

  async fn compile(&self, req: &CompileRequest<'_>) -> Result<(), BackendError> {
    self.record(Step::Compile, req.ctx.phase, false)?;
    std::fs::create_dir_all(req.subvolume)?;
    Ok(())
  }
}
