use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layer::LayerRef;
use crate::phase::BuildPhase;
use crate::util::hash::{Hashable, ObjectHash};

use super::data::{
  BuildinfoStamp, CloneSpec, EnsureDirsExist, Extract, Group, Install, KeyValueStore, MountFeature, RawCommand, Remove,
  RemoveKeyValue, Requires, Symlink, Tarball, User, UserMod,
};
use super::rpm::Rpm;

/// Identifies the declaration site of a feature (or the layer being built).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub String);

impl Label {
  pub fn new(label: impl Into<String>) -> Self {
    Self(label.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Label {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for Label {
  fn from(label: &str) -> Self {
    Self::new(label)
  }
}

/// Names the layer's working directory.
impl Hashable for Label {}

/// External resources a feature needs materialized before it can be applied.
///
/// These are declared by whoever constructs the feature. Nothing here is
/// inferred from the payload; composition only checks that payload references
/// are covered by a declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
  /// Build artifacts (files or directories) read by the compiler.
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub artifacts: BTreeSet<PathBuf>,
  /// Executables the compiler runs on behalf of the feature.
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub runnables: BTreeSet<String>,
  /// Other layers whose materialized state the feature reads.
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub layers: BTreeSet<LayerRef>,
}

impl Resources {
  pub fn is_empty(&self) -> bool {
    self.artifacts.is_empty() && self.runnables.is_empty() && self.layers.is_empty()
  }

  pub fn merge(&mut self, other: &Resources) {
    self.artifacts.extend(other.artifacts.iter().cloned());
    self.runnables.extend(other.runnables.iter().cloned());
    self.layers.extend(other.layers.iter().cloned());
  }

  pub fn declares_artifact(&self, path: &Path) -> bool {
    self.artifacts.iter().any(|a| a == path)
  }

  pub fn declares_layer(&self, label: &Label) -> bool {
    self.layers.iter().any(|l| &l.label == label)
  }
}

/// The closed set of feature kinds and their payloads.
///
/// Serialized adjacently tagged, which yields the `feature_type` / `data`
/// pair of the compiler's feature JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "feature_type", content = "data", rename_all = "snake_case")]
pub enum FeatureData {
  Install(Install),
  EnsureDirsExist(EnsureDirsExist),
  Symlink(Symlink),
  Remove(Remove),
  User(User),
  Group(Group),
  UserMod(UserMod),
  Mount(MountFeature),
  Requires(Requires),
  Rpm(Rpm),
  Tarball(Tarball),
  Clone(CloneSpec),
  Extract(Extract),
  KeyValueStore(KeyValueStore),
  RemoveKeyValue(RemoveKeyValue),
  RawCommand(RawCommand),
  BuildinfoStamp(BuildinfoStamp),
}

impl FeatureData {
  /// The `feature_type` tag.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Install(_) => "install",
      Self::EnsureDirsExist(_) => "ensure_dirs_exist",
      Self::Symlink(_) => "symlink",
      Self::Remove(_) => "remove",
      Self::User(_) => "user",
      Self::Group(_) => "group",
      Self::UserMod(_) => "user_mod",
      Self::Mount(_) => "mount",
      Self::Requires(_) => "requires",
      Self::Rpm(_) => "rpm",
      Self::Tarball(_) => "tarball",
      Self::Clone(_) => "clone",
      Self::Extract(_) => "extract",
      Self::KeyValueStore(_) => "key_value_store",
      Self::RemoveKeyValue(_) => "remove_key_value",
      Self::RawCommand(_) => "raw_command",
      Self::BuildinfoStamp(_) => "buildinfo_stamp",
    }
  }

  pub fn phase(&self) -> BuildPhase {
    match self {
      Self::Rpm(_) => BuildPhase::PackageManager,
      Self::Remove(_) | Self::RemoveKeyValue(_) => BuildPhase::Remove,
      Self::BuildinfoStamp(_) => BuildPhase::BuildinfoStamp,
      _ => BuildPhase::Compile,
    }
  }

  /// Whether the compiler must resolve an external decision (a package
  /// transaction) before the mutation this feature performs is known.
  pub fn requires_planning(&self) -> bool {
    matches!(self, Self::Rpm(_))
  }

  /// Whether the effects of this feature are fully described by its payload.
  ///
  /// Unpredictable features may create files nobody declared, so the facts
  /// for a phase containing one must be re-derived from the filesystem.
  pub fn is_predictable(&self) -> bool {
    !matches!(
      self,
      Self::Rpm(_) | Self::Tarball(_) | Self::Clone(_) | Self::Extract(_) | Self::RawCommand(_)
    )
  }

  /// Layers referenced from the payload.
  pub fn referenced_layers(&self) -> Vec<&LayerRef> {
    match self {
      Self::Mount(mount) => mount.source_layer().into_iter().collect(),
      Self::Clone(clone) => vec![&clone.src_layer],
      Self::Extract(extract) => extract.source_layer().into_iter().collect(),
      _ => Vec::new(),
    }
  }

  /// Build artifacts referenced from the payload.
  pub fn referenced_artifacts(&self) -> Vec<&Path> {
    match self {
      Self::Install(install) => vec![install.src.as_path()],
      Self::Tarball(tarball) => vec![tarball.src.as_path()],
      Self::Extract(extract) => extract.source_artifact().into_iter().collect(),
      Self::Rpm(rpm) => rpm.items.iter().filter_map(|i| i.src.as_deref()).collect(),
      _ => Vec::new(),
    }
  }

  /// Composition-time checks for this payload.
  pub fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    match self {
      Self::Install(v) => v.validate(label),
      Self::EnsureDirsExist(v) => v.validate(label),
      Self::Symlink(v) => v.validate(label),
      Self::Remove(v) => v.validate(label),
      Self::User(v) => v.validate(label),
      Self::Group(v) => v.validate(label),
      Self::UserMod(v) => v.validate(label),
      Self::Mount(v) => v.validate(label),
      Self::Requires(v) => v.validate(label),
      Self::Rpm(v) => v.validate(label),
      Self::Tarball(v) => v.validate(label),
      Self::Clone(v) => v.validate(label),
      Self::Extract(v) => v.validate(label),
      Self::KeyValueStore(v) => v.validate(label),
      Self::RemoveKeyValue(v) => v.validate(label),
      Self::RawCommand(v) => v.validate(label),
      Self::BuildinfoStamp(_) => Ok(()),
    }
  }
}

/// A single declared filesystem-mutation intent plus its resource needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
  pub label: Label,
  #[serde(flatten)]
  pub data: FeatureData,
  #[serde(default, skip_serializing_if = "Resources::is_empty")]
  pub resources: Resources,
}

#[derive(Serialize)]
struct IdentityInput<'a> {
  data: &'a FeatureData,
  resources: &'a Resources,
}

impl Hashable for IdentityInput<'_> {}

impl Feature {
  pub fn new(label: impl Into<Label>, data: FeatureData) -> Self {
    Self {
      label: label.into(),
      data,
      resources: Resources::default(),
    }
  }

  pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
    self.resources.artifacts.insert(path.into());
    self
  }

  pub fn with_runnable(mut self, runnable: impl Into<String>) -> Self {
    self.resources.runnables.insert(runnable.into());
    self
  }

  pub fn with_layer(mut self, layer: LayerRef) -> Self {
    self.resources.layers.insert(layer);
    self
  }

  pub fn kind(&self) -> &'static str {
    self.data.kind()
  }

  pub fn phase(&self) -> BuildPhase {
    self.data.phase()
  }

  pub fn requires_planning(&self) -> bool {
    self.data.requires_planning()
  }

  pub fn is_predictable(&self) -> bool {
    self.data.is_predictable()
  }

  /// Content hash of `(kind, payload, declared resources)`.
  ///
  /// The label is not part of the identity: the same statement declared at two
  /// call sites is the same feature.
  pub fn identity(&self) -> Result<ObjectHash, ComposeError> {
    IdentityInput {
      data: &self.data,
      resources: &self.resources,
    }
    .compute_hash()
    .map_err(|e| ComposeError::Identity {
      label: self.label.clone(),
      message: e.to_string(),
    })
  }

  /// Check the payload and that every resource it references was declared.
  pub fn validate(&self) -> Result<(), ComposeError> {
    self.data.validate(&self.label)?;

    for layer in self.data.referenced_layers() {
      if !self.resources.declares_layer(&layer.label) {
        return Err(ComposeError::UndeclaredLayer {
          label: self.label.clone(),
          layer: layer.label.clone(),
        });
      }
    }

    for artifact in self.data.referenced_artifacts() {
      if !self.resources.declares_artifact(artifact) {
        return Err(ComposeError::UndeclaredArtifact {
          label: self.label.clone(),
          path: artifact.to_path_buf(),
        });
      }
    }

    Ok(())
  }
}

/// Errors detected while composing features, before anything is executed.
#[derive(Debug, Error)]
pub enum ComposeError {
  /// A statement combines options that cannot be used together.
  #[error("{label}: conflicting options: {message}")]
  ConflictingOptions { label: Label, message: String },

  /// A source path ending in `/` was paired with a destination that doesn't.
  #[error(
    "{label}: src '{src}' ends in '/', so only its contents are copied; dst '{dst}' must also end in '/' to name the pre-existing directory to copy into"
  )]
  TrailingSlash { label: Label, src: PathBuf, dst: PathBuf },

  /// A path inside the layer was not absolute.
  #[error("{label}: '{path}' must be an absolute path inside the layer")]
  RelativePath { label: Label, path: PathBuf },

  /// A payload field holds an unusable value.
  #[error("{label}: invalid {field}: {message}")]
  InvalidField {
    label: Label,
    field: &'static str,
    message: String,
  },

  /// A layer mount has no mountpoint and the source layer declares no default.
  #[error("{label}: mount of {layer} has no mountpoint and the layer declares no default_mountpoint")]
  MissingMountpoint { label: Label, layer: Label },

  /// The payload reads a layer that is not listed in the required layers.
  #[error("{label}: references layer {layer} without declaring it as a required layer")]
  UndeclaredLayer { label: Label, layer: Label },

  /// The payload reads an artifact that is not listed in the required artifacts.
  #[error("{label}: references artifact '{path}' without declaring it as a required artifact")]
  UndeclaredArtifact { label: Label, path: PathBuf },

  /// Two different features hashed to the same identity.
  #[error("identity {identity} is shared by incompatible features from {existing} and {duplicate}")]
  IdentityCollision {
    identity: ObjectHash,
    existing: Label,
    duplicate: Label,
  },

  /// The identity hash could not be computed.
  #[error("{label}: failed to compute feature identity: {message}")]
  Identity { label: Label, message: String },

  /// A referenced feature collection could not be loaded.
  #[error("failed to resolve feature set {set}: {message}")]
  UnresolvedFeatureSet { set: String, message: String },
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::feature::data::Install;

  fn install(dst: &str) -> Feature {
    Feature::new(
      "//app:config",
      FeatureData::Install(Install {
        src: PathBuf::from("/buck-out/config.toml"),
        dst: PathBuf::from(dst),
        mode: None,
        user: "root".to_string(),
        group: "root".to_string(),
      }),
    )
    .with_artifact("/buck-out/config.toml")
  }

  #[test]
  fn serializes_to_compiler_feature_json() {
    let feature = install("/etc/app.toml");
    let json = serde_json::to_value(&feature).unwrap();

    assert_eq!(json["feature_type"], "install");
    assert_eq!(json["label"], "//app:config");
    assert_eq!(json["data"]["dst"], "/etc/app.toml");
    assert_eq!(json["resources"]["artifacts"][0], "/buck-out/config.toml");
  }

  #[test]
  fn deserializes_compiler_feature_json() {
    let json = serde_json::json!({
      "feature_type": "group",
      "label": "//app:group",
      "data": { "name": "app" }
    });
    let feature: Feature = serde_json::from_value(json).unwrap();

    assert_eq!(feature.kind(), "group");
    assert_eq!(feature.label, Label::new("//app:group"));
    assert!(feature.resources.is_empty());
  }

  #[test]
  fn identity_ignores_label() {
    let a = install("/etc/app.toml");
    let mut b = install("/etc/app.toml");
    b.label = Label::new("//other:call_site");

    assert_eq!(a.identity().unwrap(), b.identity().unwrap());
  }

  #[test]
  fn identity_covers_payload_and_resources() {
    let a = install("/etc/app.toml");
    let b = install("/etc/other.toml");
    let c = install("/etc/app.toml").with_runnable("//tools:stamp");

    assert_ne!(a.identity().unwrap(), b.identity().unwrap());
    assert_ne!(a.identity().unwrap(), c.identity().unwrap());
  }

  #[test]
  fn undeclared_artifact_is_rejected() {
    let mut feature = install("/etc/app.toml");
    feature.resources.artifacts.clear();

    let err = feature.validate().unwrap_err();
    assert!(matches!(err, ComposeError::UndeclaredArtifact { .. }), "{err}");
  }

  #[test]
  fn phases_follow_kind() {
    assert_eq!(install("/x").phase(), BuildPhase::Compile);
    assert!(install("/x").is_predictable());
    assert!(!install("/x").requires_planning());
  }
}
