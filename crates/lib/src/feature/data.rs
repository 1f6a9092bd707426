//! Kind-specific feature payloads.
//!
//! Each payload knows how to check itself at composition time. Nothing here
//! touches a filesystem: the checks are purely about the shape of the
//! declaration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::layer::LayerRef;

use super::types::{ComposeError, Label};

fn default_root() -> String {
  "root".to_string()
}

fn default_dir_mode() -> u32 {
  0o755
}

fn default_true() -> bool {
  true
}

fn is_false(value: &bool) -> bool {
  !*value
}

pub(crate) fn has_trailing_slash(path: &Path) -> bool {
  path.to_string_lossy().ends_with('/')
}

fn require_absolute(label: &Label, path: &Path) -> Result<(), ComposeError> {
  if path.is_absolute() {
    Ok(())
  } else {
    Err(ComposeError::RelativePath {
      label: label.clone(),
      path: path.to_path_buf(),
    })
  }
}

fn require_non_empty(label: &Label, field: &'static str, value: &str) -> Result<(), ComposeError> {
  if value.trim().is_empty() {
    return Err(ComposeError::InvalidField {
      label: label.clone(),
      field,
      message: "must not be empty".to_string(),
    });
  }
  Ok(())
}

/// Copy a build artifact into the layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Install {
  pub src: PathBuf,
  pub dst: PathBuf,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mode: Option<u32>,
  #[serde(default = "default_root")]
  pub user: String,
  #[serde(default = "default_root")]
  pub group: String,
}

impl Install {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_absolute(label, &self.dst)?;
    if has_trailing_slash(&self.src) && !has_trailing_slash(&self.dst) {
      return Err(ComposeError::TrailingSlash {
        label: label.clone(),
        src: self.src.clone(),
        dst: self.dst.clone(),
      });
    }
    if let Some(mode) = self.mode
      && mode > 0o7777
    {
      return Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "mode",
        message: format!("{mode:o} is not a valid permission mode"),
      });
    }
    require_non_empty(label, "user", &self.user)?;
    require_non_empty(label, "group", &self.group)
  }
}

/// Create a chain of directories below an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureDirsExist {
  pub into_dir: PathBuf,
  pub subdirs_to_create: PathBuf,
  #[serde(default = "default_dir_mode")]
  pub mode: u32,
  #[serde(default = "default_root")]
  pub user: String,
  #[serde(default = "default_root")]
  pub group: String,
}

impl EnsureDirsExist {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_absolute(label, &self.into_dir)?;
    if self.subdirs_to_create.is_absolute() {
      return Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "subdirs_to_create",
        message: "must be relative to into_dir".to_string(),
      });
    }
    require_non_empty(label, "user", &self.user)?;
    require_non_empty(label, "group", &self.group)
  }

  /// Every directory this feature creates, outermost first.
  pub fn created_dirs(&self) -> Vec<PathBuf> {
    let mut current = self.into_dir.clone();
    let mut dirs = Vec::new();
    for component in self.subdirs_to_create.components() {
      current.push(component);
      dirs.push(current.clone());
    }
    dirs
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symlink {
  pub link: PathBuf,
  pub target: PathBuf,
  #[serde(default, skip_serializing_if = "is_false")]
  pub is_directory: bool,
}

impl Symlink {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_absolute(label, &self.link)
  }

  /// The target resolved against the link's parent directory.
  pub fn resolved_target(&self) -> PathBuf {
    if self.target.is_absolute() {
      return self.target.clone();
    }
    let parent = self.link.parent().unwrap_or_else(|| Path::new("/"));
    normalize(&parent.join(&self.target))
  }
}

/// Lexically normalize an absolute path, resolving `.` and `..`.
pub(crate) fn normalize(path: &Path) -> PathBuf {
  use std::path::Component;

  let mut out = PathBuf::from("/");
  for component in path.components() {
    match component {
      Component::ParentDir => {
        out.pop();
      }
      Component::Normal(part) => out.push(part),
      Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
    }
  }
  out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remove {
  pub path: PathBuf,
  #[serde(default = "default_true")]
  pub must_exist: bool,
}

impl Remove {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_absolute(label, &self.path)?;
    if self.path == Path::new("/") {
      return Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "path",
        message: "refusing to remove the layer root".to_string(),
      });
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub uid: Option<u32>,
  pub primary_group: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub supplementary_groups: Vec<String>,
  pub home_dir: PathBuf,
  pub shell: PathBuf,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

impl User {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_non_empty(label, "name", &self.name)?;
    require_non_empty(label, "primary_group", &self.primary_group)?;
    require_absolute(label, &self.home_dir)?;
    require_absolute(label, &self.shell)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gid: Option<u32>,
}

impl Group {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_non_empty(label, "name", &self.name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMod {
  pub username: String,
  pub add_supplementary_groups: Vec<String>,
}

impl UserMod {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_non_empty(label, "username", &self.username)?;
    if self.add_supplementary_groups.is_empty() {
      return Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "add_supplementary_groups",
        message: "at least one group is required".to_string(),
      });
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountFeatureSource {
  Host {
    path: PathBuf,
    #[serde(default, skip_serializing_if = "is_false")]
    is_directory: bool,
  },
  Layer { layer: LayerRef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFeature {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mountpoint: Option<PathBuf>,
  pub source: MountFeatureSource,
}

impl MountFeature {
  pub fn source_layer(&self) -> Option<&LayerRef> {
    match &self.source {
      MountFeatureSource::Layer { layer } => Some(layer),
      MountFeatureSource::Host { .. } => None,
    }
  }

  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    match (&self.mountpoint, &self.source) {
      (Some(mountpoint), _) => require_absolute(label, mountpoint),
      (None, MountFeatureSource::Host { .. }) => Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "mountpoint",
        message: "host mounts must name a mountpoint".to_string(),
      }),
      (None, MountFeatureSource::Layer { layer }) => match &layer.default_mountpoint {
        Some(_) => Ok(()),
        None => Err(ComposeError::MissingMountpoint {
          label: label.clone(),
          layer: layer.label.clone(),
        }),
      },
    }
  }
}

/// Assertions that items exist by the time the layer is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requires {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub users: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub groups: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub files: Vec<PathBuf>,
}

impl Requires {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    for file in &self.files {
      require_absolute(label, file)?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tarball {
  pub src: PathBuf,
  pub into_dir: PathBuf,
  #[serde(default, skip_serializing_if = "is_false")]
  pub force_root_ownership: bool,
}

impl Tarball {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_absolute(label, &self.into_dir)
  }
}

/// Copy a path out of another built layer.
///
/// A `src_path` ending in `/` copies the directory's contents rather than the
/// directory itself, and then `dst_path` must end in `/` to name an existing
/// directory to copy into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
  pub src_layer: LayerRef,
  pub src_path: PathBuf,
  pub dst_path: PathBuf,
  #[serde(default)]
  pub omit_outer_dir: bool,
  #[serde(default)]
  pub pre_existing_dest: bool,
}

impl CloneSpec {
  pub fn new(
    label: &Label,
    src_layer: LayerRef,
    src_path: impl Into<PathBuf>,
    dst_path: impl Into<PathBuf>,
  ) -> Result<Self, ComposeError> {
    let src_path = src_path.into();
    let dst_path = dst_path.into();
    let spec = Self {
      omit_outer_dir: has_trailing_slash(&src_path),
      pre_existing_dest: has_trailing_slash(&dst_path),
      src_layer,
      src_path,
      dst_path,
    };
    spec.validate(label)?;
    Ok(spec)
  }

  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_absolute(label, &self.src_path)?;
    require_absolute(label, &self.dst_path)?;

    if has_trailing_slash(&self.src_path) && !has_trailing_slash(&self.dst_path) {
      return Err(ComposeError::TrailingSlash {
        label: label.clone(),
        src: self.src_path.clone(),
        dst: self.dst_path.clone(),
      });
    }

    if self.omit_outer_dir != has_trailing_slash(&self.src_path)
      || self.pre_existing_dest != has_trailing_slash(&self.dst_path)
    {
      return Err(ComposeError::ConflictingOptions {
        label: label.clone(),
        message: "omit_outer_dir and pre_existing_dest must match the trailing '/' of src_path and dst_path"
          .to_string(),
      });
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractSource {
  /// Binaries (and their shared-library closure) taken from a built layer.
  Layer { layer: LayerRef, binaries: Vec<PathBuf> },
  /// A single binary artifact produced by the build tool.
  Buck { src: PathBuf, dst: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extract {
  pub source: ExtractSource,
}

impl Extract {
  pub fn source_layer(&self) -> Option<&LayerRef> {
    match &self.source {
      ExtractSource::Layer { layer, .. } => Some(layer),
      ExtractSource::Buck { .. } => None,
    }
  }

  pub fn source_artifact(&self) -> Option<&Path> {
    match &self.source {
      ExtractSource::Buck { src, .. } => Some(src),
      ExtractSource::Layer { .. } => None,
    }
  }

  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    match &self.source {
      ExtractSource::Layer { binaries, .. } => {
        if binaries.is_empty() {
          return Err(ComposeError::InvalidField {
            label: label.clone(),
            field: "binaries",
            message: "at least one binary is required".to_string(),
          });
        }
        binaries.iter().try_for_each(|b| require_absolute(label, b))
      }
      ExtractSource::Buck { dst, .. } => require_absolute(label, dst),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueStore {
  pub key: String,
  pub value: String,
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub require_keys: BTreeSet<String>,
}

impl KeyValueStore {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_non_empty(label, "key", &self.key)?;
    self.require_keys.iter().try_for_each(|k| require_non_empty(label, "require_keys", k))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveKeyValue {
  pub key: String,
}

impl RemoveKeyValue {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    require_non_empty(label, "key", &self.key)
  }
}

/// An arbitrary command run inside the layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommand {
  pub cmd: Vec<String>,
  #[serde(default = "default_root")]
  pub user: String,
  #[serde(default, skip_serializing_if = "is_false")]
  pub bind_repo_ro: bool,
}

impl RawCommand {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    if self.cmd.is_empty() {
      return Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "cmd",
        message: "command must have at least one argument".to_string(),
      });
    }
    require_non_empty(label, "user", &self.user)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildinfoStamp {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub time_hash: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::layer_ref;

  fn label() -> Label {
    Label::new("//app:clone")
  }

  #[test]
  fn clone_contents_into_existing_dir() {
    let spec = CloneSpec::new(&label(), layer_ref("//base:layer"), "/usr/share/", "/opt/share/").unwrap();
    assert!(spec.omit_outer_dir);
    assert!(spec.pre_existing_dest);
  }

  #[test]
  fn clone_whole_dir_to_new_path() {
    let spec = CloneSpec::new(&label(), layer_ref("//base:layer"), "/usr/share", "/opt/share").unwrap();
    assert!(!spec.omit_outer_dir);
    assert!(!spec.pre_existing_dest);
  }

  #[test]
  fn clone_contents_without_trailing_dst_fails() {
    let err = CloneSpec::new(&label(), layer_ref("//base:layer"), "/usr/share/", "/opt/share").unwrap_err();
    assert!(matches!(err, ComposeError::TrailingSlash { .. }), "{err}");
    assert!(err.to_string().contains("//app:clone"));
  }

  #[test]
  fn clone_flags_must_match_paths() {
    let mut spec = CloneSpec::new(&label(), layer_ref("//base:layer"), "/a", "/b").unwrap();
    spec.omit_outer_dir = true;
    assert!(matches!(
      spec.validate(&label()).unwrap_err(),
      ComposeError::ConflictingOptions { .. }
    ));
  }

  #[test]
  fn clone_from_json_reports_trailing_slash_first() {
    let spec: CloneSpec = serde_json::from_value(serde_json::json!({
      "src_layer": layer_ref("//base:layer"),
      "src_path": "/usr/share/",
      "dst_path": "/opt/share",
    }))
    .unwrap();
    assert!(!spec.omit_outer_dir);

    let err = spec.validate(&label()).unwrap_err();
    assert!(matches!(err, ComposeError::TrailingSlash { .. }), "{err}");
  }

  #[test]
  fn install_dir_contents_needs_dir_dst() {
    let install = Install {
      src: PathBuf::from("/buck-out/dir/"),
      dst: PathBuf::from("/opt/dir"),
      mode: None,
      user: "root".into(),
      group: "root".into(),
    };
    assert!(matches!(
      install.validate(&label()).unwrap_err(),
      ComposeError::TrailingSlash { .. }
    ));
  }

  #[test]
  fn install_dst_must_be_absolute() {
    let install = Install {
      src: PathBuf::from("/buck-out/file"),
      dst: PathBuf::from("etc/file"),
      mode: Some(0o644),
      user: "root".into(),
      group: "root".into(),
    };
    assert!(matches!(
      install.validate(&label()).unwrap_err(),
      ComposeError::RelativePath { .. }
    ));
  }

  #[test]
  fn ensure_dirs_lists_each_level() {
    let dirs = EnsureDirsExist {
      into_dir: PathBuf::from("/var"),
      subdirs_to_create: PathBuf::from("lib/app"),
      mode: 0o755,
      user: "root".into(),
      group: "root".into(),
    };
    assert_eq!(
      dirs.created_dirs(),
      vec![PathBuf::from("/var/lib"), PathBuf::from("/var/lib/app")]
    );
  }

  #[test]
  fn relative_symlink_resolves_against_parent() {
    let link = Symlink {
      link: PathBuf::from("/usr/bin/python"),
      target: PathBuf::from("../lib/python3/bin/python3"),
      is_directory: false,
    };
    assert_eq!(link.resolved_target(), PathBuf::from("/usr/lib/python3/bin/python3"));
  }

  #[test]
  fn layer_mount_without_default_mountpoint_fails() {
    let mount = MountFeature {
      mountpoint: None,
      source: MountFeatureSource::Layer {
        layer: layer_ref("//tools:layer"),
      },
    };
    assert!(matches!(
      mount.validate(&label()).unwrap_err(),
      ComposeError::MissingMountpoint { .. }
    ));
  }

  #[test]
  fn payload_defaults_apply_on_deserialize() {
    let remove: Remove = serde_json::from_value(serde_json::json!({ "path": "/tmp/x" })).unwrap();
    assert!(remove.must_exist);

    let install: Install = serde_json::from_value(serde_json::json!({ "src": "/a", "dst": "/b" })).unwrap();
    assert_eq!(install.user, "root");
    assert_eq!(install.group, "root");
  }
}
