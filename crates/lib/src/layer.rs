//! Built layers and the record that addresses them.
//!
//! A [`LayerRef`] is everything a child layer, a mount or a clone needs to
//! know about a layer that finished building: where its filesystem lives,
//! the facts describing it, and its flattened mounts. It is what a
//! successful build publishes as `layer.json`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::LayerSpec;
use crate::collect::FeatureSpec;
use crate::compiler::DepgraphArtifact;
use crate::consts::LAYER_RECORD_FILE;
use crate::feature::Label;
use crate::mount::Mount;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerRef {
  pub label: Label,
  /// Materialized filesystem state. Opaque to everything but the compiler.
  pub subvolume: PathBuf,
  pub depgraph: DepgraphArtifact,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub mounts: Vec<Mount>,
  /// Where this layer is mounted when a mount of it names no mountpoint.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default_mountpoint: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LayerRecordError {
  #[error("failed to read layer record {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("malformed layer record {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

impl LayerRef {
  /// Load a layer record. `path` may name the record itself or the output
  /// directory containing it.
  pub fn load(path: &Path) -> Result<Self, LayerRecordError> {
    let path = if path.is_dir() {
      path.join(LAYER_RECORD_FILE)
    } else {
      path.to_path_buf()
    };

    let contents = fs::read_to_string(&path).map_err(|source| LayerRecordError::Read {
      path: path.clone(),
      source,
    })?;
    serde_json::from_str(&contents).map_err(|source| LayerRecordError::Parse { path, source })
  }
}

/// A layer as written by hand: what to build, not what was built.
///
/// ```json
/// {
///   "label": "//app:layer",
///   "parent": "../base/layer.json",
///   "features": [ {"feature_type": "install", ...}, {"feature_set": "common.json"} ]
/// }
/// ```
///
/// Relative `parent` paths are resolved against the definition's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerDefinition {
  pub label: Label,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default_mountpoint: Option<PathBuf>,
  #[serde(default)]
  pub features: Vec<FeatureSpec>,
  /// Directory the definition was loaded from.
  #[serde(skip)]
  pub base_dir: PathBuf,
}

impl LayerDefinition {
  pub fn load(path: &Path) -> Result<Self, LayerRecordError> {
    let contents = fs::read_to_string(path).map_err(|source| LayerRecordError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let mut definition: LayerDefinition =
      serde_json::from_str(&contents).map_err(|source| LayerRecordError::Parse {
        path: path.to_path_buf(),
        source,
      })?;

    let base_dir = path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));
    definition.base_dir = dunce::canonicalize(&base_dir).unwrap_or(base_dir);
    Ok(definition)
  }

  pub fn parent_path(&self) -> Option<PathBuf> {
    self.parent.as_ref().map(|p| self.base_dir.join(p))
  }

  /// Load the parent record and turn the definition into a build input.
  pub fn into_spec(self) -> Result<LayerSpec, LayerRecordError> {
    let parent = self.parent_path().map(|p| LayerRef::load(&p)).transpose()?;
    Ok(LayerSpec {
      label: self.label,
      parent,
      default_mountpoint: self.default_mountpoint,
      features: self.features,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::layer_ref;
  use tempfile::TempDir;

  #[test]
  fn definition_resolves_parent_relative_to_itself() {
    let temp = TempDir::new().unwrap();
    let base = layer_ref("//base:layer");
    std::fs::create_dir_all(temp.path().join("base")).unwrap();
    fs::write(
      temp.path().join("base").join(LAYER_RECORD_FILE),
      serde_json::to_string(&base).unwrap(),
    )
    .unwrap();

    std::fs::create_dir_all(temp.path().join("app")).unwrap();
    let def_path = temp.path().join("app").join("layer.def.json");
    fs::write(
      &def_path,
      r#"{
        "label": "//app:layer",
        "parent": "../base",
        "features": [
          {"feature_type": "group", "label": "//app:g", "data": {"name": "app"}},
          [{"feature_set": "common.json"}]
        ]
      }"#,
    )
    .unwrap();

    let definition = LayerDefinition::load(&def_path).unwrap();
    assert_eq!(definition.features.len(), 2);

    let spec = definition.into_spec().unwrap();
    assert_eq!(spec.label, Label::new("//app:layer"));
    assert_eq!(spec.parent, Some(base));
  }

  #[test]
  fn definition_rejects_unknown_fields() {
    let temp = TempDir::new().unwrap();
    let def_path = temp.path().join("layer.def.json");
    fs::write(&def_path, r#"{"label": "//app:layer", "parnet": "x"}"#).unwrap();

    let err = LayerDefinition::load(&def_path).unwrap_err();
    assert!(matches!(err, LayerRecordError::Parse { .. }));
  }

  #[test]
  fn load_accepts_directory_or_file() {
    let temp = TempDir::new().unwrap();
    let layer = layer_ref("//base:layer");
    let record = temp.path().join(LAYER_RECORD_FILE);
    fs::write(&record, serde_json::to_string(&layer).unwrap()).unwrap();

    assert_eq!(LayerRef::load(temp.path()).unwrap(), layer);
    assert_eq!(LayerRef::load(&record).unwrap(), layer);
  }

  #[test]
  fn load_reports_malformed_record() {
    let temp = TempDir::new().unwrap();
    let record = temp.path().join(LAYER_RECORD_FILE);
    fs::write(&record, "{ not json").unwrap();

    let err = LayerRef::load(&record).unwrap_err();
    assert!(matches!(err, LayerRecordError::Parse { .. }));
  }
}
