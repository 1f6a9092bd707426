//! Mount flattening.
//!
//! A layer may mount other layers, which may themselves carry mounts. Every
//! layer exposes a single flat list so consumers never have to walk the
//! mount graph: when a layer is mounted, its own (already flat) list is
//! copied in with each mountpoint re-rooted below the new one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::feature::{Feature, FeatureData, Label, MountFeatureSource};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
  Host {
    path: PathBuf,
    #[serde(default)]
    is_directory: bool,
  },
  Layer { label: Label, subvolume: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mount {
  /// Absolute path inside the consuming layer.
  pub mountpoint: PathBuf,
  pub source: MountSource,
}

#[derive(Debug, Error)]
pub enum MountError {
  #[error("{label}: mount of {layer} has no mountpoint and the layer declares no default_mountpoint")]
  MissingMountpoint { label: Label, layer: Label },

  #[error("{label}: host mounts must name a mountpoint")]
  HostWithoutMountpoint { label: Label },

  #[error("{label}: mountpoint '{mountpoint}' must be absolute")]
  RelativeMountpoint { label: Label, mountpoint: PathBuf },

  #[error("{label}: mountpoint '{mountpoint}' is already used by {existing}")]
  Collision {
    label: Label,
    mountpoint: PathBuf,
    existing: String,
  },
}

/// Join a nested mountpoint below `base`.
pub fn rebase(base: &Path, nested: &Path) -> PathBuf {
  base.join(nested.strip_prefix("/").unwrap_or(nested))
}

/// Compute the flat mount list of a layer.
///
/// Parent mounts come first, then each mount feature in declaration order,
/// each layer mount immediately followed by the re-rooted mounts of the
/// layer it mounts. Two mounts at the same mountpoint are an error.
pub fn flatten_mounts(features: &[Feature], parent_mounts: &[Mount]) -> Result<Vec<Mount>, MountError> {
  let mut mounts: Vec<Mount> = Vec::with_capacity(parent_mounts.len());
  let mut claimed: BTreeMap<PathBuf, String> = BTreeMap::new();

  for mount in parent_mounts {
    claimed.insert(mount.mountpoint.clone(), "the parent layer".to_string());
    mounts.push(mount.clone());
  }

  let mut claim = |mount: Mount, label: &Label, mounts: &mut Vec<Mount>| -> Result<(), MountError> {
    if let Some(existing) = claimed.get(&mount.mountpoint) {
      return Err(MountError::Collision {
        label: label.clone(),
        mountpoint: mount.mountpoint,
        existing: existing.clone(),
      });
    }
    claimed.insert(mount.mountpoint.clone(), label.to_string());
    mounts.push(mount);
    Ok(())
  };

  for feature in features {
    let FeatureData::Mount(mount) = &feature.data else {
      continue;
    };
    let label = &feature.label;

    match &mount.source {
      MountFeatureSource::Host { path, is_directory } => {
        let mountpoint = mount
          .mountpoint
          .clone()
          .ok_or_else(|| MountError::HostWithoutMountpoint { label: label.clone() })?;
        check_absolute(label, &mountpoint)?;
        claim(
          Mount {
            mountpoint,
            source: MountSource::Host {
              path: path.clone(),
              is_directory: *is_directory,
            },
          },
          label,
          &mut mounts,
        )?;
      }
      MountFeatureSource::Layer { layer } => {
        let mountpoint = mount
          .mountpoint
          .clone()
          .or_else(|| layer.default_mountpoint.clone())
          .ok_or_else(|| MountError::MissingMountpoint {
            label: label.clone(),
            layer: layer.label.clone(),
          })?;
        check_absolute(label, &mountpoint)?;

        debug!(label = %label, layer = %layer.label, mountpoint = %mountpoint.display(), "mounting layer");
        claim(
          Mount {
            mountpoint: mountpoint.clone(),
            source: MountSource::Layer {
              label: layer.label.clone(),
              subvolume: layer.subvolume.clone(),
            },
          },
          label,
          &mut mounts,
        )?;

        for nested in &layer.mounts {
          claim(
            Mount {
              mountpoint: rebase(&mountpoint, &nested.mountpoint),
              source: nested.source.clone(),
            },
            label,
            &mut mounts,
          )?;
        }
      }
    }
  }

  Ok(mounts)
}

fn check_absolute(label: &Label, mountpoint: &Path) -> Result<(), MountError> {
  if mountpoint.is_absolute() {
    Ok(())
  } else {
    Err(MountError::RelativeMountpoint {
      label: label.clone(),
      mountpoint: mountpoint.to_path_buf(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{host_mount, layer_mount, layer_ref};

  fn mountpoints(mounts: &[Mount]) -> Vec<&str> {
    mounts.iter().filter_map(|m| m.mountpoint.to_str()).collect()
  }

  #[test]
  fn nested_layer_mounts_are_rebased() {
    let n = layer_ref("//n:layer");
    let mut m = layer_ref("//m:layer");
    m.mounts = flatten_mounts(&[layer_mount("//m:mount", n.clone(), Some("/inner"))], &[]).unwrap();

    let l = flatten_mounts(&[layer_mount("//l:mount", m, Some("/mnt"))], &[]).unwrap();

    assert_eq!(mountpoints(&l), vec!["/mnt", "/mnt/inner"]);
    assert_eq!(
      l[1].source,
      MountSource::Layer {
        label: n.label.clone(),
        subvolume: n.subvolume.clone(),
      }
    );
  }

  #[test]
  fn parent_mounts_come_first() {
    let parent = vec![Mount {
      mountpoint: PathBuf::from("/proc"),
      source: MountSource::Host {
        path: PathBuf::from("/proc"),
        is_directory: true,
      },
    }];

    let mounts = flatten_mounts(&[host_mount("//x:dev", "/dev", "/dev")], &parent).unwrap();
    assert_eq!(mountpoints(&mounts), vec!["/proc", "/dev"]);
  }

  #[test]
  fn default_mountpoint_is_used() {
    let mut tools = layer_ref("//tools:layer");
    tools.default_mountpoint = Some(PathBuf::from("/opt/tools"));

    let mounts = flatten_mounts(&[layer_mount("//x:tools", tools, None)], &[]).unwrap();
    assert_eq!(mountpoints(&mounts), vec!["/opt/tools"]);
  }

  #[test]
  fn missing_mountpoint_is_an_error() {
    let err = flatten_mounts(&[layer_mount("//x:tools", layer_ref("//tools:layer"), None)], &[]).unwrap_err();
    assert!(matches!(err, MountError::MissingMountpoint { .. }));
  }

  #[test]
  fn colliding_mountpoints_are_an_error() {
    let features = [
      host_mount("//x:a", "/data", "/mnt/a"),
      host_mount("//x:b", "/data", "/mnt/b"),
    ];
    let err = flatten_mounts(&features, &[]).unwrap_err();
    match err {
      MountError::Collision { label, existing, .. } => {
        assert_eq!(label, Label::new("//x:b"));
        assert_eq!(existing, "//x:a");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn non_mount_features_are_ignored() {
    assert!(flatten_mounts(&[], &[]).unwrap().is_empty());
  }
}
