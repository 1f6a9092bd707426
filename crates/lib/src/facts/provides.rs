//! What each feature kind provides to, requires from and removes from a
//! layer's facts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::feature::data::normalize;
use crate::feature::{ExtractSource, Feature, FeatureData, Label, MountFeatureSource};

use super::item::{FileType, Item, ItemKey, Requirement, Validator};
use super::{Facts, FactsError};

fn parent_dir(path: &Path) -> PathBuf {
  path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"))
}

fn dir_requirement(path: &Path) -> Requirement {
  Requirement::ordered(ItemKey::Path(normalize(path)), Validator::FileType(FileType::Directory))
}

fn layer_facts<'a>(
  label: &Label,
  layer: &Label,
  layers: &'a BTreeMap<Label, Facts>,
) -> Result<&'a Facts, FactsError> {
  layers.get(layer).ok_or_else(|| FactsError::MissingLayerFacts {
    label: label.clone(),
    layer: layer.clone(),
  })
}

/// Items the feature adds to the layer.
pub(crate) fn provides(feature: &Feature, layers: &BTreeMap<Label, Facts>) -> Result<Vec<Item>, FactsError> {
  let items = match &feature.data {
    FeatureData::Install(install) => {
      let dst = normalize(&install.dst);
      let is_dir = install.src.to_string_lossy().ends_with('/') || install.dst.to_string_lossy().ends_with('/');
      if is_dir {
        vec![Item::dir(dst, install.mode)]
      } else {
        vec![Item::file(dst, install.mode)]
      }
    }
    FeatureData::EnsureDirsExist(dirs) => dirs
      .created_dirs()
      .into_iter()
      .map(|d| Item::dir(normalize(&d), Some(dirs.mode)))
      .collect(),
    FeatureData::Symlink(symlink) => vec![Item::Symlink {
      link: normalize(&symlink.link),
      target: symlink.target.clone(),
    }],
    FeatureData::User(user) => vec![Item::User {
      name: user.name.clone(),
      uid: user.uid,
    }],
    FeatureData::Group(group) => vec![Item::Group {
      name: group.name.clone(),
      gid: group.gid,
    }],
    FeatureData::KeyValueStore(kv) => vec![Item::KeyValue { key: kv.key.clone() }],
    FeatureData::Clone(clone) => {
      let src_facts = layer_facts(&feature.label, &clone.src_layer.label, layers)?;
      cloned_items(
        src_facts,
        &normalize(&clone.src_path),
        &normalize(&clone.dst_path),
        clone.omit_outer_dir,
        clone.pre_existing_dest,
      )
    }
    FeatureData::Extract(extract) => match &extract.source {
      ExtractSource::Layer { layer, binaries } => {
        let facts = layer_facts(&feature.label, &layer.label, layers)?;
        binaries
          .iter()
          .map(|b| {
            let path = normalize(b);
            let mode = match facts.get(&ItemKey::Path(path.clone())) {
              Some(Item::Path { mode, .. }) => *mode,
              _ => None,
            };
            Item::file(path, mode)
          })
          .collect()
      }
      ExtractSource::Buck { dst, .. } => vec![Item::file(normalize(dst), Some(0o555))],
    },
    FeatureData::Remove(_)
    | FeatureData::RemoveKeyValue(_)
    | FeatureData::UserMod(_)
    | FeatureData::Mount(_)
    | FeatureData::Requires(_)
    | FeatureData::Rpm(_)
    | FeatureData::Tarball(_)
    | FeatureData::RawCommand(_)
    | FeatureData::BuildinfoStamp(_) => Vec::new(),
  };
  Ok(items)
}

fn cloned_items(src_facts: &Facts, src: &Path, dst: &Path, omit_outer_dir: bool, pre_existing_dest: bool) -> Vec<Item> {
  let base = if !omit_outer_dir && pre_existing_dest {
    match src.file_name() {
      Some(name) => dst.join(name),
      None => dst.to_path_buf(),
    }
  } else {
    dst.to_path_buf()
  };

  src_facts
    .items()
    .filter_map(|item| {
      let path = item.key().path()?.to_path_buf();
      let rel = path.strip_prefix(src).ok()?;
      if omit_outer_dir && rel.as_os_str().is_empty() {
        return None;
      }
      let new_path = if rel.as_os_str().is_empty() {
        base.clone()
      } else {
        base.join(rel)
      };
      Some(match item {
        Item::Symlink { target, .. } => Item::Symlink {
          link: new_path,
          target: target.clone(),
        },
        Item::Path { file_type, mode, .. } => Item::Path {
          path: new_path,
          file_type: *file_type,
          mode: *mode,
        },
        other => other.clone(),
      })
    })
    .collect()
}

/// What the feature needs from the layer (or from other layers).
pub(crate) fn requires(feature: &Feature) -> Vec<Requirement> {
  match &feature.data {
    FeatureData::Install(install) => vec![
      dir_requirement(&parent_dir(&normalize(&install.dst))),
      Requirement::ordered(ItemKey::User(install.user.clone()), Validator::Exists),
      Requirement::ordered(ItemKey::Group(install.group.clone()), Validator::Exists),
    ],
    FeatureData::EnsureDirsExist(dirs) => vec![
      dir_requirement(&dirs.into_dir),
      Requirement::ordered(ItemKey::User(dirs.user.clone()), Validator::Exists),
      Requirement::ordered(ItemKey::Group(dirs.group.clone()), Validator::Exists),
    ],
    FeatureData::Symlink(symlink) => {
      let expected = if symlink.is_directory {
        Validator::FileType(FileType::Directory)
      } else {
        Validator::Exists
      };
      vec![
        dir_requirement(&parent_dir(&normalize(&symlink.link))),
        Requirement::unordered(ItemKey::Path(symlink.resolved_target()), expected),
      ]
    }
    FeatureData::User(user) => std::iter::once(&user.primary_group)
      .chain(user.supplementary_groups.iter())
      .map(|g| Requirement::ordered(ItemKey::Group(g.clone()), Validator::Exists))
      .collect(),
    FeatureData::UserMod(usermod) => std::iter::once(Requirement::ordered(
      ItemKey::User(usermod.username.clone()),
      Validator::Exists,
    ))
    .chain(
      usermod
        .add_supplementary_groups
        .iter()
        .map(|g| Requirement::ordered(ItemKey::Group(g.clone()), Validator::Exists)),
    )
    .collect(),
    FeatureData::Mount(mount) => {
      let (mountpoint, file_type, layer) = match &mount.source {
        MountFeatureSource::Layer { layer } => (
          mount.mountpoint.as_ref().or(layer.default_mountpoint.as_ref()),
          FileType::Directory,
          Some(layer),
        ),
        MountFeatureSource::Host { is_directory, .. } => (
          mount.mountpoint.as_ref(),
          if *is_directory { FileType::Directory } else { FileType::File },
          None,
        ),
      };
      let Some(mountpoint) = mountpoint else {
        return Vec::new();
      };
      let mut reqs = vec![Requirement::ordered(
        ItemKey::Path(normalize(mountpoint)),
        Validator::FileType(file_type),
      )];
      if let Some(layer) = layer {
        reqs.push(Requirement::ordered(
          ItemKey::Path(PathBuf::from("/")),
          Validator::ItemInLayer {
            layer: layer.label.clone(),
            validator: Box::new(Validator::Exists),
          },
        ));
      }
      reqs
    }
    FeatureData::Requires(req) => req
      .users
      .iter()
      .map(|u| Requirement::unordered(ItemKey::User(u.clone()), Validator::Exists))
      .chain(
        req
          .groups
          .iter()
          .map(|g| Requirement::unordered(ItemKey::Group(g.clone()), Validator::Exists)),
      )
      .chain(
        req
          .files
          .iter()
          .map(|f| Requirement::unordered(ItemKey::Path(normalize(f)), Validator::Exists)),
      )
      .collect(),
    FeatureData::Tarball(tarball) => vec![dir_requirement(&tarball.into_dir)],
    FeatureData::Clone(clone) => {
      let dst = normalize(&clone.dst_path);
      let dst_dir = if clone.pre_existing_dest { dst } else { parent_dir(&dst) };
      vec![
        dir_requirement(&dst_dir),
        Requirement::ordered(
          ItemKey::Path(normalize(&clone.src_path)),
          Validator::ItemInLayer {
            layer: clone.src_layer.label.clone(),
            validator: Box::new(if clone.omit_outer_dir {
              Validator::FileType(FileType::Directory)
            } else {
              Validator::Exists
            }),
          },
        ),
      ]
    }
    FeatureData::Extract(extract) => match &extract.source {
      ExtractSource::Layer { layer, binaries } => binaries
        .iter()
        .map(|b| {
          Requirement::ordered(
            ItemKey::Path(normalize(b)),
            Validator::ItemInLayer {
              layer: layer.label.clone(),
              validator: Box::new(Validator::Executable),
            },
          )
        })
        .collect(),
      ExtractSource::Buck { dst, .. } => vec![dir_requirement(&parent_dir(&normalize(dst)))],
    },
    FeatureData::KeyValueStore(kv) => kv
      .require_keys
      .iter()
      .map(|k| Requirement::ordered(ItemKey::KeyValue(k.clone()), Validator::Exists))
      .collect(),
    FeatureData::Remove(_)
    | FeatureData::RemoveKeyValue(_)
    | FeatureData::Group(_)
    | FeatureData::Rpm(_)
    | FeatureData::RawCommand(_)
    | FeatureData::BuildinfoStamp(_) => Vec::new(),
  }
}

/// The item a feature deletes and whether it must already exist.
pub(crate) fn removes(feature: &Feature) -> Option<(ItemKey, bool)> {
  match &feature.data {
    FeatureData::Remove(remove) => Some((ItemKey::Path(normalize(&remove.path)), remove.must_exist)),
    FeatureData::RemoveKeyValue(kv) => Some((ItemKey::KeyValue(kv.key.clone()), true)),
    _ => None,
  }
}
