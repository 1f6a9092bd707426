//! Deriving facts from a materialized filesystem.
//!
//! Used after phases whose effects can't be predicted from their features
//! (package transactions, tarballs, raw commands): the facts describe what is
//! actually there rather than what was declared.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use super::FactsError;
use super::item::{FileType, Item};

/// Facts found by walking a directory tree.
#[derive(Debug, Default)]
pub struct Observed {
  /// Paths and symlinks, keyed relative to the walked root.
  pub paths: Vec<Item>,
  /// `None` if the tree has no `etc/passwd`.
  pub users: Option<Vec<Item>>,
  /// `None` if the tree has no `etc/group`.
  pub groups: Option<Vec<Item>>,
}

pub fn observe(root: &Path) -> Result<Observed, FactsError> {
  let observe_err = |message: String| FactsError::Observe {
    root: root.to_path_buf(),
    message,
  };

  let mut paths = Vec::new();
  for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
    let entry = entry.map_err(|e| observe_err(e.to_string()))?;
    let rel = entry
      .path()
      .strip_prefix(root)
      .map_err(|e| observe_err(e.to_string()))?;
    let path = PathBuf::from("/").join(rel);
    let file_type = entry.file_type();

    if file_type.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| observe_err(e.to_string()))?;
      paths.push(Item::Symlink { link: path, target });
      continue;
    }

    let metadata = entry.metadata().map_err(|e| observe_err(e.to_string()))?;
    paths.push(Item::Path {
      path,
      file_type: if file_type.is_dir() {
        FileType::Directory
      } else {
        FileType::File
      },
      mode: mode_of(&metadata),
    });
  }

  let users = read_db(&root.join("etc/passwd"))
    .map_err(|e| observe_err(e.to_string()))?
    .map(|entries| {
      entries
        .into_iter()
        .map(|(name, id)| Item::User { name, uid: id })
        .collect()
    });
  let groups = read_db(&root.join("etc/group"))
    .map_err(|e| observe_err(e.to_string()))?
    .map(|entries| {
      entries
        .into_iter()
        .map(|(name, id)| Item::Group { name, gid: id })
        .collect()
    });

  debug!(root = %root.display(), entries = paths.len(), "observed filesystem");
  Ok(Observed { paths, users, groups })
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> Option<u32> {
  use std::os::unix::fs::PermissionsExt;
  Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> Option<u32> {
  None
}

/// Parse `name:x:id:...` lines of a passwd or group file.
fn read_db(path: &Path) -> std::io::Result<Option<Vec<(String, Option<u32>)>>> {
  if !path.exists() {
    return Ok(None);
  }
  let contents = fs::read_to_string(path)?;
  let entries = contents
    .lines()
    .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
    .filter_map(|line| {
      let mut fields = line.split(':');
      let name = fields.next()?.to_string();
      let id = fields.nth(1).and_then(|id| id.parse().ok());
      Some((name, id))
    })
    .collect();
  Ok(Some(entries))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::facts::item::ItemKey;
  use tempfile::TempDir;

  #[test]
  fn walks_paths_and_databases() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::write(root.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000::/home/app:/bin/sh\n").unwrap();
    fs::write(root.join("etc/group"), "root:x:0:\napp:x:1000:\n").unwrap();
    fs::write(root.join("etc/app.conf"), "x").unwrap();

    let observed = observe(root).unwrap();
    let keys: Vec<_> = observed.paths.iter().map(Item::key).collect();

    assert!(keys.contains(&ItemKey::Path(PathBuf::from("/"))));
    assert!(keys.contains(&ItemKey::Path(PathBuf::from("/etc"))));
    assert!(keys.contains(&ItemKey::Path(PathBuf::from("/etc/app.conf"))));

    let users = observed.users.unwrap();
    assert_eq!(
      users[1],
      Item::User {
        name: "app".to_string(),
        uid: Some(1000)
      }
    );
    assert_eq!(observed.groups.unwrap().len(), 2);
  }

  #[cfg(unix)]
  #[test]
  fn records_symlinks_without_following() {
    let temp = TempDir::new().unwrap();
    std::os::unix::fs::symlink("/nowhere", temp.path().join("dangling")).unwrap();

    let observed = observe(temp.path()).unwrap();
    assert!(observed.paths.contains(&Item::Symlink {
      link: PathBuf::from("/dangling"),
      target: PathBuf::from("/nowhere"),
    }));
    assert!(observed.users.is_none());
  }
}
