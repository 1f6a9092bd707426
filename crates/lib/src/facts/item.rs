//! Items: the things a layer's filesystem is made of, as far as facts go.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::feature::Label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
  File,
  Directory,
  Symlink,
}

impl std::fmt::Display for FileType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FileType::File => write!(f, "file"),
      FileType::Directory => write!(f, "directory"),
      FileType::Symlink => write!(f, "symlink"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Item {
  Path {
    path: PathBuf,
    file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
  },
  Symlink {
    link: PathBuf,
    target: PathBuf,
  },
  User {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uid: Option<u32>,
  },
  Group {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gid: Option<u32>,
  },
  KeyValue {
    key: String,
  },
}

impl Item {
  pub fn file(path: impl Into<PathBuf>, mode: Option<u32>) -> Self {
    Item::Path {
      path: path.into(),
      file_type: FileType::File,
      mode,
    }
  }

  pub fn dir(path: impl Into<PathBuf>, mode: Option<u32>) -> Self {
    Item::Path {
      path: path.into(),
      file_type: FileType::Directory,
      mode,
    }
  }

  pub fn key(&self) -> ItemKey {
    match self {
      Item::Path { path, .. } => ItemKey::Path(path.clone()),
      Item::Symlink { link, .. } => ItemKey::Path(link.clone()),
      Item::User { name, .. } => ItemKey::User(name.clone()),
      Item::Group { name, .. } => ItemKey::Group(name.clone()),
      Item::KeyValue { key } => ItemKey::KeyValue(key.clone()),
    }
  }

  pub fn file_type(&self) -> Option<FileType> {
    match self {
      Item::Path { file_type, .. } => Some(*file_type),
      Item::Symlink { .. } => Some(FileType::Symlink),
      _ => None,
    }
  }

  /// Two providers of the same key may coexist if they describe the same
  /// item, or if both only ensure a directory exists.
  pub fn compatible_with(&self, other: &Item) -> bool {
    self == other || (self.file_type() == Some(FileType::Directory) && other.file_type() == Some(FileType::Directory))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKey {
  Path(PathBuf),
  User(String),
  Group(String),
  KeyValue(String),
}

impl ItemKey {
  pub fn path(&self) -> Option<&Path> {
    match self {
      ItemKey::Path(path) => Some(path),
      _ => None,
    }
  }
}

impl std::fmt::Display for ItemKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ItemKey::Path(path) => write!(f, "path {}", path.display()),
      ItemKey::User(name) => write!(f, "user {name}"),
      ItemKey::Group(name) => write!(f, "group {name}"),
      ItemKey::KeyValue(key) => write!(f, "key {key}"),
    }
  }
}

/// Extra checks on an item beyond its existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validator {
  Exists,
  FileType(FileType),
  Executable,
  /// The key must exist in another layer's facts, checked with `validator`.
  ItemInLayer { layer: Label, validator: Box<Validator> },
}

impl Validator {
  /// Check an item already resolved through symlinks.
  pub fn satisfies(&self, item: &Item) -> bool {
    match self {
      Validator::Exists => true,
      Validator::FileType(expected) => item.file_type() == Some(*expected),
      Validator::Executable => match item {
        Item::Path {
          file_type: FileType::File,
          mode,
          ..
        } => mode.is_none_or(|m| m & 0o111 != 0),
        _ => false,
      },
      Validator::ItemInLayer { validator, .. } => validator.satisfies(item),
    }
  }
}

impl std::fmt::Display for Validator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Validator::Exists => write!(f, "to exist"),
      Validator::FileType(t) => write!(f, "to be a {t}"),
      Validator::Executable => write!(f, "to be an executable file"),
      Validator::ItemInLayer { layer, validator } => write!(f, "{validator} in layer {layer}"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
  pub key: ItemKey,
  pub validator: Validator,
  /// The provider must be applied before the requiring feature.
  pub ordered: bool,
}

impl Requirement {
  pub fn ordered(key: ItemKey, validator: Validator) -> Self {
    Self {
      key,
      validator,
      ordered: true,
    }
  }

  pub fn unordered(key: ItemKey, validator: Validator) -> Self {
    Self {
      key,
      validator,
      ordered: false,
    }
  }
}
