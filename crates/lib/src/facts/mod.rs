//! The facts engine: an in-process depgraph backend.
//!
//! Facts are the set of items (paths, symlinks, users, groups, key-value
//! keys) a layer is known to contain. Each phase derives new facts from the
//! previous phase's facts plus what its features provide, checks that every
//! feature's requirements hold, and serializes the result so later phases
//! and child layers can validate against it without scanning a filesystem.
//!
//! # Submodules
//!
//! - [`item`] - Items, keys and requirement validators
//! - [`observe`] - Re-deriving path facts from a materialized tree

pub mod item;
pub mod observe;
mod provides;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::compiler::{BackendError, DepgraphArtifact, DepgraphRequest, Depgrapher};
use crate::feature::data::normalize;
use crate::feature::{Feature, FeatureData, Label};
use crate::mount::Mount;

use item::{Item, ItemKey, Validator};
use observe::Observed;

/// Symlink hops followed before giving up on resolving a path.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Error)]
pub enum FactsError {
  #[error("{key} is provided by both {existing} and {duplicate}")]
  Conflict {
    key: ItemKey,
    existing: String,
    duplicate: Label,
  },

  #[error("{key} is required by {label} but was never provided")]
  MissingItem { label: Label, key: ItemKey },

  #[error("{key} exists but {label} requires it {expected}")]
  Unsatisfied {
    label: Label,
    key: ItemKey,
    expected: String,
  },

  #[error("{label}: symlink {link} points to {target}, which does not exist")]
  DanglingSymlink {
    label: Label,
    link: PathBuf,
    target: PathBuf,
  },

  #[error("ordering cycle between features: {}", join_labels(.labels))]
  Cycle { labels: Vec<Label> },

  #[error("{label} reads layer {layer}, but its facts were not provided")]
  MissingLayerFacts { label: Label, layer: Label },

  #[error("{key} is required by {label} in layer {layer} but does not exist there")]
  MissingInLayer { label: Label, layer: Label, key: ItemKey },

  #[error("failed to load facts from {path}: {message}")]
  Load { path: PathBuf, message: String },

  #[error("failed to observe {root}: {message}")]
  Observe { root: PathBuf, message: String },
}

fn join_labels(labels: &[Label]) -> String {
  labels.iter().map(Label::as_str).collect::<Vec<_>>().join(", ")
}

/// The serialized facts of a layer at the end of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facts {
  pub label: Label,
  #[serde(with = "item_list")]
  items: BTreeMap<ItemKey, Item>,
  /// Mountpoints; nothing below them is validated.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub mounts: Vec<PathBuf>,
}

mod item_list {
  use std::collections::BTreeMap;

  use serde::{Deserialize, Deserializer, Serializer};

  use super::item::{Item, ItemKey};

  pub fn serialize<S: Serializer>(items: &BTreeMap<ItemKey, Item>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(items.values())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<ItemKey, Item>, D::Error> {
    let items = Vec::<Item>::deserialize(deserializer)?;
    Ok(items.into_iter().map(|item| (item.key(), item)).collect())
  }
}

impl Facts {
  /// Facts of an empty layer: `/`, plus the root user and group that every
  /// system has.
  pub fn root(label: Label) -> Self {
    let items = [
      Item::dir("/", Some(0o755)),
      Item::User {
        name: "root".to_string(),
        uid: Some(0),
      },
      Item::Group {
        name: "root".to_string(),
        gid: Some(0),
      },
    ];
    Self {
      label,
      items: items.into_iter().map(|i| (i.key(), i)).collect(),
      mounts: Vec::new(),
    }
  }

  pub fn load(path: &Path) -> Result<Self, FactsError> {
    let load_err = |message: String| FactsError::Load {
      path: path.to_path_buf(),
      message,
    };
    let contents = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| load_err(e.to_string()))
  }

  pub fn items(&self) -> impl Iterator<Item = &Item> {
    self.items.values()
  }

  pub fn get(&self, key: &ItemKey) -> Option<&Item> {
    self.items.get(key)
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  fn insert(&mut self, item: Item) {
    self.items.insert(item.key(), item);
  }

  /// Remove an item and, for paths, everything below it. Returns whether
  /// anything was there.
  fn remove_tree(&mut self, key: &ItemKey) -> bool {
    match key {
      ItemKey::Path(path) => {
        let before = self.items.len();
        self
          .items
          .retain(|k, _| !matches!(k, ItemKey::Path(p) if p.starts_with(path)));
        self.items.len() != before
      }
      other => self.items.remove(other).is_some(),
    }
  }

  /// Strictly below a mountpoint. The mountpoint itself belongs to the layer.
  fn is_under_mount(&self, path: &Path) -> bool {
    self.mounts.iter().any(|m| path != m && path.starts_with(m))
  }

  /// Replace every fact of the kinds `observed` describes.
  fn apply_observed(&mut self, observed: Observed) {
    self.items.retain(|k, _| !matches!(k, ItemKey::Path(_)));
    for item in observed.paths {
      self.insert(item);
    }
    if let Some(users) = observed.users {
      self.items.retain(|k, _| !matches!(k, ItemKey::User(_)));
      users.into_iter().for_each(|u| self.insert(u));
    }
    if let Some(groups) = observed.groups {
      self.items.retain(|k, _| !matches!(k, ItemKey::Group(_)));
      groups.into_iter().for_each(|g| self.insert(g));
    }
  }

  /// Look up an item, resolving symlinks in the path and at its end.
  pub fn resolve(&self, key: &ItemKey) -> Option<&Item> {
    let ItemKey::Path(path) = key else {
      return self.items.get(key);
    };

    let mut hops = 0;
    let mut current = PathBuf::from("/");
    let mut pending = reversed_parts(path);

    while let Some(part) = pending.pop() {
      let candidate = normalize(&current.join(&part));
      match self.items.get(&ItemKey::Path(candidate.clone())) {
        Some(Item::Symlink { target, .. }) => {
          hops += 1;
          if hops > MAX_SYMLINK_HOPS {
            return None;
          }
          let target = normalize(&current.join(target));
          current = PathBuf::from("/");
          pending.extend(reversed_parts(&target));
        }
        Some(_) => current = candidate,
        None => return None,
      }
    }

    self.items.get(&ItemKey::Path(current))
  }
}

fn reversed_parts(path: &Path) -> Vec<PathBuf> {
  path
    .components()
    .rev()
    .filter_map(|c| match c {
      std::path::Component::Normal(part) => Some(PathBuf::from(part)),
      _ => None,
    })
    .collect()
}

/// Inputs for deriving one phase's facts.
pub struct FactsInput<'a> {
  pub label: &'a Label,
  pub features: &'a [Feature],
  /// Facts of the previous phase or parent layer. `None` starts from an
  /// empty layer.
  pub parent: Option<Facts>,
  /// Facts of every layer the features read, by label.
  pub layers: BTreeMap<Label, Facts>,
  pub mounts: &'a [Mount],
  /// When set, path facts come from the filesystem instead of the features.
  pub observed: Option<Observed>,
}

/// Derive and validate the facts of a phase.
pub fn derive(input: FactsInput<'_>) -> Result<Facts, FactsError> {
  let FactsInput {
    label,
    features,
    parent,
    layers,
    mounts,
    observed,
  } = input;

  let mut facts = match parent {
    Some(mut parent) => {
      parent.label = label.clone();
      parent
    }
    None => Facts::root(label.clone()),
  };
  for mount in mounts {
    if !facts.mounts.contains(&mount.mountpoint) {
      facts.mounts.push(mount.mountpoint.clone());
    }
  }

  for feature in features {
    if let Some((key, must_exist)) = provides::removes(feature) {
      let under_mount = key.path().is_some_and(|p| facts.is_under_mount(p));
      if !facts.remove_tree(&key) && must_exist && !under_mount {
        return Err(FactsError::MissingItem {
          label: feature.label.clone(),
          key,
        });
      }
    }
  }

  let mut provided: BTreeMap<ItemKey, (usize, Item)> = BTreeMap::new();
  for (idx, feature) in features.iter().enumerate() {
    for item in provides::provides(feature, &layers)? {
      let key = item.key();
      if let Some((other, existing)) = provided.get(&key) {
        if !existing.compatible_with(&item) {
          return Err(FactsError::Conflict {
            key,
            existing: features[*other].label.to_string(),
            duplicate: feature.label.clone(),
          });
        }
        continue;
      }
      if let Some(existing) = facts.get(&key)
        && !existing.compatible_with(&item)
      {
        return Err(FactsError::Conflict {
          key,
          existing: format!("an earlier phase or parent of {label}"),
          duplicate: feature.label.clone(),
        });
      }
      provided.insert(key, (idx, item));
    }
  }

  check_ordering(features, &provided)?;

  for (_, item) in provided.into_values() {
    let key = item.key();
    if facts.get(&key).is_none() {
      facts.insert(item);
    }
  }

  if let Some(observed) = observed {
    facts.apply_observed(observed);
  }

  for feature in features {
    for req in provides::requires(feature) {
      check_requirement(&facts, &layers, feature, &req.key, &req.validator)?;
    }
  }

  Ok(facts)
}

/// Ordered requirements between features of the same phase must form a DAG.
fn check_ordering(features: &[Feature], provided: &BTreeMap<ItemKey, (usize, Item)>) -> Result<(), FactsError> {
  let mut graph: DiGraph<usize, ()> = DiGraph::new();
  let nodes: Vec<NodeIndex> = (0..features.len()).map(|i| graph.add_node(i)).collect();

  for (idx, feature) in features.iter().enumerate() {
    for req in provides::requires(feature) {
      if !req.ordered || matches!(req.validator, Validator::ItemInLayer { .. }) {
        continue;
      }
      if let Some((provider, _)) = provided.get(&req.key)
        && *provider != idx
      {
        graph.update_edge(nodes[*provider], nodes[idx], ());
      }
    }
  }

  if let Err(cycle) = toposort(&graph, None) {
    let labels = tarjan_scc(&graph)
      .into_iter()
      .find(|scc| scc.contains(&cycle.node_id()))
      .unwrap_or_else(|| vec![cycle.node_id()])
      .into_iter()
      .map(|n| features[graph[n]].label.clone())
      .collect();
    return Err(FactsError::Cycle { labels });
  }
  Ok(())
}

fn check_requirement(
  facts: &Facts,
  layers: &BTreeMap<Label, Facts>,
  feature: &Feature,
  key: &ItemKey,
  validator: &Validator,
) -> Result<(), FactsError> {
  let label = &feature.label;

  if let Validator::ItemInLayer { layer, validator } = validator {
    let layer_facts = layers.get(layer).ok_or_else(|| FactsError::MissingLayerFacts {
      label: label.clone(),
      layer: layer.clone(),
    })?;
    let item = layer_facts.resolve(key).ok_or_else(|| FactsError::MissingInLayer {
      label: label.clone(),
      layer: layer.clone(),
      key: key.clone(),
    })?;
    if !validator.satisfies(item) {
      return Err(FactsError::Unsatisfied {
        label: label.clone(),
        key: key.clone(),
        expected: format!("{validator} in layer {layer}"),
      });
    }
    return Ok(());
  }

  if key.path().is_some_and(|p| facts.is_under_mount(p)) {
    return Ok(());
  }

  let Some(item) = facts.resolve(key) else {
    if let FeatureData::Symlink(symlink) = &feature.data
      && key.path() == Some(symlink.resolved_target().as_path())
    {
      return Err(FactsError::DanglingSymlink {
        label: label.clone(),
        link: symlink.link.clone(),
        target: symlink.target.clone(),
      });
    }
    return Err(FactsError::MissingItem {
      label: label.clone(),
      key: key.clone(),
    });
  };

  if !validator.satisfies(item) {
    return Err(FactsError::Unsatisfied {
      label: label.clone(),
      key: key.clone(),
      expected: validator.to_string(),
    });
  }
  Ok(())
}

/// The facts engine as a depgraph backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeDepgrapher;

#[async_trait]
impl Depgrapher for NativeDepgrapher {
  async fn depgraph(&self, req: &DepgraphRequest<'_>) -> Result<DepgraphArtifact, BackendError> {
    let ctx = req.ctx;
    let parent = req.parent.map(|p| Facts::load(&p.path)).transpose()?;

    let mut layers = BTreeMap::new();
    for layer in &req.layers {
      layers.insert(layer.label.clone(), Facts::load(&layer.depgraph.path)?);
    }

    let observed = match req.observe {
      Some(root) => {
        debug!(label = %ctx.label, phase = %ctx.phase, root = %root.display(), "observing subvolume");
        Some(observe::observe(root)?)
      }
      None => None,
    };

    let facts = derive(FactsInput {
      label: ctx.label,
      features: ctx.features,
      parent,
      layers,
      mounts: ctx.mounts,
      observed,
    })?;

    if let Some(dir) = req.out.parent() {
      fs::create_dir_all(dir)?;
    }
    fs::write(req.out, serde_json::to_vec_pretty(&facts)?)?;
    info!(label = %ctx.label, phase = %ctx.phase, items = facts.len(), "wrote depgraph");

    DepgraphArtifact::from_file(req.out)
  }
}
