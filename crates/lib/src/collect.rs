//! Feature collection and deduplication.
//!
//! Layers receive their features as arbitrarily nested lists mixed with
//! references to pre-built feature sets. [`Collector`] flattens them with an
//! explicit worklist and keys every feature by its identity, so the same
//! statement reached through several composition paths is kept once.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::feature::{ComposeError, Feature, FeatureData, Label, PackageActionAccumulator};
use crate::util::hash::ObjectHash;

/// Reference to a feature set built elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureSetRef {
  pub feature_set: PathBuf,
}

impl std::fmt::Display for FeatureSetRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.feature_set.display())
  }
}

/// One entry of a feature list as written by a layer definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureSpec {
  Set(FeatureSetRef),
  List(Vec<FeatureSpec>),
  Feature(Box<Feature>),
}

impl From<Feature> for FeatureSpec {
  fn from(feature: Feature) -> Self {
    FeatureSpec::Feature(Box::new(feature))
  }
}

impl From<Vec<FeatureSpec>> for FeatureSpec {
  fn from(list: Vec<FeatureSpec>) -> Self {
    FeatureSpec::List(list)
  }
}

/// Loads the contents of a referenced feature set.
///
/// Artifact resolution belongs to whatever drives the build, so the
/// collector only sees this seam.
pub trait FeatureSetResolver {
  fn resolve(&self, set: &FeatureSetRef) -> Result<Vec<FeatureSpec>, ComposeError>;
}

/// Resolves feature sets stored as JSON lists on disk.
#[derive(Debug, Clone, Default)]
pub struct JsonFileResolver {
  base_dir: Option<PathBuf>,
}

impl JsonFileResolver {
  /// Relative feature-set paths are resolved against `base_dir`.
  pub fn new(base_dir: impl Into<PathBuf>) -> Self {
    Self {
      base_dir: Some(base_dir.into()),
    }
  }

  fn path_for(&self, set: &FeatureSetRef) -> PathBuf {
    match &self.base_dir {
      Some(base) if set.feature_set.is_relative() => base.join(&set.feature_set),
      _ => set.feature_set.clone(),
    }
  }
}

impl FeatureSetResolver for JsonFileResolver {
  fn resolve(&self, set: &FeatureSetRef) -> Result<Vec<FeatureSpec>, ComposeError> {
    let path = self.path_for(set);
    let unresolved = |message: String| ComposeError::UnresolvedFeatureSet {
      set: set.to_string(),
      message,
    };

    let contents = fs::read_to_string(&path).map_err(|e| unresolved(format!("{}: {e}", path.display())))?;
    let specs: Vec<FeatureSpec> = serde_json::from_str(&contents).map_err(|e| unresolved(e.to_string()))?;

    // Nested relative references are relative to the file that names them.
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok(flatten_relative_to(specs, &dir))
  }
}

/// Flatten nested lists and anchor relative feature-set references at `dir`.
fn flatten_relative_to(specs: Vec<FeatureSpec>, dir: &Path) -> Vec<FeatureSpec> {
  let mut stack: Vec<FeatureSpec> = specs.into_iter().rev().collect();
  let mut out = Vec::new();

  while let Some(spec) = stack.pop() {
    match spec {
      FeatureSpec::List(items) => stack.extend(items.into_iter().rev()),
      FeatureSpec::Set(set) if set.feature_set.is_relative() => out.push(FeatureSpec::Set(FeatureSetRef {
        feature_set: dir.join(&set.feature_set),
      })),
      other => out.push(other),
    }
  }
  out
}

/// The flattened, deduplicated features of one layer.
#[derive(Debug, Default)]
pub struct Collection {
  order: Vec<ObjectHash>,
  features: BTreeMap<ObjectHash, Feature>,
  provenance: BTreeMap<ObjectHash, BTreeSet<Label>>,
  feature_sets: BTreeSet<FeatureSetRef>,
}

impl Collection {
  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  /// Unique features in first-seen order.
  pub fn features(&self) -> impl Iterator<Item = &Feature> {
    self.order.iter().filter_map(|id| self.features.get(id))
  }

  /// Every label that declared the feature with this identity.
  pub fn declared_by(&self, identity: &ObjectHash) -> Option<&BTreeSet<Label>> {
    self.provenance.get(identity)
  }

  /// Feature-set references that were recorded instead of expanded.
  pub fn feature_sets(&self) -> &BTreeSet<FeatureSetRef> {
    &self.feature_sets
  }

  fn insert(&mut self, feature: Feature) -> Result<(), ComposeError> {
    feature.validate()?;
    let identity = feature.identity()?;

    if let Some(existing) = self.features.get(&identity) {
      if existing.data != feature.data || existing.resources != feature.resources {
        return Err(ComposeError::IdentityCollision {
          identity,
          existing: existing.label.clone(),
          duplicate: feature.label,
        });
      }
      trace!(identity = %identity, label = %feature.label, "duplicate feature collapsed");
      self.provenance.entry(identity).or_default().insert(feature.label);
      return Ok(());
    }

    self
      .provenance
      .entry(identity.clone())
      .or_default()
      .insert(feature.label.clone());
    self.order.push(identity.clone());
    self.features.insert(identity, feature);
    Ok(())
  }

  /// The features handed to the phase partitioner.
  ///
  /// Package actions are folded into one feature labelled with the layer,
  /// keeping the declaring labels as per-item provenance.
  pub fn into_features(self, layer: &Label) -> Result<Vec<Feature>, ComposeError> {
    let Collection {
      order,
      mut features,
      provenance,
      ..
    } = self;

    let mut packages = PackageActionAccumulator::new();
    let mut out = Vec::with_capacity(order.len());

    for identity in order {
      let Some(feature) = features.remove(&identity) else {
        continue;
      };
      if matches!(feature.data, FeatureData::Rpm(_)) {
        let labels = provenance.get(&identity).cloned().unwrap_or_default();
        packages.push(&feature, &labels)?;
      } else {
        out.push(feature);
      }
    }

    if let Some(merged) = packages.finish(layer)? {
      debug!(layer = %layer, "merged package actions into one feature");
      out.push(merged);
    }
    Ok(out)
  }
}

/// Flattens feature specs into a [`Collection`].
pub struct Collector<'a> {
  resolver: Option<&'a dyn FeatureSetResolver>,
  expanded: BTreeSet<FeatureSetRef>,
  collection: Collection,
}

impl<'a> Collector<'a> {
  /// A collector that records feature-set references without expanding them.
  pub fn new() -> Self {
    Self {
      resolver: None,
      expanded: BTreeSet::new(),
      collection: Collection::default(),
    }
  }

  /// A collector that expands every feature-set reference (each at most once).
  pub fn with_resolver(resolver: &'a dyn FeatureSetResolver) -> Self {
    Self {
      resolver: Some(resolver),
      ..Self::new()
    }
  }

  pub fn add(&mut self, spec: FeatureSpec) -> Result<(), ComposeError> {
    let mut stack = vec![spec];

    while let Some(spec) = stack.pop() {
      match spec {
        FeatureSpec::Feature(feature) => self.collection.insert(*feature)?,
        FeatureSpec::List(items) => stack.extend(items.into_iter().rev()),
        FeatureSpec::Set(set) => match self.resolver {
          Some(resolver) => {
            if !self.expanded.insert(set.clone()) {
              continue;
            }
            debug!(feature_set = %set, "expanding feature set");
            stack.extend(resolver.resolve(&set)?.into_iter().rev());
          }
          None => {
            self.collection.feature_sets.insert(set);
          }
        },
      }
    }
    Ok(())
  }

  pub fn finish(self) -> Collection {
    self.collection
  }
}

impl Default for Collector<'_> {
  fn default() -> Self {
    Self::new()
  }
}

/// Flatten `specs`, recording feature-set references unexpanded.
pub fn collect(specs: impl IntoIterator<Item = FeatureSpec>) -> Result<Collection, ComposeError> {
  let mut collector = Collector::new();
  for spec in specs {
    collector.add(spec)?;
  }
  Ok(collector.finish())
}

/// Flatten `specs`, expanding feature-set references through `resolver`.
pub fn collect_with(
  specs: impl IntoIterator<Item = FeatureSpec>,
  resolver: &dyn FeatureSetResolver,
) -> Result<Collection, ComposeError> {
  let mut collector = Collector::with_resolver(resolver);
  for spec in specs {
    collector.add(spec)?;
  }
  Ok(collector.finish())
}
