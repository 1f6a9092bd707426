//! Package-manager actions.
//!
//! Every `rpms` statement in a layer becomes its own [`Feature`] during
//! composition so that deduplication works per statement. Before the phase
//! executor sees them they are folded into a single feature by
//! [`PackageActionAccumulator`], since one package transaction has to be
//! solved for the whole layer at once.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::{ComposeError, Feature, FeatureData, Label, Resources};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpmAction {
  Install,
  RemoveIfExists,
}

impl std::fmt::Display for RpmAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RpmAction::Install => write!(f, "install"),
      RpmAction::RemoveIfExists => write!(f, "remove_if_exists"),
    }
  }
}

/// What a single package action operates on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RpmSource {
  /// A package name (or NEVRA) resolved by the solver.
  Subject(String),
  /// A package file produced by the build tool.
  Src(PathBuf),
}

impl std::fmt::Display for RpmSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RpmSource::Subject(subject) => write!(f, "{subject}"),
      RpmSource::Src(src) => write!(f, "{}", src.display()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmItem {
  pub action: RpmAction,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subject: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub src: Option<PathBuf>,
  /// Labels of the statements that asked for this action.
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub provenance: BTreeSet<Label>,
}

impl RpmItem {
  pub fn new(action: RpmAction, source: RpmSource) -> Self {
    let (subject, src) = match source {
      RpmSource::Subject(subject) => (Some(subject), None),
      RpmSource::Src(src) => (None, Some(src)),
    };
    Self {
      action,
      subject,
      src,
      provenance: BTreeSet::new(),
    }
  }

  /// The subject or src of this item. Exactly one must be set.
  pub fn source(&self, label: &Label) -> Result<RpmSource, ComposeError> {
    match (&self.subject, &self.src) {
      (Some(subject), None) => Ok(RpmSource::Subject(subject.clone())),
      (None, Some(src)) => Ok(RpmSource::Src(src.clone())),
      (Some(_), Some(_)) => Err(ComposeError::ConflictingOptions {
        label: label.clone(),
        message: "rpm item sets both subject and src".to_string(),
      }),
      (None, None) => Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "items",
        message: "rpm item needs either a subject or a src".to_string(),
      }),
    }
  }
}

/// A package transaction: an ordered list of install/remove actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpm {
  pub items: Vec<RpmItem>,
}

impl Rpm {
  pub(crate) fn validate(&self, label: &Label) -> Result<(), ComposeError> {
    if self.items.is_empty() {
      return Err(ComposeError::InvalidField {
        label: label.clone(),
        field: "items",
        message: "package action has no items".to_string(),
      });
    }
    let (mut subjects, mut srcs) = (0, 0);
    for item in &self.items {
      match item.source(label)? {
        RpmSource::Subject(subject) if subject.trim().is_empty() => {
          return Err(ComposeError::InvalidField {
            label: label.clone(),
            field: "subject",
            message: "must not be empty".to_string(),
          });
        }
        RpmSource::Subject(_) => subjects += 1,
        RpmSource::Src(_) => srcs += 1,
      }
    }
    if subjects > 0 && srcs > 0 {
      return Err(ComposeError::ConflictingOptions {
        label: label.clone(),
        message: "a package statement names packages by subject or by src, not both".to_string(),
      });
    }
    Ok(())
  }
}

/// Build one package-action feature from a statement.
///
/// A statement names packages either by subject or by artifact dependency,
/// never both: mixing them would make the solver's view of the request
/// ambiguous.
pub fn rpms(
  label: impl Into<Label>,
  action: RpmAction,
  subjects: &[&str],
  deps: &[PathBuf],
) -> Result<Feature, ComposeError> {
  let label = label.into();
  if !subjects.is_empty() && !deps.is_empty() {
    return Err(ComposeError::ConflictingOptions {
      label,
      message: "'subjects' and 'deps' are mutually exclusive".to_string(),
    });
  }

  let items = subjects
    .iter()
    .map(|s| RpmSource::Subject((*s).to_string()))
    .chain(deps.iter().cloned().map(RpmSource::Src))
    .map(|source| RpmItem::new(action, source))
    .collect();

  let mut feature = Feature::new(label, FeatureData::Rpm(Rpm { items }));
  for dep in deps {
    feature.resources.artifacts.insert(dep.clone());
  }
  feature.validate()?;
  Ok(feature)
}

/// Folds every package-action feature of a layer into one.
///
/// Items are keyed by `(action, source)`, so the result is sorted and free
/// of duplicates regardless of the order statements were declared in. Each
/// item remembers which labels asked for it.
#[derive(Debug, Default)]
pub struct PackageActionAccumulator {
  items: BTreeMap<(RpmAction, RpmSource), BTreeSet<Label>>,
  resources: Resources,
}

impl PackageActionAccumulator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Add every item of an rpm feature.
  pub fn push(&mut self, feature: &Feature, provenance: &BTreeSet<Label>) -> Result<(), ComposeError> {
    let FeatureData::Rpm(rpm) = &feature.data else {
      return Ok(());
    };

    for item in &rpm.items {
      let source = item.source(&feature.label)?;
      let labels = self.items.entry((item.action, source)).or_default();
      labels.extend(item.provenance.iter().cloned());
      labels.extend(provenance.iter().cloned());
      labels.insert(feature.label.clone());
    }
    self.resources.merge(&feature.resources);
    Ok(())
  }

  /// Produce the merged feature, or `None` if nothing was pushed.
  pub fn finish(self, layer: &Label) -> Result<Option<Feature>, ComposeError> {
    if self.items.is_empty() {
      return Ok(None);
    }

    for ((action, source), labels) in &self.items {
      if *action == RpmAction::Install && self.items.contains_key(&(RpmAction::RemoveIfExists, source.clone())) {
        let existing = labels.iter().next().cloned().unwrap_or_else(|| layer.clone());
        return Err(ComposeError::ConflictingOptions {
          label: existing,
          message: format!("package '{source}' is both installed and removed in layer {layer}"),
        });
      }
    }

    let items = self
      .items
      .into_iter()
      .map(|((action, source), provenance)| {
        let mut item = RpmItem::new(action, source);
        item.provenance = provenance;
        item
      })
      .collect();

    Ok(Some(Feature {
      label: layer.clone(),
      data: FeatureData::Rpm(Rpm { items }),
      resources: self.resources,
    }))
  }
}
