//! Build phases and feature partitioning.
//!
//! Features within a layer are unordered, but some of them are not safe to
//! apply in the same step as others: a package transaction may rewrite
//! arbitrary paths, and removals must observe everything else first. A layer
//! is therefore built in a fixed sequence of phases, each one applied on top
//! of the previous phase's result.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::feature::Feature;
use crate::layer::LayerRef;

/// Phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
  PackageManager,
  Compile,
  Remove,
  BuildinfoStamp,
}

impl BuildPhase {
  pub const ALL: [BuildPhase; 4] = [
    BuildPhase::PackageManager,
    BuildPhase::Compile,
    BuildPhase::Remove,
    BuildPhase::BuildinfoStamp,
  ];

  /// Position in [`BuildPhase::ALL`].
  pub const fn index(self) -> usize {
    match self {
      BuildPhase::PackageManager => 0,
      BuildPhase::Compile => 1,
      BuildPhase::Remove => 2,
      BuildPhase::BuildinfoStamp => 3,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      BuildPhase::PackageManager => "package_manager",
      BuildPhase::Compile => "compile",
      BuildPhase::Remove => "remove",
      BuildPhase::BuildinfoStamp => "buildinfo_stamp",
    }
  }
}

impl std::fmt::Display for BuildPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The features applied by one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSet {
  pub phase: BuildPhase,
  pub features: Vec<Feature>,
}

impl PhaseSet {
  /// Any feature needs an external decision before it can be applied.
  pub fn requires_planning(&self) -> bool {
    self.features.iter().any(Feature::requires_planning)
  }

  /// The declared features fully describe the phase's effect on the
  /// filesystem, so facts derived from them are exact.
  pub fn is_predictable(&self) -> bool {
    self.phase != BuildPhase::PackageManager && self.features.iter().all(Feature::is_predictable)
  }

  /// Every layer read by a feature of this phase, deduplicated.
  pub fn dependency_layers(&self) -> BTreeSet<&LayerRef> {
    self.features.iter().flat_map(|f| f.resources.layers.iter()).collect()
  }
}

/// Split features into phases in execution order.
///
/// Phases without features are left out, except that a layer with no parent
/// always gets a compile phase: it has to produce a filesystem from nothing.
pub fn partition(features: Vec<Feature>, has_parent: bool) -> Vec<PhaseSet> {
  let mut sets: Vec<PhaseSet> = BuildPhase::ALL
    .iter()
    .map(|&phase| PhaseSet {
      phase,
      features: Vec::new(),
    })
    .collect();

  for feature in features {
    sets[feature.phase().index()].features.push(feature);
  }

  sets
    .into_iter()
    .filter(|set| !set.features.is_empty() || (!has_parent && set.phase == BuildPhase::Compile))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::feature::{RpmAction, rpms};
  use crate::util::testutil::{group, host_mount, install, remove, user};

  fn phases(sets: &[PhaseSet]) -> Vec<BuildPhase> {
    sets.iter().map(|s| s.phase).collect()
  }

  #[test]
  fn index_matches_execution_order() {
    for (position, phase) in BuildPhase::ALL.iter().enumerate() {
      assert_eq!(phase.index(), position, "{phase}");
    }
  }

  #[test]
  fn simple_features_need_only_compile() {
    let sets = partition(
      vec![
        install("//app:a", "/etc/a"),
        user("//app:u", "app"),
        host_mount("//app:m", "/mnt/data", "/data"),
      ],
      false,
    );

    assert_eq!(phases(&sets), vec![BuildPhase::Compile]);
    assert_eq!(sets[0].features.len(), 3);
    assert!(sets[0].is_predictable());
    assert!(!sets[0].requires_planning());
  }

  #[test]
  fn package_actions_get_their_own_phase() {
    let sets = partition(
      vec![
        install("//app:a", "/etc/a"),
        rpms("//app:pkgs", RpmAction::Install, &["bash"], &[]).unwrap(),
      ],
      false,
    );

    assert_eq!(phases(&sets), vec![BuildPhase::PackageManager, BuildPhase::Compile]);
    assert!(sets[0].requires_planning());
    assert!(!sets[0].is_predictable());
    assert!(sets[1].is_predictable());
  }

  #[test]
  fn empty_parentless_layer_still_compiles() {
    let sets = partition(Vec::new(), false);
    assert_eq!(phases(&sets), vec![BuildPhase::Compile]);
    assert!(sets[0].features.is_empty());
  }

  #[test]
  fn empty_child_layer_has_no_phases() {
    assert!(partition(Vec::new(), true).is_empty());
  }

  #[test]
  fn child_with_only_removals_skips_compile() {
    let sets = partition(vec![remove("//app:rm", "/etc/motd")], true);
    assert_eq!(phases(&sets), vec![BuildPhase::Remove]);
  }

  #[test]
  fn phases_follow_fixed_order() {
    let sets = partition(
      vec![
        remove("//app:rm", "/etc/motd"),
        group("//app:g", "app"),
        rpms("//app:pkgs", RpmAction::Install, &["bash"], &[]).unwrap(),
      ],
      true,
    );
    assert_eq!(
      phases(&sets),
      vec![BuildPhase::PackageManager, BuildPhase::Compile, BuildPhase::Remove]
    );
  }

  #[test]
  fn phase_names_match_serialization() {
    for phase in BuildPhase::ALL {
      assert_eq!(serde_json::to_value(phase).unwrap(), phase.as_str());
    }
  }
}
