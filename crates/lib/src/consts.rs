//! Crate-wide constants.

pub const APP_NAME: &str = "layerforge";

/// Length of the truncated hex digest used for feature identities and
/// working-directory names.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// File written into a layer's output directory once every phase succeeded.
pub const LAYER_RECORD_FILE: &str = "layer.json";

/// Per-phase file names inside a phase working directory.
pub const FEATURES_FILE: &str = "features.json";
pub const PLAN_FILE: &str = "plan.json";
pub const PRE_DEPGRAPH_FILE: &str = "pre-depgraph.json";
pub const DEPGRAPH_FILE: &str = "depgraph.json";
pub const SUBVOLUME_DIR: &str = "subvol";
