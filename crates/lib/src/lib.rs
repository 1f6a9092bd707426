//! layerforge-lib: feature graph compilation and phased layer builds
//!
//! A layer is described by an unordered set of features. This crate turns
//! that set into a deterministic build:
//! - `collect`: flatten and deduplicate features from nested lists and feature sets
//! - `mount`: flatten nested layer mounts into one list per layer
//! - `phase`: partition features into the fixed phase order
//! - `build`: run each phase through plan, compile and depgraph, then publish
//! - `facts`: the in-process depgraph backend
//! - `compiler`: the backend traits and the external compiler adapter

pub mod build;
pub mod collect;
pub mod compiler;
pub mod config;
pub mod consts;
pub mod facts;
pub mod feature;
pub mod layer;
pub mod mount;
pub mod paths;
pub mod phase;
pub mod util;
