//! Feature records.
//!
//! A feature is one unordered, declarative statement about a layer: install a
//! file, add a user, mount another layer, run a package transaction, and so
//! on. Features are immutable once constructed and are identified by a
//! content hash of their kind, payload and declared resources, so identical
//! statements reached through different composition paths collapse into one.
//!
//! # Serialization
//!
//! Every feature serializes to the record the external compiler consumes:
//!
//! ```json
//! { "feature_type": "install", "label": "//app:config", "data": { ... } }
//! ```
//!
//! # Submodules
//!
//! - [`data`] - Kind-specific payloads and their composition-time checks
//! - [`rpm`] - Package-manager actions and the accumulator that groups them

pub mod data;
pub mod rpm;
mod types;

pub use data::*;
pub use rpm::{PackageActionAccumulator, Rpm, RpmAction, RpmItem, RpmSource, rpms};
pub use types::*;
