//! Compiler and depgraph backends.
//!
//! The builder never mutates a filesystem itself. Each phase is handed to a
//! [`Compiler`] (optionally asked to `plan` first) and the resulting facts are
//! produced by a [`Depgrapher`]. Both are traits so the builder can drive an
//! external compiler binary, the in-process facts engine, or a test double.

mod external;
mod types;

use std::path::PathBuf;

use async_trait::async_trait;

pub use external::ExternalCompiler;
pub use types::*;

/// Produces the facts artifact for a phase.
#[async_trait]
pub trait Depgrapher: Send + Sync {
  async fn depgraph(&self, req: &DepgraphRequest<'_>) -> Result<DepgraphArtifact, BackendError>;
}

/// Applies a phase's features to a filesystem.
#[async_trait]
pub trait Compiler: Send + Sync {
  /// Resolve external decisions (a package transaction) into a plan file.
  async fn plan(&self, req: &PlanRequest<'_>) -> Result<PathBuf, BackendError>;

  /// Materialize the phase into `req.subvolume`.
  async fn compile(&self, req: &CompileRequest<'_>) -> Result<(), BackendError>;
}
