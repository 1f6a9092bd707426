//! Build command implementation.
//!
//! Loads a layer definition, drives every phase through the configured
//! backends and publishes the layer record.

use std::time::Instant;

use anyhow::{Context, Result};
use tracing::debug;

use layerforge_lib::build::LayerBuilder;
use layerforge_lib::collect::JsonFileResolver;
use layerforge_lib::compiler::{Depgrapher, ExternalCompiler};
use layerforge_lib::config::{BuildConfig, DepgraphBackend};
use layerforge_lib::facts::NativeDepgrapher;
use layerforge_lib::layer::LayerDefinition;
use layerforge_lib::paths::working_dir;

use crate::BuildArgs;
use crate::output::{format_duration, print_phase, print_stat, print_success};

pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let start = Instant::now();

  let definition = LayerDefinition::load(&args.definition)
    .with_context(|| format!("Failed to load layer definition: {}", args.definition.display()))?;
  let resolver = JsonFileResolver::new(&definition.base_dir);
  let label = definition.label.clone();
  let spec = definition
    .into_spec()
    .with_context(|| format!("Failed to load parent of {label}"))?;

  let config = BuildConfig {
    working_dir: args.workdir.unwrap_or_else(working_dir),
    compiler: args.compiler,
    depgraph: args.depgraph,
    keep_failed: args.keep_failed,
  };
  debug!(config = ?config, "build configuration");

  let compiler = ExternalCompiler::new(&config.compiler);
  let native = NativeDepgrapher;
  let depgrapher: &dyn Depgrapher = match config.depgraph {
    DepgraphBackend::Native => &native,
    DepgraphBackend::External => &compiler,
  };
  let builder = LayerBuilder::new(config, &compiler, depgrapher).with_resolver(&resolver);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let built = rt
    .block_on(builder.build(spec, &args.out))
    .with_context(|| format!("Failed to build {label}"))?;

  print_success(&format!("Built {} in {}", built.layer.label, format_duration(start.elapsed())));
  for phase in &built.phases {
    print_phase(phase);
  }
  print_stat("Subvolume", &built.layer.subvolume.display().to_string());
  print_stat("Record", &built.record.display().to_string());

  Ok(())
}
