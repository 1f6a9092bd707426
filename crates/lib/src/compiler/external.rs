//! Driving an external compiler binary.
//!
//! Each step is one child process:
//!
//! ```text
//! <compiler> depgraph --label L --phase P --features F [--parent D] [--layer D]... [--mount M]... [--observe ROOT] --out O
//! <compiler> plan     --label L --phase P --features F --depgraph D [--parent SUBVOL] --out O
//! <compiler> compile  --label L --phase P --features F --depgraph D [--plan P] [--parent SUBVOL] --out SUBVOL
//! ```
//!
//! Declared artifacts and runnables are appended as `--input` arguments.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::types::{BackendError, CompileRequest, DepgraphArtifact, DepgraphRequest, PhaseContext, PlanRequest, Step};
use super::{Compiler, Depgrapher};

#[derive(Debug, Clone)]
pub struct ExternalCompiler {
  bin: PathBuf,
  extra_args: Vec<String>,
}

impl ExternalCompiler {
  pub fn new(bin: impl Into<PathBuf>) -> Self {
    Self {
      bin: bin.into(),
      extra_args: Vec::new(),
    }
  }

  /// Arguments placed before the subcommand, e.g. a config flag.
  pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
    self.extra_args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn bin(&self) -> &Path {
    &self.bin
  }

  fn common_args(step: Step, ctx: &PhaseContext<'_>) -> Vec<OsString> {
    vec![
      step.to_string().into(),
      "--label".into(),
      ctx.label.as_str().into(),
      "--phase".into(),
      ctx.phase.as_str().into(),
      "--features".into(),
      ctx.features_json.into(),
    ]
  }

  async fn run(&self, step: Step, ctx: &PhaseContext<'_>, mut args: Vec<OsString>) -> Result<(), BackendError> {
    for input in ctx.inputs() {
      args.push("--input".into());
      args.push(input.into());
    }

    info!(label = %ctx.label, phase = %ctx.phase, step = %step, bin = %self.bin.display(), "running compiler");

    let output = Command::new(&self.bin)
      .args(&self.extra_args)
      .args(&args)
      .output()
      .await
      .map_err(|source| BackendError::Spawn {
        step,
        bin: self.bin.clone(),
        source,
      })?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout);

    if !stdout.trim().is_empty() {
      debug!(step = %step, stdout = %stdout.trim(), "compiler stdout");
    }

    if !output.status.success() {
      return Err(BackendError::Failed {
        step,
        code: output.status.code(),
        stderr,
      });
    }

    if !stderr.is_empty() {
      debug!(step = %step, stderr = %stderr, "compiler stderr");
    }
    Ok(())
  }
}

fn require_output(step: Step, path: &Path) -> Result<(), BackendError> {
  if path.exists() {
    Ok(())
  } else {
    Err(BackendError::MissingOutput {
      step,
      path: path.to_path_buf(),
    })
  }
}

#[async_trait]
impl Depgrapher for ExternalCompiler {
  async fn depgraph(&self, req: &DepgraphRequest<'_>) -> Result<DepgraphArtifact, BackendError> {
    let mut args = Self::common_args(Step::Depgraph, req.ctx);
    if let Some(parent) = req.parent {
      args.push("--parent".into());
      args.push(parent.path.clone().into());
    }
    for layer in &req.layers {
      args.push("--layer".into());
      args.push(layer.depgraph.path.clone().into());
    }
    for mount in req.ctx.mounts {
      args.push("--mount".into());
      args.push(mount.mountpoint.clone().into());
    }
    if let Some(root) = req.observe {
      args.push("--observe".into());
      args.push(root.into());
    }
    args.push("--out".into());
    args.push(req.out.into());

    self.run(Step::Depgraph, req.ctx, args).await?;
    require_output(Step::Depgraph, req.out)?;
    DepgraphArtifact::from_file(req.out)
  }
}

#[async_trait]
impl Compiler for ExternalCompiler {
  async fn plan(&self, req: &PlanRequest<'_>) -> Result<PathBuf, BackendError> {
    let mut args = Self::common_args(Step::Plan, req.ctx);
    args.push("--depgraph".into());
    args.push(req.depgraph.path.clone().into());
    if let Some(parent) = req.parent_subvolume {
      args.push("--parent".into());
      args.push(parent.into());
    }
    args.push("--out".into());
    args.push(req.out.into());

    self.run(Step::Plan, req.ctx, args).await?;
    require_output(Step::Plan, req.out)?;
    Ok(req.out.to_path_buf())
  }

  async fn compile(&self, req: &CompileRequest<'_>) -> Result<(), BackendError> {
    let mut args = Self::common_args(Step::Compile, req.ctx);
    args.push("--depgraph".into());
    args.push(req.depgraph.path.clone().into());
    if let Some(plan) = req.plan.path() {
      args.push("--plan".into());
      args.push(plan.into());
    }
    if let Some(parent) = req.parent_subvolume {
      args.push("--parent".into());
      args.push(parent.into());
    }
    args.push("--out".into());
    args.push(req.subvolume.into());

    self.run(Step::Compile, req.ctx, args).await?;
    require_output(Step::Compile, req.subvolume)
  }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
  use super::*;
  use crate::compiler::Plan;
  use crate::feature::Label;
  use crate::phase::BuildPhase;
  use crate::util::testutil::install;
  use std::fs;
  use std::os::unix::fs::PermissionsExt;
  use tempfile::TempDir;

  /// A stand-in compiler that logs its argv and writes whatever `--out` names.
  fn fake_compiler(dir: &Path, exit_code: i32) -> PathBuf {
    let log = dir.join("calls.log");
    let script = format!(
      r#"#!/bin/sh
echo "$@" >> "{log}"
step="$1"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--out" ]; then out="$2"; fi
  shift
done
if [ {exit_code} -ne 0 ]; then
  echo "cannot resolve transaction" >&2
  exit {exit_code}
fi
case "$step" in
  compile) mkdir -p "$out" ;;
  *) echo '{{}}' > "$out" ;;
esac
"#,
      log = log.display(),
    );
    let bin = dir.join("fake-compiler");
    fs::write(&bin, script).unwrap();
    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
    bin
  }

  fn calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.log"))
      .unwrap_or_default()
      .lines()
      .map(str::to_string)
      .collect()
  }

  #[tokio::test]
  async fn runs_each_step_as_a_process() {
    let temp = TempDir::new().unwrap();
    let compiler = ExternalCompiler::new(fake_compiler(temp.path(), 0));

    let label = Label::new("//app:layer");
    let features = vec![install("//app:cfg", "/etc/app.conf")];
    let features_json = temp.path().join("features.json");
    fs::write(&features_json, serde_json::to_string(&features).unwrap()).unwrap();
    let ctx = PhaseContext {
      label: &label,
      phase: BuildPhase::Compile,
      features: &features,
      features_json: &features_json,
      mounts: &[],
    };

    let depgraph_out = temp.path().join("depgraph.json");
    let depgraph = compiler
      .depgraph(&DepgraphRequest {
        ctx: &ctx,
        parent: None,
        layers: Vec::new(),
        observe: None,
        out: &depgraph_out,
      })
      .await
      .unwrap();
    assert_eq!(depgraph.path, depgraph_out);

    let subvolume = temp.path().join("subvol");
    compiler
      .compile(&CompileRequest {
        ctx: &ctx,
        depgraph: &depgraph,
        plan: &Plan::Empty,
        parent_subvolume: None,
        subvolume: &subvolume,
      })
      .await
      .unwrap();
    assert!(subvolume.is_dir());

    let calls = calls(temp.path());
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("depgraph --label //app:layer --phase compile"));
    assert!(calls[0].contains("--input /buck-out/app.conf"), "{}", calls[0]);
    assert!(calls[1].starts_with("compile"));
    assert!(!calls[1].contains("--plan"));
  }

  #[tokio::test]
  async fn failure_carries_step_and_stderr() {
    let temp = TempDir::new().unwrap();
    let compiler = ExternalCompiler::new(fake_compiler(temp.path(), 3));

    let label = Label::new("//app:layer");
    let features_json = temp.path().join("features.json");
    fs::write(&features_json, "[]").unwrap();
    let ctx = PhaseContext {
      label: &label,
      phase: BuildPhase::PackageManager,
      features: &[],
      features_json: &features_json,
      mounts: &[],
    };
    let depgraph = DepgraphArtifact {
      path: temp.path().join("missing.json"),
      hash: crate::util::hash::hash_bytes(b""),
    };

    let err = compiler
      .plan(&PlanRequest {
        ctx: &ctx,
        depgraph: &depgraph,
        parent_subvolume: None,
        out: &temp.path().join("plan.json"),
      })
      .await
      .unwrap_err();

    match err {
      BackendError::Failed { step, code, stderr } => {
        assert_eq!(step, Step::Plan);
        assert_eq!(code, Some(3));
        assert_eq!(stderr, "cannot resolve transaction");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn missing_binary_is_a_spawn_error() {
    let temp = TempDir::new().unwrap();
    let compiler = ExternalCompiler::new(temp.path().join("does-not-exist"));
    let label = Label::new("//app:layer");
    let features_json = temp.path().join("features.json");
    let ctx = PhaseContext {
      label: &label,
      phase: BuildPhase::Compile,
      features: &[],
      features_json: &features_json,
      mounts: &[],
    };

    let err = compiler
      .depgraph(&DepgraphRequest {
        ctx: &ctx,
        parent: None,
        layers: Vec::new(),
        observe: None,
        out: &temp.path().join("depgraph.json"),
      })
      .await
      .unwrap_err();
    assert!(matches!(err, BackendError::Spawn { step: Step::Depgraph, .. }));
  }
}
