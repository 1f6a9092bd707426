//! Atomic publication of the layer record.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::consts::LAYER_RECORD_FILE;
use crate::layer::LayerRef;

use super::types::BuildError;

/// Write `layer.json` into `out_dir` via a temp file and a rename, so readers
/// see either the previous record or the complete new one.
pub fn publish(out_dir: &Path, layer: &LayerRef) -> Result<PathBuf, BuildError> {
  let record = out_dir.join(LAYER_RECORD_FILE);
  let publish_err = |source: std::io::Error| BuildError::Publish {
    path: record.clone(),
    source,
  };

  std::fs::create_dir_all(out_dir).map_err(publish_err)?;
  let mut tmp = NamedTempFile::new_in(out_dir).map_err(publish_err)?;
  serde_json::to_writer_pretty(&mut tmp, layer)?;
  tmp.write_all(b"\n").map_err(publish_err)?;
  tmp.as_file().sync_all().map_err(publish_err)?;
  tmp.persist(&record).map_err(|e| publish_err(e.error))?;

  debug!(label = %layer.label, record = ?record, "published layer record");
  Ok(record)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::layer_ref;
  use tempfile::TempDir;

  #[test]
  fn publish_replaces_previous_record() {
    let temp = TempDir::new().unwrap();
    let out = temp.path().join("out");

    publish(&out, &layer_ref("//app:old")).unwrap();
    let record = publish(&out, &layer_ref("//app:new")).unwrap();

    assert_eq!(LayerRef::load(&record).unwrap(), layer_ref("//app:new"));
    let entries: Vec<_> = std::fs::read_dir(&out).unwrap().collect();
    assert_eq!(entries.len(), 1, "no temp files left behind");
  }
}
