//! Render completion push handler.
//!
//! The engine writes rendered outputs to its own scratch area and posts a payload
//! listing them. [`RenderDelivery`] moves each output into the host's output
//! directory, rewrites the paths, and hands the payload to the coordinator.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use super::listener::PushListener;
use crate::core::RenderCoordinator;

/// `post` listener that completes renders
pub struct RenderDelivery {
    output_dir: PathBuf,
    coordinator: RenderCoordinator,
}

impl RenderDelivery {
    pub fn new(output_dir: impl Into<PathBuf>, coordinator: RenderCoordinator) -> Self {
        Self {
            output_dir: output_dir.into(),
            coordinator,
        }
    }
}

impl PushListener for RenderDelivery {
    fn execute(&self, payload: &Value) {
        let mut payload = payload.clone();
        match relocate_outputs(&mut payload, &self.output_dir) {
            Ok(moved) => debug!("Relocated {} render output(s) to {}", moved, self.output_dir.display()),
            Err(e) => warn!("Render outputs left in place: {:#}", e),
        }
        self.coordinator.finish(payload);
    }
}

/// Move every `outputs[*].path` file into `output_dir` and rewrite the path.
///
/// Returns the number of files moved. Individual failures are logged and the
/// entry keeps its original path.
pub fn relocate_outputs(payload: &mut Value, output_dir: &Path) -> Result<usize> {
    let Some(outputs) = payload.get_mut("outputs").and_then(Value::as_array_mut) else {
        return Ok(0);
    };
    if outputs.is_empty() {
        return Ok(0);
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let mut moved = 0;
    for output in outputs.iter_mut() {
        let Some(source) = output.get("path").and_then(Value::as_str).map(PathBuf::from) else {
            continue;
        };
        let Some(file_name) = source.file_name() else {
            warn!("Output path {} has no file name", source.display());
            continue;
        };
        let target = output_dir.join(file_name);
        if source == target {
            continue;
        }

        match move_file(&source, &target) {
            Ok(()) => {
                output["path"] = Value::String(target.to_string_lossy().into_owned());
                moved += 1;
            }
            Err(e) => warn!("{:#}", e),
        }
    }
    Ok(moved)
}

/// Rename, falling back to copy + remove when crossing filesystems
fn move_file(source: &Path, target: &Path) -> Result<()> {
    if fs::rename(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target)
        .with_context(|| format!("Failed to move {} to {}", source.display(), target.display()))?;
    fs::remove_file(source).with_context(|| format!("Failed to remove {}", source.display()))?;
    Ok(())
}
