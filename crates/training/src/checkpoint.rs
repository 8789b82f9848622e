use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use candle_core::{safetensors::load as load_safetensors, Device, Var};
use candle_nn::VarMap;

use crate::config::to_runtime_error;
use crate::TrainingError;

const CHECKPOINT_PREFIX: &str = "model-";
const CHECKPOINT_SUFFIX: &str = ".ckp";

pub fn checkpoint_filename(step: i64) -> String {
    format!("{CHECKPOINT_PREFIX}{step}{CHECKPOINT_SUFFIX}")
}

pub fn checkpoint_path(dir: &Path, step: i64) -> PathBuf {
    dir.join(checkpoint_filename(step))
}

/// Extracts `N` from `model-<N>.ckp`. Only plain ASCII digits are accepted.
pub fn parse_checkpoint_step(filename: &str) -> Option<i64> {
    let digits = filename
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Largest checkpoint step in `dir`, or -1 when there is none.
pub fn latest_checkpoint_step(dir: &Path) -> Result<i64, TrainingError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(-1),
        Err(err) => {
            return Err(TrainingError::runtime(format!(
                "failed to read model directory {}: {err}",
                dir.display()
            )))
        }
    };

    let mut latest = -1;
    for entry in entries {
        let entry = entry.map_err(|err| {
            TrainingError::runtime(format!("failed to read model directory entry: {err}"))
        })?;
        let name = entry.file_name();
        let Some(step) = name.to_str().and_then(parse_checkpoint_step) else {
            log::debug!("skipping {:?} while scanning for checkpoints", name);
            continue;
        };
        latest = latest.max(step);
    }
    Ok(latest)
}

/// Parameters sorted by name, so every consumer sees the same order.
pub fn named_parameters(varmap: &VarMap) -> Result<Vec<(String, Var)>, TrainingError> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("parameter store lock poisoned"))?;
    let mut params: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

pub fn save_parameters(varmap: &VarMap, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = named_parameters(varmap)?;
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, _> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

/// Overwrites every parameter in `varmap` with the tensors stored at `path`.
pub fn apply_parameters(varmap: &VarMap, path: &Path, device: &Device) -> Result<(), TrainingError> {
    let tensors = load_safetensors(path, device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint {}: {err}",
            path.display()
        ))
    })?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in named_parameters(varmap)? {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}
