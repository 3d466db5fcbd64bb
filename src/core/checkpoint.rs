//! Per-epoch checkpoints and the resume scan
//!
//! A checkpoint is a bincode record written to `{run_key}_{epoch}.ckpt`. The
//! latest one is found by parsing the epoch out of each file name, so `10`
//! correctly follows `2`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::optimizer::OptimizerState;
use crate::nn::DualViewModel;
use crate::{HyperRouteError, Result};

/// File extension of checkpoint artifacts
pub const CHECKPOINT_EXT: &str = "ckpt";

/// One parameter as a shape and row-major values
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    /// Tensor dimensions
    pub shape: Vec<usize>,
    /// Row-major values
    pub values: Vec<f32>,
}

impl TensorState {
    /// Copy a tensor to the host
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(TensorState {
            shape: tensor.dims().to_vec(),
            values: tensor.flatten_all()?.to_vec1::<f32>()?,
        })
    }
}

/// Training state at the end of an epoch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last completed epoch
    pub epoch: usize,
    /// Parameters keyed by name
    pub model_state_dict: BTreeMap<String, TensorState>,
    /// Optimizer moments
    pub optimizer_state_dict: OptimizerState,
}

impl Checkpoint {
    /// Capture the model parameters together with `optimizer` state
    pub fn capture(epoch: usize, model: &DualViewModel, optimizer: OptimizerState) -> Result<Self> {
        Ok(Checkpoint {
            epoch,
            model_state_dict: state_dict(model)?,
            optimizer_state_dict: optimizer,
        })
    }

    /// Write to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        debug!(path = %path.as_ref().display(), epoch = self.epoch, "saved checkpoint");
        Ok(())
    }

    /// Read from `path`; a truncated or foreign file is a [`HyperRouteError::Checkpoint`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        bincode::deserialize_from(reader).map_err(|e| {
            HyperRouteError::Checkpoint(format!(
                "cannot decode {}: {e}",
                path.as_ref().display()
            ))
        })
    }
}

/// Parameter values of `model`, keyed by name
pub fn state_dict(model: &DualViewModel) -> Result<BTreeMap<String, TensorState>> {
    model
        .named_parameters()?
        .into_iter()
        .map(|(name, var)| Ok((name, TensorState::from_tensor(var.as_tensor())?)))
        .collect()
}

/// Overwrite every parameter of `model` from `dict`
///
/// The key sets must match exactly and every shape must agree; nothing is
/// written unless the whole dictionary is consistent.
pub fn load_state_dict(model: &DualViewModel, dict: &BTreeMap<String, TensorState>) -> Result<()> {
    let params = model.named_parameters()?;
    if params.len() != dict.len() {
        return Err(HyperRouteError::Checkpoint(format!(
            "checkpoint has {} parameters, model has {}",
            dict.len(),
            params.len()
        )));
    }
    let mut updates = Vec::with_capacity(params.len());
    for (name, var) in &params {
        let saved = dict.get(name).ok_or_else(|| {
            HyperRouteError::Checkpoint(format!("checkpoint is missing parameter '{name}'"))
        })?;
        let numel: usize = saved.shape.iter().product();
        if saved.shape != var.as_tensor().dims() || saved.values.len() != numel {
            return Err(HyperRouteError::Checkpoint(format!(
                "parameter '{name}' has shape {:?} in the checkpoint, {:?} in the model",
                saved.shape,
                var.as_tensor().dims()
            )));
        }
        updates.push((var, Tensor::from_slice(&saved.values, saved.shape.as_slice(), model.device())?));
    }
    for (var, value) in updates {
        var.set(&value)?;
    }
    Ok(())
}

/// Path of the checkpoint for `epoch`
pub fn checkpoint_path<P: AsRef<Path>>(dir: P, run_key: &str, epoch: usize) -> PathBuf {
    dir.as_ref().join(format!("{run_key}_{epoch}.{CHECKPOINT_EXT}"))
}

/// Epoch encoded in `file_name`, if it is a checkpoint of `run_key`
fn parse_epoch(file_name: &str, run_key: &str) -> Option<usize> {
    file_name
        .strip_prefix(run_key)?
        .strip_prefix('_')?
        .strip_suffix(CHECKPOINT_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Highest-epoch checkpoint of `run_key` in `dir`
///
/// A missing directory or one without matching files yields `None`.
pub fn latest_checkpoint<P: AsRef<Path>>(dir: P, run_key: &str) -> Result<Option<(usize, PathBuf)>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(run_key) {
            continue;
        }
        match parse_epoch(name, run_key) {
            Some(epoch) if best.as_ref().map_or(true, |(b, _)| epoch > *b) => {
                best = Some((epoch, entry.path()));
            }
            Some(_) => {}
            None => warn!(file = name, "ignoring file with unparsable checkpoint name"),
        }
    }
    Ok(best)
}
