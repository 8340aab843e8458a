use crate::optim::Optimizer;
use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const EXT: &str = "safetensors";
const BEST_PREFIX: &str = "model_best_";

/// Per-epoch metric series carried across resumes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct History {
    pub train_loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_mape: Vec<f64>,
}

/// Counters and best metric restored alongside the weights.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainState {
    pub epoch: usize,
    /// Training samples seen so far.
    pub iter: u64,
    pub best_val_mape: f64,
    pub history: History,
}

impl Default for TrainState {
    fn default() -> Self {
        Self {
            epoch: 0,
            iter: 0,
            best_val_mape: f64::INFINITY,
            history: History::default(),
        }
    }
}

fn scalar_i64(v: i64) -> candle_core::Result<Tensor> {
    Tensor::new(&[v], &Device::Cpu)
}

fn series(v: &[f64]) -> candle_core::Result<Tensor> {
    Tensor::new(v, &Device::Cpu)
}

/// Writes one checkpoint file holding the counters, the model parameters
/// (`state_dict.*`) and the optimizer buffers (`optimizer.*`).
pub fn save_checkpoint<O: Optimizer + ?Sized>(
    path: &Path,
    state: &TrainState,
    params: &[(String, Var)],
    optimizer: &O,
) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("epoch".into(), scalar_i64(state.epoch as i64)?);
    tensors.insert("iter".into(), scalar_i64(state.iter as i64)?);
    tensors.insert(
        "best_val_mape".into(),
        Tensor::new(&[state.best_val_mape], &Device::Cpu)?,
    );
    for (key, values) in [
        ("history.train_loss", &state.history.train_loss),
        ("history.val_loss", &state.history.val_loss),
        ("history.val_mape", &state.history.val_mape),
    ] {
        if !values.is_empty() {
            tensors.insert(key.into(), series(values)?);
        }
    }
    for (name, var) in params {
        tensors.insert(format!("state_dict.{name}"), var.as_tensor().copy()?);
    }
    for (key, t) in optimizer.state_dict()? {
        tensors.insert(format!("optimizer.{key}"), t);
    }
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("cannot write checkpoint {}", path.display()))
}

fn read_scalar(tensors: &HashMap<String, Tensor>, key: &str, dtype: DType) -> Result<Tensor> {
    let t = tensors
        .get(key)
        .with_context(|| format!("checkpoint has no {key}"))?;
    Ok(t.to_dtype(dtype)?.flatten_all()?.get(0)?)
}

fn read_series(tensors: &HashMap<String, Tensor>, key: &str) -> Result<Vec<f64>> {
    match tensors.get(key) {
        Some(t) => Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?),
        None => Ok(Vec::new()),
    }
}

/// Restores parameters and optimizer buffers in place and returns the
/// saved counters.
pub fn load_checkpoint<O: Optimizer + ?Sized>(
    path: &Path,
    params: &[(String, Var)],
    optimizer: &mut O,
) -> Result<TrainState> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("cannot read checkpoint {}", path.display()))?;

    for (name, var) in params {
        let key = format!("state_dict.{name}");
        let t = tensors
            .get(&key)
            .with_context(|| format!("{} has no {key}", path.display()))?;
        var.set(&t.to_dtype(var.dtype())?.to_device(var.device())?)
            .with_context(|| format!("cannot restore {name}"))?;
    }

    let optimizer_state: HashMap<String, Tensor> = tensors
        .iter()
        .filter_map(|(k, t)| {
            k.strip_prefix("optimizer.")
                .map(|rest| (rest.to_string(), t.clone()))
        })
        .collect();
    optimizer.load_state_dict(&optimizer_state)?;

    Ok(TrainState {
        epoch: read_scalar(&tensors, "epoch", DType::I64)?.to_scalar::<i64>()?.max(0) as usize,
        iter: read_scalar(&tensors, "iter", DType::I64)?.to_scalar::<i64>()?.max(0) as u64,
        best_val_mape: read_scalar(&tensors, "best_val_mape", DType::F64)?.to_scalar::<f64>()?,
        history: History {
            train_loss: read_series(&tensors, "history.train_loss")?,
            val_loss: read_series(&tensors, "history.val_loss")?,
            val_mape: read_series(&tensors, "history.val_mape")?,
        },
    })
}

/// Orders best-model files by the integer spelled by every digit in their
/// path, e.g. `run1/model_best_epoch_12` sorts as 112.
fn digit_key(path: &Path) -> (usize, String) {
    let digits: String = path
        .to_string_lossy()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let digits = digits.trim_start_matches('0').to_string();
    (digits.len(), digits)
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("could not remove {}: {e}", path.display()),
    }
}

/// Periodic and best-model checkpoints of one run directory.
///
/// Periodic saves keep a ring of depth one: writing `epoch_{e}` removes
/// `epoch_{e - save_every}`. Best saves keep at most `keep_best` files.
pub struct CheckpointManager {
    dir: PathBuf,
    save_every: usize,
    keep_best: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, save_every: usize, keep_best: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;
        Ok(Self {
            dir,
            save_every: save_every.max(1),
            keep_best,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn periodic_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("epoch_{epoch}.{EXT}"))
    }

    pub fn best_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{BEST_PREFIX}epoch_{epoch}.{EXT}"))
    }

    pub fn is_save_epoch(&self, epoch: usize) -> bool {
        epoch % self.save_every == 0
    }

    /// Best-model files in deletion order (first is removed first).
    pub fn best_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(BEST_PREFIX) && name.ends_with(&format!(".{EXT}")) {
                found.push(path);
            }
        }
        found.sort_by_cached_key(|p| digit_key(p));
        Ok(found)
    }

    pub fn last_path(&self) -> PathBuf {
        self.dir.join(format!("last.{EXT}"))
    }

    /// Writes `epoch_{state.epoch}`, drops the previous periodic file and,
    /// when `is_best`, adds a best-model file.
    pub fn save<O: Optimizer + ?Sized>(
        &self,
        state: &TrainState,
        is_best: bool,
        params: &[(String, Var)],
        optimizer: &O,
    ) -> Result<PathBuf> {
        let path = self.periodic_path(state.epoch);
        save_checkpoint(&path, state, params, optimizer)?;
        if let Some(previous) = state.epoch.checked_sub(self.save_every) {
            remove_quietly(&self.periodic_path(previous));
        }
        if is_best {
            self.save_best(state, params, optimizer)?;
        }
        Ok(path)
    }

    /// Writes `model_best_epoch_{state.epoch}`, first pruning the oldest
    /// best file once `keep_best` of them exist.
    pub fn save_best<O: Optimizer + ?Sized>(
        &self,
        state: &TrainState,
        params: &[(String, Var)],
        optimizer: &O,
    ) -> Result<PathBuf> {
        let past_best = self.best_checkpoints()?;
        if past_best.len() >= self.keep_best {
            if let Some(oldest) = past_best.first() {
                remove_quietly(oldest);
            }
        }
        let best = self.best_path(state.epoch);
        save_checkpoint(&best, state, params, optimizer)?;
        Ok(best)
    }

    /// Overwrites `last` with the final state of the run.
    pub fn save_last<O: Optimizer + ?Sized>(
        &self,
        state: &TrainState,
        params: &[(String, Var)],
        optimizer: &O,
    ) -> Result<PathBuf> {
        let path = self.last_path();
        save_checkpoint(&path, state, params, optimizer)?;
        Ok(path)
    }
}
