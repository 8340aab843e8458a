use anyhow::Context;
use candle_core::{DType, Result, Tensor};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Guards the relative error against zero targets.
pub const MAPE_EPS: f64 = 1e-8;

/// Running mean, reset at the start of every epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanAccumulator {
    sum: f64,
    count: usize,
}

impl MeanAccumulator {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// NaN when nothing was added.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.sum / self.count as f64
    }
}

/// Σ |pred - actual| / (|actual| + eps) over a batch.
pub fn abs_pct_error_sum(preds: &Tensor, targets: &Tensor) -> Result<f64> {
    let preds = preds.to_dtype(DType::F64)?;
    let targets = targets.to_dtype(DType::F64)?;
    let err = preds.sub(&targets)?.abs()?;
    let scale = (targets.abs()? + MAPE_EPS)?;
    err.div(&scale)?.sum_all()?.to_scalar::<f64>()
}

/// Validation-pass totals: mean batch loss and MAPE over all samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalAccumulator {
    loss: MeanAccumulator,
    abs_pct_sum: f64,
    samples: usize,
}

impl EvalAccumulator {
    pub fn add_batch(&mut self, loss: f64, preds: &Tensor, targets: &Tensor) -> Result<()> {
        self.loss.add(loss);
        self.abs_pct_sum += abs_pct_error_sum(preds, targets)?;
        self.samples += targets.elem_count();
        Ok(())
    }

    pub fn loss(&self) -> f64 {
        self.loss.mean()
    }

    pub fn mape(&self) -> f64 {
        if self.samples == 0 {
            return f64::NAN;
        }
        self.abs_pct_sum / self.samples as f64
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f64,
    step: u64,
    wall_time: f64,
}

/// Appends `{tag, value, step, wall_time}` records, one JSON object per
/// line, for plotting tools to pick up.
pub struct ScalarWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl ScalarWriter {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        let path = dir.join("scalars.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> anyhow::Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let record = ScalarRecord {
            tag,
            value,
            step,
            wall_time,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
