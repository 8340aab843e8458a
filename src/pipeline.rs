//! Wiring for the two training variants: fine-tuning a pretrained encoder on
//! raw text, and fitting a regression head on precomputed embeddings.

use crate::checkpoint::CheckpointManager;
use crate::data::{Dataset, EmbeddingDataset, TextDataset};
use crate::loader::{DataLoader, LoaderOptions, StackCollate, TokenizeCollate};
use crate::metrics::ScalarWriter;
use crate::model::{
    encoder_head_groups, named_vars, resolve_pretrained, EncoderDims, Regressor,
    TransformerRegressor, HEAD_PREFIX,
};
use crate::optim::{Adam, Lion, ParamGroup, ParamsAdam, ParamsLion};
use crate::train::{LoopConfig, Trainer};
use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Encoder parameters train at `lr / ENCODER_LR_DIVISOR`.
pub const ENCODER_LR_DIVISOR: f64 = 100.;

/// Where a run keeps its checkpoints and scalar log.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub run_name: String,
    pub checkpoint_root: PathBuf,
    pub log_root: PathBuf,
    pub save_every: usize,
    pub keep_best: usize,
    pub resume: Option<PathBuf>,
}

impl RunConfig {
    pub fn save_dir(&self) -> PathBuf {
        self.checkpoint_root.join(&self.run_name)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_root.join(&self.run_name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndToEndConfig {
    pub model: String,
    pub revision: String,
    pub train_csv: PathBuf,
    pub val_csv: PathBuf,
    pub text_column: String,
    pub label_column: String,
    pub max_len: usize,
    pub lr: f64,
    pub batch_size: usize,
    pub num_workers: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub train: LoopConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadConfig {
    pub train_data_path: PathBuf,
    pub val_data_path: PathBuf,
    pub train_csv: PathBuf,
    pub val_csv: PathBuf,
    pub label_column: String,
    pub features: usize,
    pub hidden: usize,
    pub dropout: f32,
    pub lr: f64,
    pub batch_size: usize,
    pub num_workers: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub train: LoopConfig,
    pub run: RunConfig,
}

/// Creates the run directories and records the resolved configuration.
fn prepare_run(
    run: &RunConfig,
    config: &impl Serialize,
) -> Result<(CheckpointManager, ScalarWriter)> {
    let checkpoints = CheckpointManager::new(run.save_dir(), run.save_every, run.keep_best)?;
    let config_path = checkpoints.dir().join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(config)?)
        .with_context(|| format!("cannot write {}", config_path.display()))?;
    let scalars = ScalarWriter::create(&run.log_dir())?;
    tracing::info!(
        "checkpoints in {}, scalars in {}",
        checkpoints.dir().display(),
        scalars.path().display()
    );
    Ok((checkpoints, scalars))
}

fn loader_options(
    batch_size: usize,
    num_workers: usize,
    shuffle: bool,
    seed: u64,
) -> LoaderOptions {
    LoaderOptions {
        batch_size,
        shuffle,
        num_workers,
        seed,
    }
}

fn ensure_rows(set: &impl Dataset, path: &Path) -> Result<()> {
    if set.is_empty() {
        bail!("{} has no rows to train on", path.display());
    }
    Ok(())
}

/// Caps the tokenized length at the encoder's position table.
fn clamp_max_len(requested: usize, max_positions: usize) -> usize {
    if requested > max_positions {
        tracing::warn!(
            "max_len {requested} exceeds the encoder's {max_positions} positions, \
             truncating to {max_positions}"
        );
        return max_positions;
    }
    requested
}

pub fn run_end_to_end(cfg: &EndToEndConfig) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    tracing::info!("Device: {device:?}");

    let train_set = TextDataset::from_csv(&cfg.train_csv, &cfg.text_column, &cfg.label_column)?;
    let val_set = TextDataset::from_csv(&cfg.val_csv, &cfg.text_column, &cfg.label_column)?;
    ensure_rows(&train_set, &cfg.train_csv)?;
    tracing::info!("Train set size: {}", train_set.len());
    tracing::info!("Val set size: {}", val_set.len());

    let files = resolve_pretrained(&cfg.model, &cfg.revision)?;
    let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(anyhow::Error::msg)?;
    let dims = EncoderDims::from_file(&files.config)?;
    let max_len = clamp_max_len(cfg.max_len, dims.max_position_embeddings);
    let collate = Arc::new(TokenizeCollate::new(tokenizer, max_len)?);
    let mut train_loader = DataLoader::new(
        train_set,
        collate.clone(),
        loader_options(cfg.batch_size, cfg.num_workers, cfg.shuffle, cfg.seed),
    );
    let mut val_loader = DataLoader::new(
        val_set,
        collate,
        loader_options(cfg.batch_size, cfg.num_workers, false, cfg.seed),
    );
    tracing::info!("Train loader size: {}", train_loader.num_batches());
    tracing::info!("Val loader size: {}", val_loader.num_batches());

    let (model, varmap) = TransformerRegressor::from_pretrained(&files, &device)?;
    let params = named_vars(&varmap)?;
    let groups = encoder_head_groups(&params, cfg.lr, cfg.lr / ENCODER_LR_DIVISOR);
    let optimizer = Lion::new(groups, ParamsLion::default())?;

    let (checkpoints, scalars) = prepare_run(&cfg.run, cfg)?;
    let mut trainer = Trainer::new(
        model,
        params,
        optimizer,
        checkpoints,
        scalars,
        device,
        cfg.train.clone(),
    );
    if let Some(path) = cfg.run.resume.as_deref() {
        trainer.resume(path)?;
        tracing::info!("Continuing at epoch {}", trainer.start_epoch());
    }
    trainer.fit(&mut train_loader, &mut val_loader)
}

pub fn run_head(cfg: &HeadConfig) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    tracing::info!("Device: {device:?}");

    let train_set = EmbeddingDataset::from_files(
        &cfg.train_data_path,
        &cfg.train_csv,
        &cfg.label_column,
        cfg.features,
    )?;
    let val_set = EmbeddingDataset::from_files(
        &cfg.val_data_path,
        &cfg.val_csv,
        &cfg.label_column,
        cfg.features,
    )?;
    ensure_rows(&train_set, &cfg.train_data_path)?;
    tracing::info!(
        features = train_set.features(),
        "Train set size: {}",
        train_set.len()
    );
    tracing::info!("Val set size: {}", val_set.len());

    let collate = Arc::new(StackCollate);
    let mut train_loader = DataLoader::new(
        train_set,
        collate.clone(),
        loader_options(cfg.batch_size, cfg.num_workers, cfg.shuffle, cfg.seed),
    );
    let mut val_loader = DataLoader::new(
        val_set,
        collate,
        loader_options(cfg.batch_size, cfg.num_workers, false, cfg.seed),
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Regressor::new(cfg.features, cfg.hidden, cfg.dropout, vb.pp(HEAD_PREFIX))?;
    let params = named_vars(&varmap)?;
    let group = ParamGroup {
        params: params.clone(),
        lr: cfg.lr,
    };
    let optimizer = Adam::new(
        vec![group],
        ParamsAdam {
            amsgrad: true,
            ..Default::default()
        },
    )?;

    let (checkpoints, scalars) = prepare_run(&cfg.run, cfg)?;
    let mut trainer = Trainer::new(
        model,
        params,
        optimizer,
        checkpoints,
        scalars,
        device,
        cfg.train.clone(),
    );
    if let Some(path) = cfg.run.resume.as_deref() {
        trainer.resume(path)?;
        tracing::info!("Continuing at epoch {}", trainer.start_epoch());
    }
    trainer.fit(&mut train_loader, &mut val_loader)
}
