use crate::loader::TextBatch;
use crate::optim::ParamGroup;
use anyhow::Context;
use candle_core::{DType, Device, Module, Result, Tensor, Var, D};
use candle_nn::{linear, ops, Linear, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Parameter-name prefix of the pretrained encoder.
pub const ENCODER_PREFIX: &str = "transformer";
/// Parameter-name prefix of the regression head.
pub const HEAD_PREFIX: &str = "head";

/// Maps a batch of inputs to a `(batch,)` tensor of predictions.
pub trait RegressionModel {
    type Input;

    fn forward_t(&self, xs: &Self::Input, train: bool) -> Result<Tensor>;
}

/// All variables of `varmap`, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Splits parameters into an encoder group trained at `encoder_lr` and
/// everything else at `lr`.
pub fn encoder_head_groups(
    params: &[(String, Var)],
    lr: f64,
    encoder_lr: f64,
) -> Vec<ParamGroup> {
    let (encoder, head): (Vec<_>, Vec<_>) = params
        .iter()
        .cloned()
        .partition(|(name, _)| name.starts_with(&format!("{ENCODER_PREFIX}.")));
    vec![
        ParamGroup {
            params: encoder,
            lr: encoder_lr,
        },
        ParamGroup { params: head, lr },
    ]
}

/// Feed-forward head over precomputed embeddings.
pub struct Regressor {
    hidden: Linear,
    out: Linear,
    dropout: f32,
}

impl Regressor {
    pub fn new(features: usize, hidden: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let hidden_layer = linear(features, hidden, vb.pp("hidden"))?;
        let out = linear(hidden, 1, vb.pp("out"))?;
        Ok(Self {
            hidden: hidden_layer,
            out,
            dropout,
        })
    }
}

impl RegressionModel for Regressor {
    type Input = Tensor;

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = self.hidden.forward(xs)?.relu()?;
        if train && self.dropout > 0. {
            h = ops::dropout(&h, self.dropout)?;
        }
        self.out.forward(&h)?.squeeze(D::Minus1)
    }
}

/// BERT encoder with masked mean pooling and a linear output.
pub struct TransformerRegressor {
    encoder: BertModel,
    head: Linear,
}

/// Encoder sizes read straight from `config.json`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EncoderDims {
    pub hidden_size: usize,
    /// Longest token sequence the position table covers.
    pub max_position_embeddings: usize,
}

impl EncoderDims {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
    }
}

impl TransformerRegressor {
    pub fn new(config: &Config, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let encoder = BertModel::load(vb.pp(ENCODER_PREFIX), config)?;
        let head = linear(hidden_size, 1, vb.pp(HEAD_PREFIX))?;
        Ok(Self { encoder, head })
    }

    /// Builds the model with trainable variables and copies the pretrained
    /// encoder weights into them.
    pub fn from_pretrained(
        files: &PretrainedFiles,
        device: &Device,
    ) -> anyhow::Result<(Self, VarMap)> {
        let raw = std::fs::read_to_string(&files.config)
            .with_context(|| format!("cannot read {}", files.config.display()))?;
        let config: Config = serde_json::from_str(&raw)?;
        let dims: EncoderDims = serde_json::from_str(&raw)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(&config, dims.hidden_size, vb)?;
        let loaded = load_pretrained(&varmap, &files.weights)?;
        tracing::info!(
            tensors = loaded,
            hidden_size = dims.hidden_size,
            "loaded pretrained encoder from {}",
            files.weights.display()
        );
        Ok((model, varmap))
    }
}

impl RegressionModel for TransformerRegressor {
    type Input = TextBatch;

    fn forward_t(&self, xs: &TextBatch, _train: bool) -> Result<Tensor> {
        let hidden = self.encoder.forward(
            &xs.input_ids,
            &xs.token_type_ids,
            Some(&xs.attention_mask),
        )?;
        // (b, t, 1) so padding positions drop out of the mean
        let mask = xs.attention_mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.maximum(1e-9)?;
        let pooled = summed.broadcast_div(&counts)?;
        self.head.forward(&pooled)?.squeeze(D::Minus1)
    }
}

pub struct PretrainedFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

/// Resolves `model` as a local directory if one exists, otherwise as a hub
/// repository id at `revision`.
pub fn resolve_pretrained(model: &str, revision: &str) -> anyhow::Result<PretrainedFiles> {
    let local = Path::new(model);
    if local.is_dir() {
        return Ok(PretrainedFiles {
            config: local.join("config.json"),
            tokenizer: local.join("tokenizer.json"),
            weights: local.join("model.safetensors"),
        });
    }
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        model.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    let fetch = |name: &str| {
        repo.get(name)
            .with_context(|| format!("cannot fetch {name} from {model}@{revision}"))
    };
    Ok(PretrainedFiles {
        config: fetch("config.json")?,
        tokenizer: fetch("tokenizer.json")?,
        weights: fetch("model.safetensors")?,
    })
}

/// Checkpoint names a pretrained tensor may be stored under: with or
/// without the architecture prefix, and with legacy layer-norm names.
fn pretrained_names(local: &str) -> Vec<String> {
    let mut bases = vec![local.to_string()];
    if local.contains("LayerNorm.") {
        if let Some(stem) = local.strip_suffix(".weight") {
            bases.push(format!("{stem}.gamma"));
        } else if let Some(stem) = local.strip_suffix(".bias") {
            bases.push(format!("{stem}.beta"));
        }
    }
    let prefixed: Vec<String> = bases.iter().map(|b| format!("bert.{b}")).collect();
    bases.extend(prefixed);
    bases
}

/// Copies pretrained tensors into the encoder variables of `varmap`.
/// Every encoder variable must be found.
pub fn load_pretrained(varmap: &VarMap, weights: &Path) -> anyhow::Result<usize> {
    let tensors = candle_core::safetensors::load(weights, &Device::Cpu)
        .with_context(|| format!("cannot read {}", weights.display()))?;
    let prefix = format!("{ENCODER_PREFIX}.");
    let mut loaded = 0;
    for (name, var) in named_vars(varmap)? {
        let Some(local) = name.strip_prefix(&prefix) else {
            continue;
        };
        let tensor = pretrained_names(local)
            .iter()
            .find_map(|n| tensors.get(n))
            .with_context(|| format!("{} has no tensor for {local}", weights.display()))?;
        var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)
            .with_context(|| format!("shape mismatch for {local}"))?;
        loaded += 1;
    }
    Ok(loaded)
}
