//! Tiny pretrained-model files for tests that touch the encoder.

use crate::model::PretrainedFiles;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config};
use std::fs;
use std::path::Path;

pub const TINY_BERT: &str = r#"{
    "vocab_size": 32,
    "hidden_size": 8,
    "num_hidden_layers": 1,
    "num_attention_heads": 2,
    "intermediate_size": 16,
    "hidden_act": "gelu",
    "hidden_dropout_prob": 0.0,
    "max_position_embeddings": 16,
    "type_vocab_size": 2,
    "initializer_range": 0.02,
    "layer_norm_eps": 1e-12,
    "pad_token_id": 0,
    "position_embedding_type": "absolute",
    "use_cache": true,
    "classifier_dropout": null,
    "model_type": "bert"
}"#;

/// Whitespace-split word-level vocabulary, `[PAD]` = 0.
pub const WORD_TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": { "type": "Whitespace" },
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "[PAD]": 0, "[UNK]": 1, "red": 2, "mug": 3, "oak": 4, "desk": 5,
            "big": 6, "blue": 7, "lamp": 8, "small": 9, "chair": 10
        },
        "unk_token": "[UNK]"
    }
}"#;

/// Writes `config.json`, `tokenizer.json` and a `bert.`-prefixed
/// `model.safetensors` into `dir`, the layout a hub snapshot has.
pub fn write_tiny_bert(dir: &Path) -> PretrainedFiles {
    let files = PretrainedFiles {
        config: dir.join("config.json"),
        tokenizer: dir.join("tokenizer.json"),
        weights: dir.join("model.safetensors"),
    };
    fs::write(&files.config, TINY_BERT).unwrap();
    fs::write(&files.tokenizer, WORD_TOKENIZER).unwrap();

    let config: Config = serde_json::from_str(TINY_BERT).unwrap();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    BertModel::load(vb.pp("bert"), &config).unwrap();
    varmap.save(&files.weights).unwrap();
    files
}
