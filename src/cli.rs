use crate::pipeline::{self, EndToEndConfig, HeadConfig, RunConfig};
use crate::train::LoopConfig;
use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "length-regressor",
    version,
    about = "Train regressors that predict product length from title embeddings."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fine-tune a pretrained encoder together with a regression head.
    EndToEnd(EndToEndArgs),
    /// Fit a regression head on precomputed embeddings.
    Train(HeadArgs),
}

/// Flags shared by both subcommands for checkpointing and logging.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Save a checkpoint every N epochs.
    #[arg(long, alias = "save_every", default_value_t = 1)]
    pub save_every: usize,

    /// Number of best-model checkpoints to keep.
    #[arg(long, alias = "keep_best", default_value_t = 5)]
    pub keep_best: usize,

    /// Resume from this checkpoint file.
    #[arg(long)]
    pub resume: Option<PathBuf>,

    #[arg(long, alias = "checkpoint_root", default_value = "checkpoints")]
    pub checkpoint_root: PathBuf,

    #[arg(long, alias = "log_root", default_value = "logs")]
    pub log_root: PathBuf,
}

impl RunArgs {
    fn into_config(self, run_name: String) -> RunConfig {
        RunConfig {
            run_name,
            checkpoint_root: self.checkpoint_root,
            log_root: self.log_root,
            save_every: self.save_every,
            keep_best: self.keep_best,
            resume: self.resume,
        }
    }
}

#[derive(Args, Debug)]
pub struct EndToEndArgs {
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    /// Log the running train loss every N batches.
    #[arg(long, alias = "log_every", default_value_t = 10)]
    pub log_every: usize,

    /// Validate every N epochs.
    #[arg(long, alias = "val_every", default_value_t = 1)]
    pub val_every: usize,

    #[arg(long, alias = "run_name", default_value = "v0")]
    pub run_name: String,

    #[arg(long, alias = "batch_size", default_value_t = 32)]
    pub batch_size: usize,

    /// Prefetch threads; 0 collates on the training thread.
    #[arg(long, alias = "num_workers", default_value_t = 2)]
    pub num_workers: usize,

    /// Hub model id or a local directory with config.json, tokenizer.json
    /// and model.safetensors.
    #[arg(long, default_value = "bert-base-uncased")]
    pub model: String,

    #[arg(long, default_value = "main")]
    pub revision: String,

    #[arg(long, alias = "max_len", default_value_t = 512)]
    pub max_len: usize,

    #[arg(long, alias = "train_csv")]
    pub train_csv: PathBuf,

    #[arg(long, alias = "val_csv")]
    pub val_csv: PathBuf,

    #[arg(long, alias = "text_column", default_value = "TITLE")]
    pub text_column: String,

    #[arg(long, alias = "label_column", default_value = "PRODUCT_LENGTH")]
    pub label_column: String,

    #[arg(long, default_value_t = 421)]
    pub seed: u64,

    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    pub shuffle: bool,

    #[command(flatten)]
    pub run: RunArgs,
}

impl From<EndToEndArgs> for EndToEndConfig {
    fn from(args: EndToEndArgs) -> Self {
        Self {
            model: args.model,
            revision: args.revision,
            train_csv: args.train_csv,
            val_csv: args.val_csv,
            text_column: args.text_column,
            label_column: args.label_column,
            max_len: args.max_len,
            lr: args.lr,
            batch_size: args.batch_size,
            num_workers: args.num_workers,
            shuffle: args.shuffle,
            seed: args.seed,
            train: LoopConfig {
                epochs: args.epochs,
                log_every: args.log_every,
                val_every: args.val_every,
                best_every_validation: false,
            },
            run: args.run.into_config(args.run_name),
        }
    }
}

#[derive(Args, Debug)]
pub struct HeadArgs {
    /// Training embeddings, an (N, features) .npy array.
    #[arg(long, alias = "train_data_path")]
    pub train_data_path: PathBuf,

    #[arg(long, alias = "val_data_path")]
    pub val_data_path: PathBuf,

    /// Labels for the training embeddings, row-aligned.
    #[arg(long, alias = "train_csv")]
    pub train_csv: PathBuf,

    #[arg(long, alias = "val_csv")]
    pub val_csv: PathBuf,

    #[arg(long, alias = "label_column", default_value = "PRODUCT_LENGTH")]
    pub label_column: String,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long, default_value_t = 0.01)]
    pub lr: f64,

    #[arg(long, alias = "batch_size", default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 384)]
    pub features: usize,

    #[arg(long, default_value_t = 256)]
    pub hidden: usize,

    #[arg(long, default_value_t = 0.1)]
    pub dropout: f32,

    #[arg(long, default_value_t = 421)]
    pub seed: u64,

    #[arg(long, alias = "log_interval", default_value_t = 5)]
    pub log_interval: usize,

    #[arg(long, alias = "val_interval", default_value_t = 1)]
    pub val_interval: usize,

    #[arg(long, alias = "num_workers", default_value_t = 0)]
    pub num_workers: usize,

    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub shuffle: bool,

    #[arg(long, alias = "run_name", default_value = "head")]
    pub run_name: String,

    #[command(flatten)]
    pub run: RunArgs,
}

impl From<HeadArgs> for HeadConfig {
    fn from(args: HeadArgs) -> Self {
        Self {
            train_data_path: args.train_data_path,
            val_data_path: args.val_data_path,
            train_csv: args.train_csv,
            val_csv: args.val_csv,
            label_column: args.label_column,
            features: args.features,
            hidden: args.hidden,
            dropout: args.dropout,
            lr: args.lr,
            batch_size: args.batch_size,
            num_workers: args.num_workers,
            shuffle: args.shuffle,
            seed: args.seed,
            train: LoopConfig {
                epochs: args.epochs,
                log_every: args.log_interval,
                val_every: args.val_interval,
                best_every_validation: true,
            },
            run: args.run.into_config(args.run_name),
        }
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::EndToEnd(args) => pipeline::run_end_to_end(&args.into()),
            Command::Train(args) => pipeline::run_head(&args.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_defaults() {
        let cli = Cli::try_parse_from([
            "length-regressor",
            "end-to-end",
            "--train-csv",
            "train.csv",
            "--val-csv",
            "val.csv",
        ])
        .unwrap();
        let Command::EndToEnd(args) = cli.command else {
            panic!("expected end-to-end");
        };
        let cfg: EndToEndConfig = args.into();
        assert_eq!(cfg.train.epochs, 10);
        assert_eq!(cfg.train.log_every, 10);
        assert_eq!(cfg.lr, 1e-4);
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.max_len, 512);
        assert!(!cfg.shuffle);
        assert_eq!(cfg.run.run_name, "v0");
        assert_eq!(cfg.run.keep_best, 5);
        assert_eq!(cfg.run.save_dir(), PathBuf::from("checkpoints/v0"));
        assert!(cfg.run.resume.is_none());
        assert!(!cfg.train.best_every_validation);
    }

    #[test]
    fn train_accepts_underscore_aliases() {
        let cli = Cli::try_parse_from([
            "length-regressor",
            "train",
            "--train_data_path",
            "train.npy",
            "--val-data-path",
            "val.npy",
            "--train-csv",
            "train.csv",
            "--val-csv",
            "val.csv",
            "--log_interval",
            "2",
            "--shuffle",
            "false",
            "--resume",
            "checkpoints/head/epoch_3.safetensors",
        ])
        .unwrap();
        let Command::Train(args) = cli.command else {
            panic!("expected train");
        };
        let cfg: HeadConfig = args.into();
        assert_eq!(cfg.train_data_path, PathBuf::from("train.npy"));
        assert_eq!(cfg.train.log_every, 2);
        assert_eq!(cfg.train.epochs, 100);
        assert_eq!(cfg.features, 384);
        assert!(!cfg.shuffle);
        assert_eq!(cfg.run.run_name, "head");
        assert!(cfg.train.best_every_validation);
        assert_eq!(
            cfg.run.resume,
            Some(PathBuf::from("checkpoints/head/epoch_3.safetensors"))
        );
    }

    #[test]
    fn missing_inputs_are_rejected() {
        assert!(Cli::try_parse_from(["length-regressor", "train"]).is_err());
    }
}
