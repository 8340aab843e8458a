use crate::checkpoint::{load_checkpoint, CheckpointManager, TrainState};
use crate::data::Dataset;
use crate::loader::{Collate, DataLoader, ToDevice};
use crate::metrics::{EvalAccumulator, MeanAccumulator, ScalarWriter};
use crate::model::RegressionModel;
use crate::optim::Optimizer;
use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::loss::mse;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct LoopConfig {
    pub epochs: usize,
    pub log_every: usize,
    pub val_every: usize,
    /// Write a best-model file on every validated improvement instead of
    /// only on save epochs.
    pub best_every_validation: bool,
}

fn to_f64(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Drives epochs of training and validation for one model, owning the
/// optimizer, checkpoint directory and scalar log of the run.
pub struct Trainer<M, O> {
    model: M,
    params: Vec<(String, Var)>,
    optimizer: O,
    checkpoints: CheckpointManager,
    scalars: ScalarWriter,
    device: Device,
    cfg: LoopConfig,
    state: TrainState,
    start_epoch: usize,
}

impl<M, O> Trainer<M, O>
where
    M: RegressionModel,
    M::Input: ToDevice,
    O: Optimizer,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: M,
        params: Vec<(String, Var)>,
        optimizer: O,
        checkpoints: CheckpointManager,
        scalars: ScalarWriter,
        device: Device,
        cfg: LoopConfig,
    ) -> Self {
        Self {
            model,
            params,
            optimizer,
            checkpoints,
            scalars,
            device,
            cfg,
            state: TrainState::default(),
            start_epoch: 0,
        }
    }

    /// Restores weights, optimizer buffers and counters; training continues
    /// with the epoch after the saved one.
    pub fn resume(&mut self, path: &Path) -> Result<()> {
        tracing::info!("Resuming from checkpoint {}", path.display());
        self.state = load_checkpoint(path, &self.params, &mut self.optimizer)?;
        self.start_epoch = self.state.epoch + 1;
        tracing::info!(
            epoch = self.start_epoch,
            iter = self.state.iter,
            best_val_mape = self.state.best_val_mape,
            "resumed"
        );
        Ok(())
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Runs the remaining epochs, then one more validation pass, and writes
    /// the `last` checkpoint.
    pub fn fit<D, C>(
        &mut self,
        train: &mut DataLoader<D, C>,
        val: &mut DataLoader<D, C>,
    ) -> Result<()>
    where
        D: Dataset,
        C: Collate<D::Input, Batch = M::Input>,
    {
        for epoch in self.start_epoch..self.cfg.epochs {
            tracing::info!("Epoch: {epoch}");
            self.state.epoch = epoch;
            let train_loss = self.train_one_epoch(train)?;
            self.state.history.train_loss.push(train_loss);
            self.scalars.add_scalar("Epoch/train_loss", train_loss, epoch as u64)?;

            let mut is_best = false;
            if epoch % self.cfg.val_every.max(1) == 0 {
                let (val_loss, val_mape) = self.validate(val)?;
                self.state.history.val_loss.push(val_loss);
                self.state.history.val_mape.push(val_mape);
                tracing::info!(
                    "Train Loss: {train_loss} | Val Loss: {val_loss} | \
                     Val MAPE: {val_mape} | Best Val MAPE: {}",
                    self.state.best_val_mape
                );
                self.scalars.add_scalar("Epoch/val_loss", val_loss, epoch as u64)?;
                self.scalars.add_scalar("Epoch/val MAPE", val_mape, epoch as u64)?;
                is_best = val_mape < self.state.best_val_mape;
                if is_best {
                    self.state.best_val_mape = val_mape;
                }
            } else {
                tracing::info!("Train Loss: {train_loss}");
            }

            if self.checkpoints.is_save_epoch(epoch) {
                let path =
                    self.checkpoints
                        .save(&self.state, is_best, &self.params, &self.optimizer)?;
                tracing::info!(best = is_best, "Saved model to {}", path.display());
            } else if is_best && self.cfg.best_every_validation {
                let path = self.checkpoints.save_best(&self.state, &self.params, &self.optimizer)?;
                tracing::info!("Saved best model to {}", path.display());
            }
        }

        let (val_loss, val_mape) = self.validate(val)?;
        tracing::info!("Final Val Loss: {val_loss} | Final Val MAPE: {val_mape}");
        let path = self.checkpoints.save_last(&self.state, &self.params, &self.optimizer)?;
        tracing::info!(
            best_val_mape = self.state.best_val_mape,
            "training finished, saved {}",
            path.display()
        );
        Ok(())
    }

    fn train_one_epoch<D, C>(&mut self, loader: &mut DataLoader<D, C>) -> Result<f64>
    where
        D: Dataset,
        C: Collate<D::Input, Batch = M::Input>,
    {
        let total = loader.num_batches();
        let mut losses = MeanAccumulator::default();
        for (step, batch) in loader.epoch().enumerate() {
            let batch = batch?;
            let xs = batch.inputs.to_device(&self.device)?;
            let ys = batch.targets.to_device(&self.device)?;

            let preds = self.model.forward_t(&xs, true)?;
            let loss = mse(&preds, &ys)?;
            self.optimizer.backward_step(&loss)?;

            let loss = to_f64(&loss)?;
            losses.add(loss);
            self.state.iter += batch.len as u64;
            if step % self.cfg.log_every.max(1) == 0 {
                tracing::info!("Step: {step}/{total} | Loss: {loss}");
                self.scalars
                    .add_scalar("Iter/train_loss", loss, self.state.iter)?;
            }
        }
        Ok(losses.mean())
    }

    /// Returns `(mean batch loss, MAPE)` over the whole loader.
    fn validate<D, C>(&mut self, loader: &mut DataLoader<D, C>) -> Result<(f64, f64)>
    where
        D: Dataset,
        C: Collate<D::Input, Batch = M::Input>,
    {
        let mut eval = EvalAccumulator::default();
        for batch in loader.epoch() {
            let batch = batch?;
            let xs = batch.inputs.to_device(&self.device)?;
            let ys = batch.targets.to_device(&self.device)?;
            let preds = self.model.forward_t(&xs, false)?.detach();
            let loss = to_f64(&mse(&preds, &ys)?)?;
            eval.add_batch(loss, &preds, &ys)?;
        }
        Ok((eval.loss(), eval.mape()))
    }
}
