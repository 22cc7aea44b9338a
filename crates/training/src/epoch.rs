//! One pass over a batch sequence: forward, loss, and in training modes
//! backward with gradient accumulation and per-batch scheduling.
//!
//! The runner keeps no state between calls. Everything that must survive an
//! epoch lives in the caller's [`TrainState`], optimizer and scheduler.

use std::{fmt, str::FromStr};

use candle_core::{backprop::GradStore, Tensor};
use candle_nn::Module;

use crate::{
    batch::Batch,
    logging::{Logger, ProgressReport},
    loss::LossCompute,
    metrics::{LossTotals, ThroughputWindow},
    optimizer::Optimizer,
    scheduler::LRScheduler,
    state::TrainState,
    TrainingError,
};

pub const DEFAULT_LOG_EVERY: usize = 40;

/// Encoder-decoder forward pass plus the ability to backpropagate a loss
/// derived from its output.
pub trait Seq2SeqModel {
    fn forward(
        &self,
        src: &Tensor,
        tgt: &Tensor,
        src_mask: &Tensor,
        tgt_mask: &Tensor,
    ) -> Result<Tensor, TrainingError>;

    /// Gradients of `loss` with respect to the model's variables.
    ///
    /// Data-parallel wrappers override this to all-reduce the gradients
    /// across workers before returning; the call blocks until they are
    /// synchronized.
    fn backward(&self, loss: &Tensor) -> Result<GradStore, TrainingError> {
        Ok(loss.backward()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    /// Training on the worker that also records TensorBoard scalars.
    TrainLog,
    Eval,
}

impl RunMode {
    /// `TrainLog` on rank 0, `Train` on every other data-parallel worker.
    pub fn for_rank(rank: usize) -> Self {
        if rank == 0 {
            RunMode::TrainLog
        } else {
            RunMode::Train
        }
    }

    pub fn is_training(self) -> bool {
        matches!(self, RunMode::Train | RunMode::TrainLog)
    }

    pub fn records_scalars(self) -> bool {
        self == RunMode::TrainLog
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Train => "train",
            RunMode::TrainLog => "train+log",
            RunMode::Eval => "eval",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(RunMode::Train),
            "train+log" | "train_log" => Ok(RunMode::TrainLog),
            "eval" => Ok(RunMode::Eval),
            other => Err(format!("unknown run mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EpochOptions {
    pub mode: RunMode,
    /// Optimizer updates fire on batches whose index is a multiple of this.
    pub accum_iter: usize,
    pub log_every: usize,
}

impl EpochOptions {
    pub fn new(mode: RunMode, accum_iter: usize) -> Result<Self, TrainingError> {
        if accum_iter == 0 {
            return Err(TrainingError::initialization(
                "accum_iter must be at least 1",
            ));
        }
        Ok(Self {
            mode,
            accum_iter,
            log_every: DEFAULT_LOG_EVERY,
        })
    }

    pub fn with_log_every(mut self, log_every: usize) -> Result<Self, TrainingError> {
        if log_every == 0 {
            return Err(TrainingError::initialization(
                "log_every must be at least 1",
            ));
        }
        self.log_every = log_every;
        Ok(self)
    }

    fn reports_at(&self, index: usize) -> bool {
        self.mode.is_training() && index % self.log_every == 1 % self.log_every
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    /// Summed loss over all batches divided by all label tokens.
    pub average_loss: f64,
    pub tokens: usize,
    pub batches: usize,
    /// Optimizer updates applied during this epoch.
    pub optimizer_steps: usize,
}

/// Run every batch of `batches` through `model` in order.
///
/// In training modes each batch is backpropagated and its gradients handed
/// to `optimizer`; the optimizer steps when the zero-based batch index is a
/// multiple of `options.accum_iter` (the first batch of every epoch
/// included), while `scheduler` advances once per batch. `Eval` leaves
/// `train_state`, optimizer and scheduler untouched.
///
/// Any error from the data feed, model, loss or optimizer aborts the epoch;
/// counters already applied to `train_state` stay applied. TensorBoard write
/// failures are logged as warnings and do not stop training.
#[allow(clippy::too_many_arguments)]
pub fn run_epoch<I, M, G, O, S>(
    batches: I,
    model: &M,
    loss_compute: &LossCompute<G>,
    optimizer: &mut O,
    scheduler: &mut S,
    options: &EpochOptions,
    logger: &mut Logger,
    train_state: &mut TrainState,
) -> Result<EpochSummary, TrainingError>
where
    I: IntoIterator<Item = Result<Batch, TrainingError>>,
    M: Seq2SeqModel + ?Sized,
    G: Module,
    O: Optimizer + ?Sized,
    S: LRScheduler + ?Sized,
{
    let mode = options.mode;
    let mut totals = LossTotals::default();
    let mut window = ThroughputWindow::new();
    let mut n_accum = 0usize;
    let mut batches_seen = 0usize;

    for (i, batch) in batches.into_iter().enumerate() {
        let batch = batch?;
        let target = batch.require_target(mode.as_str())?;
        let ntokens = target.ntokens;

        let out = model.forward(&batch.src, &target.tgt, &batch.src_mask, &target.tgt_mask)?;
        let (loss, loss_node) = loss_compute.compute(&out, &target.tgt_y, ntokens as f64)?;

        if mode.is_training() {
            let grads = model.backward(&loss_node)?;
            optimizer.accumulate(grads)?;

            train_state.step += 1;
            train_state.samples += batch.batch_size();
            train_state.tokens += ntokens;

            if i % options.accum_iter == 0 {
                optimizer.step()?;
                optimizer.zero_grad();
                n_accum += 1;
                train_state.accum_step += 1;
            }

            let lr = scheduler.step();
            optimizer.set_learning_rate(lr);
        }

        totals.update(loss, ntokens);
        window.record(ntokens);
        batches_seen += 1;
        log::debug!(
            "{} batch {} loss={:.4} ntokens={}",
            mode,
            i,
            loss / ntokens as f64,
            ntokens
        );

        if options.reports_at(i) {
            let report = ProgressReport {
                batch_index: i,
                accum_steps: n_accum,
                loss_per_token: loss / ntokens as f64,
                tokens_per_sec: window.tokens_per_sec(),
                learning_rate: optimizer.learning_rate(),
                global_step: train_state.step,
            };
            logger.log_progress(&report, mode.records_scalars());
            window.reset();
        }
    }

    logger.flush();

    Ok(EpochSummary {
        average_loss: totals.mean()?,
        tokens: totals.tokens(),
        batches: batches_seen,
        optimizer_steps: n_accum,
    })
}
