use std::sync::Mutex;

use candle_core::{DType, Tensor};
use candle_nn::Module;

use crate::TrainingError;

/// KL-divergence criterion against a label-smoothed target distribution.
///
/// Every class receives `smoothing / (size - 2)` (the true class and the
/// padding class are excluded from the uniform share), the true class gets
/// `1 - smoothing`, the padding class is always `0`, and rows whose target is
/// the padding class are zeroed entirely. The loss is summed, not averaged.
#[derive(Debug)]
pub struct LabelSmoothing {
    size: usize,
    padding_idx: u32,
    smoothing: f64,
    confidence: f64,
    true_dist: Mutex<Option<Tensor>>,
}

impl LabelSmoothing {
    pub fn new(size: usize, padding_idx: u32, smoothing: f64) -> Result<Self, TrainingError> {
        if size < 3 {
            return Err(TrainingError::initialization(format!(
                "label smoothing needs at least 3 classes, got {}",
                size
            )));
        }
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1)",
            ));
        }
        if padding_idx as usize >= size {
            return Err(TrainingError::initialization(format!(
                "padding_idx {} is outside the vocabulary of size {}",
                padding_idx, size
            )));
        }
        Ok(Self {
            size,
            padding_idx,
            smoothing,
            confidence: 1.0 - smoothing,
            true_dist: Mutex::new(None),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn padding_idx(&self) -> u32 {
        self.padding_idx
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// The target distribution built by the most recent [`forward`](Self::forward).
    pub fn true_dist(&self) -> Option<Tensor> {
        self.true_dist.lock().ok().and_then(|slot| slot.clone())
    }

    /// `output` holds log-probabilities `[N, size]`, `target` class ids `[N]`.
    pub fn forward(&self, output: &Tensor, target: &Tensor) -> Result<Tensor, TrainingError> {
        let (rows, classes) = output.dims2().map_err(|_| {
            TrainingError::shape(format!(
                "label smoothing expects [N, V] log-probabilities, got {:?}",
                output.dims()
            ))
        })?;
        if classes != self.size {
            return Err(TrainingError::shape(format!(
                "criterion size {} does not match output width {}",
                self.size, classes
            )));
        }

        let device = output.device();
        let dtype = output.dtype();
        let targets = target.flatten_all()?.to_dtype(DType::U32)?.to_device(device)?;
        let count = targets.dim(0)?;
        if count != rows {
            return Err(TrainingError::shape(format!(
                "expected {} targets, got {}",
                rows, count
            )));
        }
        if rows > 0 {
            let largest = targets.max(0)?.to_vec0::<u32>()? as usize;
            if largest >= self.size {
                return Err(TrainingError::shape(format!(
                    "target id {} is outside the vocabulary of size {}",
                    largest, self.size
                )));
            }
        }

        let fill = self.smoothing / (self.size - 2) as f64;
        let class_ids = Tensor::arange(0u32, self.size as u32, device)?;
        let one_hot = class_ids
            .unsqueeze(0)?
            .broadcast_eq(&targets.unsqueeze(1)?)?
            .to_dtype(dtype)?;
        let keep_cols = class_ids.ne(self.padding_idx)?.to_dtype(dtype)?.unsqueeze(0)?;
        let keep_rows = targets.ne(self.padding_idx)?.to_dtype(dtype)?.unsqueeze(1)?;

        // confidence on the true class, fill elsewhere, then clear pad column and pad rows
        let true_dist = one_hot
            .affine(self.confidence - fill, fill)?
            .broadcast_mul(&keep_cols)?
            .broadcast_mul(&keep_rows)?
            .detach();

        // sum(t * (ln t - x)) with 0 * ln 0 = 0; every kept row carries the same sum(t ln t).
        let entropy = keep_rows.sum_all()?.affine(self.row_entropy(), 0.0)?;
        let cross = true_dist.mul(output)?.sum_all()?;
        let loss = entropy.sub(&cross)?;

        if let Ok(mut slot) = self.true_dist.lock() {
            *slot = Some(true_dist);
        }
        Ok(loss)
    }

    /// `sum(t ln t)` of one non-padding row: the true class plus `size - 2` fill entries.
    fn row_entropy(&self) -> f64 {
        let fill = self.smoothing / (self.size - 2) as f64;
        let mut entropy = self.confidence * self.confidence.ln();
        if fill > 0.0 {
            entropy += (self.size - 2) as f64 * fill * fill.ln();
        }
        entropy
    }
}

/// Generator projection followed by [`LabelSmoothing`], normalized by a token count.
pub struct LossCompute<G> {
    generator: G,
    criterion: LabelSmoothing,
}

impl<G: Module> LossCompute<G> {
    pub fn new(generator: G, criterion: LabelSmoothing) -> Self {
        Self {
            generator,
            criterion,
        }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn criterion(&self) -> &LabelSmoothing {
        &self.criterion
    }

    /// Returns the summed loss as a detached host value (`loss / norm * norm`)
    /// for bookkeeping, and the `norm`-normalized loss still on the graph for
    /// backpropagation.
    pub fn compute(
        &self,
        x: &Tensor,
        y: &Tensor,
        norm: f64,
    ) -> Result<(f64, Tensor), TrainingError> {
        if !(norm > 0.0) {
            return Err(TrainingError::runtime(format!(
                "loss normalization requires a positive token count, got {}",
                norm
            )));
        }

        let projected = self.generator.forward(x)?;
        let vocab = projected.dim(candle_core::D::Minus1)?;
        let rows = projected.elem_count() / vocab.max(1);
        let flat_out = projected.contiguous()?.reshape((rows, vocab))?;
        let flat_y = y.contiguous()?.flatten_all()?;

        let sloss = self
            .criterion
            .forward(&flat_out, &flat_y)?
            .affine(1.0 / norm, 0.0)?;
        let display = sloss.detach().to_dtype(DType::F64)?.to_vec0::<f64>()? * norm;

        Ok((display, sloss))
    }
}
