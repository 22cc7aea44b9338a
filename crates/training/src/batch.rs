//! Masked training batches.
//!
//! A [`Batch`] is built once per step from padded `[batch, len]` token id
//! tensors. Masks use `DType::U8` with `1` meaning "may attend".

use candle_core::{DType, Device, Tensor};

use crate::TrainingError;

/// Id of the `<blank>` token reserved by the vocabulary.
pub const DEFAULT_PAD_ID: u32 = 2;

pub const MASK_DTYPE: DType = DType::U8;

#[derive(Debug, Clone)]
pub struct Batch {
    pub src: Tensor,
    /// `[batch, 1, src_len]`, set where `src != pad`.
    pub src_mask: Tensor,
    target: Option<TargetFields>,
}

/// Decoder-side fields, present only when the batch was built with a target.
#[derive(Debug, Clone)]
pub struct TargetFields {
    /// Decoder input: the target without its final position.
    pub tgt: Tensor,
    /// Next-token labels: the target without its first position.
    pub tgt_y: Tensor,
    /// `[batch, tgt_len - 1, tgt_len - 1]` padding AND causal mask.
    pub tgt_mask: Tensor,
    pub ntokens: usize,
}

impl Batch {
    pub fn new(src: Tensor, tgt: Option<Tensor>, pad_id: u32) -> Result<Self, TrainingError> {
        let (batch_size, _) = src.dims2().map_err(|_| {
            TrainingError::shape(format!(
                "src must be [batch, src_len], got {:?}",
                src.dims()
            ))
        })?;

        let src_mask = src.ne(pad_id)?.unsqueeze(1)?;

        let target = match tgt {
            Some(tgt) => Some(TargetFields::new(&tgt, batch_size, pad_id)?),
            None => None,
        };

        Ok(Self {
            src,
            src_mask,
            target,
        })
    }

    /// Inference-only batch with no decoder fields.
    pub fn source_only(src: Tensor, pad_id: u32) -> Result<Self, TrainingError> {
        Self::new(src, None, pad_id)
    }

    pub fn batch_size(&self) -> usize {
        self.src.dims()[0]
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<&TargetFields> {
        self.target.as_ref()
    }

    /// Target fields, or [`TrainingError::MissingTarget`] naming `context`.
    pub fn require_target(&self, context: &'static str) -> Result<&TargetFields, TrainingError> {
        self.target
            .as_ref()
            .ok_or(TrainingError::MissingTarget(context))
    }

    pub fn ntokens(&self) -> Option<usize> {
        self.target.as_ref().map(|target| target.ntokens)
    }
}

impl TargetFields {
    fn new(tgt: &Tensor, batch_size: usize, pad_id: u32) -> Result<Self, TrainingError> {
        let (tgt_batch, tgt_len) = tgt.dims2().map_err(|_| {
            TrainingError::shape(format!(
                "tgt must be [batch, tgt_len], got {:?}",
                tgt.dims()
            ))
        })?;
        if tgt_batch != batch_size {
            return Err(TrainingError::shape(format!(
                "src and tgt batch sizes differ ({} vs {})",
                batch_size, tgt_batch
            )));
        }
        if tgt_len < 2 {
            return Err(TrainingError::shape(format!(
                "tgt_len must be at least 2 to form input/label pairs, got {}",
                tgt_len
            )));
        }

        let tgt_in = tgt.narrow(1, 0, tgt_len - 1)?.contiguous()?;
        let tgt_y = tgt.narrow(1, 1, tgt_len - 1)?.contiguous()?;
        let tgt_mask = make_std_mask(&tgt_in, pad_id)?;

        let ntokens = tgt_y
            .ne(pad_id)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_vec0::<u32>()? as usize;

        Ok(Self {
            tgt: tgt_in,
            tgt_y,
            tgt_mask,
            ntokens,
        })
    }
}

/// Padding mask `[batch, 1, len]` combined with [`subsequent_mask`] by
/// broadcasting AND into `[batch, len, len]`.
pub fn make_std_mask(tgt: &Tensor, pad_id: u32) -> Result<Tensor, TrainingError> {
    let len = tgt.dim(1)?;
    let padding = tgt.ne(pad_id)?.unsqueeze(1)?;
    let causal = subsequent_mask(len, tgt.device())?;
    Ok(padding.broadcast_mul(&causal)?)
}

/// `[1, len, len]` lower-triangular mask, set where `col <= row`.
pub fn subsequent_mask(len: usize, device: &Device) -> Result<Tensor, TrainingError> {
    let positions = Tensor::arange(0u32, len as u32, device)?;
    let cols = positions.reshape((1, len))?.broadcast_as((len, len))?;
    let rows = positions.reshape((len, 1))?.broadcast_as((len, len))?;
    Ok(cols.le(&rows)?.to_dtype(MASK_DTYPE)?.unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(data: &[u32], shape: (usize, usize)) -> Tensor {
        Tensor::from_slice(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn subsequent_mask_is_lower_triangular() {
        let mask = subsequent_mask(4, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 4, 4]);
        let rows = mask.squeeze(0).unwrap().to_vec2::<u8>().unwrap();
        for (i, row) in rows.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                assert_eq!(value == 1, j <= i, "position ({i}, {j})");
            }
        }
    }

    #[test]
    fn target_mask_combines_padding_and_causality() {
        let pad = DEFAULT_PAD_ID;
        // tgt_len = 5 so the decoder sees L = 4; the second row pads its last input.
        let src = tokens(&[0, 4, 5, 0, 6, pad], (2, 3));
        let tgt = tokens(&[0, 4, 5, 6, 1, 0, 7, 8, pad, pad], (2, 5));
        let batch = Batch::new(src, Some(tgt.clone()), pad).unwrap();
        let target = batch.target().unwrap();

        assert_eq!(target.tgt.dims(), &[2, 4]);
        assert_eq!(target.tgt_y.dims(), &[2, 4]);
        assert_eq!(target.tgt_mask.dims(), &[2, 4, 4]);

        let tgt_rows = target.tgt.to_vec2::<u32>().unwrap();
        let mask = target.tgt_mask.to_vec3::<u8>().unwrap();
        for b in 0..2 {
            for i in 0..4 {
                for j in 0..4 {
                    let expected = j <= i && tgt_rows[b][j] != pad;
                    assert_eq!(mask[b][i][j] == 1, expected, "tgt_mask[{b}, {i}, {j}]");
                }
            }
        }
    }

    #[test]
    fn shifted_targets_drop_one_end_each() {
        let tgt = tokens(&[0, 4, 5, 6], (1, 4));
        let batch = Batch::new(tgt.clone(), Some(tgt), DEFAULT_PAD_ID).unwrap();
        let target = batch.target().unwrap();
        assert_eq!(target.tgt.to_vec2::<u32>().unwrap(), vec![vec![0, 4, 5]]);
        assert_eq!(target.tgt_y.to_vec2::<u32>().unwrap(), vec![vec![4, 5, 6]]);
    }

    #[test]
    fn source_mask_marks_non_pad_positions() {
        let pad = DEFAULT_PAD_ID;
        let batch = Batch::source_only(tokens(&[5, 6, pad, 7, pad, pad], (2, 3)), pad).unwrap();
        assert_eq!(batch.src_mask.dims(), &[2, 1, 3]);
        assert_eq!(
            batch.src_mask.squeeze(1).unwrap().to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 0], vec![1, 0, 0]]
        );
        assert!(!batch.has_target());
        assert!(matches!(
            batch.require_target("training"),
            Err(TrainingError::MissingTarget("training"))
        ));
    }

    #[test]
    fn ntokens_counts_non_pad_labels() {
        let pad = DEFAULT_PAD_ID;
        let tgt = tokens(&[0, 4, 5, 6, 0, 7, pad, pad], (2, 4));
        let batch = Batch::new(tgt.clone(), Some(tgt), pad).unwrap();
        // tgt_y = [[4, 5, 6], [7, pad, pad]]
        assert_eq!(batch.ntokens(), Some(4));
    }

    #[test]
    fn ntokens_without_padding_is_batch_times_label_len() {
        let data: Vec<u32> = (0..12).map(|v| 3 + v % 5).collect();
        let tgt = tokens(&data, (3, 4));
        let batch = Batch::new(tgt.clone(), Some(tgt), DEFAULT_PAD_ID).unwrap();
        assert_eq!(batch.ntokens(), Some(3 * (4 - 1)));
        assert_eq!(batch.batch_size(), 3);
    }

    #[test]
    fn rejects_single_position_targets() {
        let src = tokens(&[4, 5], (2, 1));
        let err = Batch::new(src.clone(), Some(src), DEFAULT_PAD_ID).unwrap_err();
        assert!(matches!(err, TrainingError::Shape(_)));
    }

    #[test]
    fn rejects_mismatched_batch_sizes() {
        let src = tokens(&[4, 5, 6, 7], (2, 2));
        let tgt = tokens(&[4, 5, 6], (1, 3));
        assert!(matches!(
            Batch::new(src, Some(tgt), DEFAULT_PAD_ID),
            Err(TrainingError::Shape(_))
        ));
    }
}
