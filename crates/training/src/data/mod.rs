use std::{
    iter::Peekable,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{batch::Batch, TrainingError};

type Result<T> = std::result::Result<T, TrainingError>;

/// Start-of-sequence id placed in the first column of every copy-task row.
pub const COPY_TASK_START_ID: u32 = 1;

/// Collate variable-length id sequences into a `[batch, max_len]` tensor,
/// right-padding with `pad_id`.
pub fn pad_sequences(sequences: &[Vec<u32>], pad_id: u32, device: &Device) -> Result<Tensor> {
    if sequences.is_empty() {
        return Err(TrainingError::shape("cannot collate an empty batch"));
    }
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    if max_len == 0 {
        return Err(TrainingError::shape("cannot collate empty sequences"));
    }

    let mut tokens = Vec::with_capacity(sequences.len() * max_len);
    for seq in sequences {
        tokens.extend_from_slice(seq);
        tokens.resize(tokens.len() + (max_len - seq.len()), pad_id);
    }

    Ok(Tensor::from_vec(tokens, (sequences.len(), max_len), device)?)
}

/// Seeded stream of copy-task batches: the model must reproduce `src` as `tgt`.
///
/// Ids are drawn uniformly from `[1, vocab_size)`, skipping the pad id, and
/// the first column is always [`COPY_TASK_START_ID`]. Yields `batches` items.
pub struct SyntheticCopyTask {
    vocab_size: u32,
    batch_size: usize,
    sequence_length: usize,
    pad_id: u32,
    remaining: usize,
    rng: StdRng,
    device: Device,
}

impl SyntheticCopyTask {
    pub fn new(
        vocab_size: usize,
        batch_size: usize,
        sequence_length: usize,
        batches: usize,
        pad_id: u32,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if vocab_size < 3 {
            return Err(TrainingError::initialization(
                "copy task needs a vocabulary of at least 3 ids",
            ));
        }
        if batch_size == 0 || sequence_length < 2 {
            return Err(TrainingError::initialization(
                "copy task needs batch_size > 0 and sequence_length >= 2",
            ));
        }
        if pad_id == COPY_TASK_START_ID {
            return Err(TrainingError::initialization(
                "pad id must differ from the copy-task start id",
            ));
        }
        Ok(Self {
            vocab_size: vocab_size as u32,
            batch_size,
            sequence_length,
            pad_id,
            remaining: batches,
            rng: StdRng::seed_from_u64(seed),
            device,
        })
    }

    fn sample_token(&mut self) -> u32 {
        loop {
            let token = self.rng.gen_range(1..self.vocab_size);
            if token != self.pad_id {
                return token;
            }
        }
    }

    fn build_batch(&mut self) -> Result<Batch> {
        let mut rows = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let mut row = Vec::with_capacity(self.sequence_length);
            row.push(COPY_TASK_START_ID);
            for _ in 1..self.sequence_length {
                row.push(self.sample_token());
            }
            rows.push(row);
        }
        let data = pad_sequences(&rows, self.pad_id, &self.device)?;
        Batch::new(data.clone(), Some(data), self.pad_id)
    }
}

impl Iterator for SyntheticCopyTask {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.build_batch())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Batch feed that ends as soon as `stop` is raised, e.g. from a Ctrl-C handler.
///
/// Once [`is_finished`](Self::is_finished) has reported a pending batch, that
/// batch is yielded even if the stop arrives in between, so a started epoch
/// never comes up empty.
pub struct StopOnSignal<I: Iterator> {
    inner: Peekable<I>,
    stop: Arc<AtomicBool>,
    committed: bool,
}

impl<I: Iterator> StopOnSignal<I> {
    pub fn new(batches: I, stop: Arc<AtomicBool>) -> Self {
        Self {
            inner: batches.peekable(),
            stop,
            committed: false,
        }
    }

    /// True when no batch will be yielded, either because the stop was
    /// raised or because the underlying feed is empty.
    pub fn is_finished(&mut self) -> bool {
        let finished = self.stop.load(Ordering::Relaxed) || self.inner.peek().is_none();
        self.committed = !finished;
        finished
    }
}

impl<I: Iterator> Iterator for StopOnSignal<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if !std::mem::take(&mut self.committed) && self.stop.load(Ordering::Relaxed) {
            return None;
        }
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DEFAULT_PAD_ID;

    #[test]
    fn pads_ragged_sequences_on_the_right() {
        let seqs = vec![vec![1, 5, 6], vec![1, 7], vec![1]];
        let tensor = pad_sequences(&seqs, DEFAULT_PAD_ID, &Device::Cpu).unwrap();
        assert_eq!(
            tensor.to_vec2::<u32>().unwrap(),
            vec![vec![1, 5, 6], vec![1, 7, 2], vec![1, 2, 2]]
        );
    }

    #[test]
    fn empty_batches_are_rejected() {
        assert!(pad_sequences(&[], DEFAULT_PAD_ID, &Device::Cpu).is_err());
    }

    #[test]
    fn copy_task_batches_have_no_padding() {
        let task = SyntheticCopyTask::new(11, 4, 6, 3, DEFAULT_PAD_ID, 7, Device::Cpu).unwrap();
        let batches: Vec<Batch> = task.collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert_eq!(batch.ntokens(), Some(4 * 5));
            let rows = batch.src.to_vec2::<u32>().unwrap();
            for row in rows {
                assert_eq!(row[0], COPY_TASK_START_ID);
                assert!(row.iter().all(|&t| t != DEFAULT_PAD_ID && t < 11));
            }
        }
    }

    #[test]
    fn copy_task_is_reproducible_from_seed() {
        let first = SyntheticCopyTask::new(11, 2, 5, 1, DEFAULT_PAD_ID, 3, Device::Cpu)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let second = SyntheticCopyTask::new(11, 2, 5, 1, DEFAULT_PAD_ID, 3, Device::Cpu)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(
            first.src.to_vec2::<u32>().unwrap(),
            second.src.to_vec2::<u32>().unwrap()
        );
    }

    #[test]
    fn stop_signal_ends_the_feed() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = StopOnSignal::new(0..5, stop.clone());
        assert!(!feed.is_finished());
        assert_eq!(feed.next(), Some(0));
        assert_eq!(feed.next(), Some(1));
        stop.store(true, Ordering::Relaxed);
        assert!(feed.is_finished());
        assert_eq!(feed.next(), None);
    }

    #[test]
    fn stop_before_the_first_batch_is_a_finished_feed() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut feed = StopOnSignal::new(0..5, stop);
        assert!(feed.is_finished());
        assert_eq!(feed.count(), 0);

        let never = Arc::new(AtomicBool::new(false));
        let mut empty = StopOnSignal::new(std::iter::empty::<u32>(), never);
        assert!(empty.is_finished());
    }

    #[test]
    fn a_pending_batch_survives_a_late_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut feed = StopOnSignal::new(0..5, stop.clone());
        assert!(!feed.is_finished());
        stop.store(true, Ordering::Relaxed);
        assert_eq!(feed.next(), Some(0));
        assert_eq!(feed.next(), None);
    }
}
