use serde::{Deserialize, Serialize};

/// Cumulative progress of one worker's training run.
///
/// Created once per run and threaded through every epoch by `&mut`; the
/// counters only grow. Counters are local to the process and are not
/// reduced across data-parallel workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainState {
    /// Batches trained on (backward passes).
    pub step: usize,
    /// Optimizer updates applied.
    pub accum_step: usize,
    /// Examples consumed.
    pub samples: usize,
    /// Non-pad target tokens consumed.
    pub tokens: usize,
}

impl TrainState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(
            TrainState::new(),
            TrainState {
                step: 0,
                accum_step: 0,
                samples: 0,
                tokens: 0
            }
        );
    }
}
