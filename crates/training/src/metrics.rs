use std::time::{Duration, Instant};

use crate::TrainingError;

/// Tokens processed since the last progress report and the wall time spent on them.
#[derive(Debug)]
pub struct ThroughputWindow {
    started: Instant,
    tokens: usize,
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            tokens: 0,
        }
    }

    pub fn record(&mut self, tokens: usize) {
        self.tokens = self.tokens.saturating_add(tokens);
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn tokens_per_sec(&self) -> f64 {
        let elapsed = self.elapsed();
        if elapsed > Duration::ZERO {
            self.tokens as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        self.started = Instant::now();
        self.tokens = 0;
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Running sums of summed (un-normalized) loss and label tokens over an epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct LossTotals {
    loss_sum: f64,
    tokens: usize,
}

impl LossTotals {
    pub fn update(&mut self, loss: f64, tokens: usize) {
        self.loss_sum += loss;
        self.tokens += tokens;
    }

    pub fn loss_sum(&self) -> f64 {
        self.loss_sum
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Mean loss per token; undefined (an error) before any token was seen.
    pub fn mean(&self) -> Result<f64, TrainingError> {
        if self.tokens == 0 {
            return Err(TrainingError::runtime(
                "epoch processed no target tokens; mean loss is undefined",
            ));
        }
        Ok(self.loss_sum / self.tokens as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_average_per_token() {
        let mut totals = LossTotals::default();
        totals.update(12.0, 4);
        totals.update(3.0, 2);
        assert_eq!(totals.tokens(), 6);
        assert!((totals.mean().unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn empty_totals_have_no_mean() {
        assert!(LossTotals::default().mean().is_err());
    }

    #[test]
    fn window_resets_token_count() {
        let mut window = ThroughputWindow::new();
        window.record(10);
        window.record(5);
        assert_eq!(window.tokens(), 15);
        assert!(window.tokens_per_sec() >= 0.0);
        window.reset();
        assert_eq!(window.tokens(), 0);
    }
}
