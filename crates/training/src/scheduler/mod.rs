use crate::{config, TrainingError};

/// Learning-rate schedule advanced once per training batch.
pub trait LRScheduler: Send {
    /// Advance by one unit and return the new rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    Noam {
        base_lr: f64,
        model_size: usize,
        factor: f64,
        warmup_steps: usize,
    },
    Constant {
        base_lr: f64,
        warmup_steps: usize,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        match cfg.strategy {
            config::LearningRateSchedule::Noam => {
                let model_size = cfg.model_size.ok_or_else(|| {
                    TrainingError::initialization("noam schedule requires scheduler.model_size")
                })?;
                Ok(SchedulerConfig::Noam {
                    base_lr,
                    model_size,
                    factor: cfg.factor,
                    warmup_steps: cfg.warmup_steps,
                })
            }
            config::LearningRateSchedule::Constant => Ok(SchedulerConfig::Constant {
                base_lr,
                warmup_steps: cfg.warmup_steps,
            }),
        }
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            SchedulerConfig::Noam {
                base_lr,
                model_size,
                factor,
                warmup_steps,
            } => Ok(Box::new(NoamScheduler::new(
                base_lr,
                model_size,
                factor,
                warmup_steps,
            )?)),
            SchedulerConfig::Constant {
                base_lr,
                warmup_steps,
            } => Ok(Box::new(ConstantLr::new(base_lr, warmup_steps)?)),
        }
    }
}

/// Inverse-square-root schedule with linear warmup:
/// `base_lr * factor * d_model^-0.5 * min(s^-0.5, s * warmup^-1.5)`, `s = max(step, 1)`.
///
/// Step 0 is the rate in effect before the first [`step`](LRScheduler::step).
#[derive(Debug, Clone)]
pub struct NoamScheduler {
    base_lr: f64,
    model_size: usize,
    factor: f64,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl NoamScheduler {
    pub fn new(
        base_lr: f64,
        model_size: usize,
        factor: f64,
        warmup_steps: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if model_size == 0 || warmup_steps == 0 {
            return Err(TrainingError::initialization(
                "noam schedule requires model_size and warmup_steps greater than zero",
            ));
        }
        let mut scheduler = Self {
            base_lr,
            model_size,
            factor,
            warmup_steps,
            step: 0,
            current_lr: 0.0,
        };
        scheduler.current_lr = scheduler.compute_lr(0);
        Ok(scheduler)
    }

    pub fn rate(step: usize, model_size: usize, factor: f64, warmup_steps: usize) -> f64 {
        let step = step.max(1) as f64;
        factor
            * (model_size as f64).powf(-0.5)
            * step.powf(-0.5).min(step * (warmup_steps as f64).powf(-1.5))
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    fn compute_lr(&self, step: usize) -> f64 {
        self.base_lr * Self::rate(step, self.model_size, self.factor, self.warmup_steps)
    }
}

impl LRScheduler for NoamScheduler {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.compute_lr(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

/// `base_lr * min(1, s / warmup)` with `s = max(step, 1)`; constant once warm.
/// `warmup_steps == 0` disables the ramp.
#[derive(Debug, Clone)]
pub struct ConstantLr {
    base_lr: f64,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl ConstantLr {
    pub fn new(base_lr: f64, warmup_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        let mut scheduler = Self {
            base_lr,
            warmup_steps,
            step: 0,
            current_lr: 0.0,
        };
        scheduler.current_lr = scheduler.compute_lr(0);
        Ok(scheduler)
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps == 0 {
            return self.base_lr;
        }
        let progress = step.max(1) as f64 / self.warmup_steps as f64;
        self.base_lr * progress.min(1.0)
    }
}

impl LRScheduler for ConstantLr {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.compute_lr(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

/// Stand-in for evaluation runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl LRScheduler for NoopScheduler {
    fn step(&mut self) -> f64 {
        0.0
    }

    fn learning_rate(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noam_warms_up_then_decays() {
        let mut scheduler = NoamScheduler::new(1.0, 512, 1.0, 4).unwrap();
        let initial = scheduler.learning_rate();
        // Step 0 is clamped to step 1.
        assert!((initial - NoamScheduler::rate(1, 512, 1.0, 4)).abs() < 1e-15);

        let rates: Vec<f64> = (0..8).map(|_| scheduler.step()).collect();
        // Peak at the warmup boundary, step 4.
        assert!(rates[0] < rates[3]);
        assert!(rates[3] > rates[4]);
        assert!(rates[4] > rates[7]);
        let peak = 512f64.powf(-0.5) * 4f64.powf(-0.5);
        assert!((rates[3] - peak).abs() < 1e-12);
        assert_eq!(scheduler.steps(), 8);
    }

    #[test]
    fn noam_scales_with_base_lr_and_factor() {
        let a = NoamScheduler::rate(10, 256, 1.0, 100);
        let b = NoamScheduler::rate(10, 256, 2.0, 100);
        assert!((b - 2.0 * a).abs() < 1e-15);

        let scheduler = NoamScheduler::new(0.5, 256, 1.0, 100).unwrap();
        assert!((scheduler.learning_rate() - 0.5 * NoamScheduler::rate(0, 256, 1.0, 100)).abs() < 1e-15);
    }

    #[test]
    fn builds_from_training_config() {
        let cfg = config::SchedulerConfig {
            strategy: config::LearningRateSchedule::Noam,
            model_size: Some(64),
            factor: 1.0,
            warmup_steps: 10,
        };
        let mut scheduler = SchedulerConfig::from_training_config(&cfg, 1.0)
            .unwrap()
            .build()
            .unwrap();
        let expected = NoamScheduler::rate(1, 64, 1.0, 10);
        assert!((scheduler.step() - expected).abs() < 1e-15);
    }

    #[test]
    fn constant_schedule_never_moves() {
        let mut scheduler = ConstantLr::new(3e-4, 0).unwrap();
        assert_eq!(scheduler.learning_rate(), 3e-4);
        assert_eq!(scheduler.step(), 3e-4);
        assert_eq!(scheduler.step(), 3e-4);
        assert!(ConstantLr::new(0.0, 0).is_err());
    }

    #[test]
    fn constant_schedule_ramps_linearly_through_warmup() {
        let mut scheduler = ConstantLr::new(1.0, 4).unwrap();
        // Step 0 is clamped to step 1.
        assert_eq!(scheduler.learning_rate(), 0.25);
        let rates: Vec<f64> = (0..6).map(|_| scheduler.step()).collect();
        assert_eq!(rates, vec![0.25, 0.5, 0.75, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn constant_warmup_comes_from_training_config() {
        let cfg = config::SchedulerConfig {
            strategy: config::LearningRateSchedule::Constant,
            model_size: None,
            factor: 1.0,
            warmup_steps: 2,
        };
        let mut scheduler = SchedulerConfig::from_training_config(&cfg, 0.5)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(scheduler.learning_rate(), 0.25);
        assert_eq!(scheduler.step(), 0.25);
        assert_eq!(scheduler.step(), 0.5);
        assert_eq!(scheduler.step(), 0.5);
    }
}
