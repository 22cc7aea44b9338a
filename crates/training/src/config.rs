use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::batch::DEFAULT_PAD_ID;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.vocab_size < 3 {
            errors.push(format!(
                "data.vocab_size must be at least 3 (got {})",
                self.data.vocab_size
            ));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.sequence_length < 2 {
            errors.push("data.sequence_length must be at least 2".to_string());
        }

        if self.data.batches_per_epoch == 0 {
            errors.push("data.batches_per_epoch must be greater than 0".to_string());
        }

        if self.data.accum_iter == 0 {
            errors.push("data.accum_iter must be greater than 0".to_string());
        }

        if self.data.pad_id as usize >= self.data.vocab_size {
            errors.push(format!(
                "data.pad_id {} is outside the vocabulary of size {}",
                self.data.pad_id, self.data.vocab_size
            ));
        }

        if !(0.0..1.0).contains(&self.loss.smoothing) {
            errors.push("loss.smoothing must be in [0, 1)".to_string());
        }

        if self.loss.padding_idx(&self.data) as usize >= self.data.vocab_size {
            errors.push("loss.padding_idx must be smaller than data.vocab_size".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        match self.scheduler.strategy {
            LearningRateSchedule::Noam => {
                if self.scheduler.model_size.unwrap_or(0) == 0 {
                    errors.push("scheduler.model_size is required for the noam schedule".to_string());
                }
                if self.scheduler.warmup_steps == 0 {
                    errors.push("scheduler.warmup_steps must be greater than 0 for noam".to_string());
                }
            }
            LearningRateSchedule::Constant => {}
        }

        if self.scheduler.factor <= 0.0 {
            errors.push("scheduler.factor must be greater than 0".to_string());
        }

        if self.runtime.num_epochs == 0 {
            errors.push("runtime.num_epochs must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_batches == 0 {
            errors.push("runtime.log_every_n_batches must be greater than 0".to_string());
        }

        if let Some(dir) = &self.runtime.logging.tensorboard {
            if dir.as_os_str().is_empty() {
                errors.push("runtime.logging.tensorboard must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub vocab_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,
    #[serde(default = "default_batches_per_epoch")]
    pub batches_per_epoch: usize,
    #[serde(default = "default_pad_id")]
    pub pad_id: u32,
    #[serde(default = "default_accum_iter")]
    pub accum_iter: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub smoothing: f64,
    /// Falls back to `data.pad_id` when unset.
    #[serde(default)]
    pub padding_idx: Option<u32>,
}

impl LossConfig {
    pub fn padding_idx(&self, data: &DataConfig) -> u32 {
        self.padding_idx.unwrap_or(data.pad_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    /// Embedding width `d_model` the noam rate is scaled by.
    #[serde(default)]
    pub model_size: Option<usize>,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            model_size: None,
            factor: default_factor(),
            warmup_steps: default_warmup_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Noam,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_every_n_batches")]
    pub log_every_n_batches: usize,
    #[serde(default)]
    pub rank: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            seed: default_seed(),
            log_every_n_batches: default_log_every_n_batches(),
            rank: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    80
}

fn default_sequence_length() -> usize {
    10
}

fn default_batches_per_epoch() -> usize {
    20
}

fn default_pad_id() -> u32 {
    DEFAULT_PAD_ID
}

fn default_accum_iter() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    1.0
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.98
}

fn default_adam_eps() -> f64 {
    1e-9
}

fn default_factor() -> f64 {
    1.0
}

fn default_warmup_steps() -> usize {
    400
}

fn default_num_epochs() -> usize {
    8
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_batches() -> usize {
    40
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    16
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("batch has no target fields; {0} requires tgt, tgt_y, tgt_mask and ntokens")]
    MissingTarget(&'static str),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        vocab_size = 11

        [scheduler]
        model_size = 512
    "#;

    #[test]
    fn defaults_follow_the_copy_task_setup() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.data.pad_id, DEFAULT_PAD_ID);
        assert_eq!(config.data.accum_iter, 1);
        assert_eq!(config.loss.padding_idx(&config.data), DEFAULT_PAD_ID);
        assert_eq!(config.scheduler.strategy, LearningRateSchedule::Noam);
        assert_eq!(config.runtime.log_every_n_batches, 40);
        assert!((config.optimizer.beta2 - 0.98).abs() < 1e-12);
        assert!((config.optimizer.epsilon - 1e-9).abs() < 1e-18);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.vocab_size = 2;
        config.data.accum_iter = 0;
        config.loss.smoothing = 1.0;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => {
                assert!(messages.iter().any(|m| m.contains("vocab_size")));
                assert!(messages.iter().any(|m| m.contains("accum_iter")));
                assert!(messages.iter().any(|m| m.contains("smoothing")));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn noam_requires_model_size() {
        let config: TrainingConfig = toml::from_str(
            r#"
            [data]
            vocab_size = 11

            [scheduler]
            strategy = "noam"
        "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(TrainingError::Validation(_))
        ));
    }
}
