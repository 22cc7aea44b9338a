pub mod batch;
pub mod config;
pub mod data;
pub mod epoch;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod state;

pub use batch::{Batch, TargetFields, DEFAULT_PAD_ID};
pub use config::{TrainingConfig, TrainingError};
pub use data::{pad_sequences, StopOnSignal, SyntheticCopyTask};
pub use epoch::{run_epoch, EpochOptions, EpochSummary, RunMode, Seq2SeqModel};
pub use logging::{Logger, LoggingSettings, ProgressReport};
pub use loss::{LabelSmoothing, LossCompute};
pub use optimizer::{Adam, AdamConfig, NoopOptimizer, Optimizer};
pub use scheduler::{LRScheduler, NoamScheduler, NoopScheduler, SchedulerConfig};
pub use state::TrainState;
