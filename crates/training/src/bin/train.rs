use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{ops::log_softmax, Embedding, Linear, Module, VarBuilder, VarMap};
use clap::Parser;
use seq2seq_train::{
    run_epoch, Adam, AdamConfig, EpochOptions, LabelSmoothing, Logger, LoggingSettings,
    LossCompute, NoopOptimizer, NoopScheduler, Optimizer, RunMode, SchedulerConfig,
    Seq2SeqModel, StopOnSignal, SyntheticCopyTask, TrainState, TrainingConfig, TrainingError,
};
use serde_json::{Number, Value};

const DEFAULT_MODEL_WIDTH: usize = 32;
const EVAL_BATCHES: usize = 5;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Sequence-to-sequence copy-task trainer", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Data-parallel rank of this worker (overrides runtime.rank)")]
    rank: Option<usize>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Embeds the decoder input and adds the masked mean of the source embeddings.
struct CopyModel {
    src_embed: Embedding,
    tgt_embed: Embedding,
}

impl CopyModel {
    fn new(vocab_size: usize, width: usize, vb: VarBuilder) -> Result<Self, TrainingError> {
        Ok(Self {
            src_embed: candle_nn::embedding(vocab_size, width, vb.pp("src_embed"))?,
            tgt_embed: candle_nn::embedding(vocab_size, width, vb.pp("tgt_embed"))?,
        })
    }
}

impl Seq2SeqModel for CopyModel {
    fn forward(
        &self,
        src: &Tensor,
        tgt: &Tensor,
        src_mask: &Tensor,
        _tgt_mask: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let keep = src_mask.to_dtype(DType::F32)?.transpose(1, 2)?;
        let src_states = self.src_embed.forward(src)?.broadcast_mul(&keep)?;
        let count = keep.sum_keepdim(1)?.clamp(1f32, f32::MAX)?;
        let context = src_states.sum_keepdim(1)?.broadcast_div(&count)?;
        Ok(self.tgt_embed.forward(tgt)?.broadcast_add(&context)?)
    }
}

struct Generator {
    proj: Linear,
}

impl Module for Generator {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        log_softmax(&self.proj.forward(xs)?, D::Minus1)
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(rank) = args.rank {
        config.runtime.rank = rank;
    }
    config.validate()?;

    let device = Device::Cpu;
    let vocab_size = config.data.vocab_size;
    let width = config.scheduler.model_size.unwrap_or(DEFAULT_MODEL_WIDTH);

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
    let model = CopyModel::new(vocab_size, width, vb.clone())?;
    let generator = Generator {
        proj: candle_nn::linear(width, vocab_size, vb.pp("generator"))?,
    };

    let criterion = LabelSmoothing::new(
        vocab_size,
        config.loss.padding_idx(&config.data),
        config.loss.smoothing,
    )?;
    let loss_compute = LossCompute::new(generator, criterion);

    let mut scheduler =
        SchedulerConfig::from_training_config(&config.scheduler, config.optimizer.learning_rate)?
            .build()?;
    let mut optimizer = Adam::from_var_map(&var_map, AdamConfig::from(&config.optimizer))?;
    optimizer.set_learning_rate(scheduler.learning_rate());

    let mut logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
    let train_mode = RunMode::for_rank(config.runtime.rank);
    let train_options = EpochOptions::new(train_mode, config.data.accum_iter)?
        .with_log_every(config.runtime.log_every_n_batches)?;
    let eval_options = EpochOptions::new(RunMode::Eval, 1)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    log::info!(
        "training copy task: vocab={} width={} batch_size={} accum_iter={} mode={}",
        vocab_size,
        width,
        config.data.batch_size,
        config.data.accum_iter,
        train_options.mode
    );

    let mut train_state = TrainState::new();
    for epoch in 0..config.runtime.num_epochs {
        let seed = config.runtime.seed.wrapping_add(epoch as u64);
        let feed = SyntheticCopyTask::new(
            vocab_size,
            config.data.batch_size,
            config.data.sequence_length,
            config.data.batches_per_epoch,
            config.data.pad_id,
            seed,
            device.clone(),
        )?;
        let mut feed = StopOnSignal::new(feed, shutdown_flag.clone());
        if feed.is_finished() {
            log::info!("stop requested; ending before epoch {}", epoch);
            break;
        }
        let train = run_epoch(
            feed,
            &model,
            &loss_compute,
            &mut optimizer,
            scheduler.as_mut(),
            &train_options,
            &mut logger,
            &mut train_state,
        )?;

        let eval_feed = SyntheticCopyTask::new(
            vocab_size,
            config.data.batch_size,
            config.data.sequence_length,
            EVAL_BATCHES,
            config.data.pad_id,
            seed ^ 0x5eed,
            device.clone(),
        )?;
        let eval = run_epoch(
            eval_feed,
            &model,
            &loss_compute,
            &mut NoopOptimizer,
            &mut NoopScheduler,
            &eval_options,
            &mut logger,
            &mut train_state,
        )?;

        println!(
            "epoch {} | train loss {:.4} | eval loss {:.4} | steps {} | updates {} | samples {} | tokens {}",
            epoch,
            train.average_loss,
            eval.average_loss,
            train_state.step,
            train_state.accum_step,
            train_state.samples,
            train_state.tokens
        );
    }

    logger.flush();
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "invalid override path '{}'",
            path
        )));
    }

    let mut current = target;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::runtime(format!(
                "override path segment '{}' points into a non-object value",
                segment
            ))
        })?;
        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if idx + 1 == segments.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }

    Ok(())
}
