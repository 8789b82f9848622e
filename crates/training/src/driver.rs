use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};
use model::{build_model, ModelKind};
use slot_data::{sequence_unconcat, BatchData, NpzDataset, SlotSchema};

use crate::algorithm::EvalAlgorithm;
use crate::config::{Config, ConfigOverride};
use crate::device::setup_device;
use crate::executor::TrainMode;
use crate::feed::FeedConvertor;
use crate::logging::{add_scalar_summary, SummaryWriter};
use crate::metrics::{AucMetrics, SequenceCorrelationMetrics, SequenceRmseMetrics};
use crate::task::EvalComputationTask;
use crate::TrainingError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Task {
    #[default]
    Train,
    Test,
    Eval,
    Debug,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "List-wise click model training and evaluation", long_about = None)]
pub struct Args {
    #[arg(long, value_name = "EXP", help = "Experiment id, loaded from <conf_dir>/<exp>.toml")]
    pub exp: String,

    #[arg(
        long = "use_cuda",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=1),
        help = "Run on CUDA device 0 when available (0 or 1)"
    )]
    pub use_cuda: u8,

    #[arg(long = "train_mode", value_enum, default_value_t = TrainMode::Single)]
    pub train_mode: TrainMode,

    #[arg(long, value_enum, default_value_t = Task::Train)]
    pub task: Task,

    #[arg(long, default_value = "BiRNN", help = "Model variant: BiRNN or Trans")]
    pub model: ModelKind,

    #[arg(long = "conf_dir", value_name = "DIR", default_value = "conf")]
    pub conf_dir: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    pub overrides: Vec<ConfigOverride>,
}

pub enum RunOutcome {
    Finished,
    /// `--task eval` hands the constructed task back to the caller.
    Task(Box<EvalComputationTask>),
}

/// Everything one run needs besides the task itself.
struct Session {
    config: Config,
    schema: Arc<SlotSchema>,
    convertor: FeedConvertor,
    task: EvalComputationTask,
}

pub fn run(args: &Args) -> Result<RunOutcome, TrainingError> {
    log::info!("args: {args:?}");
    let config = Config::for_experiment(&args.conf_dir, &args.exp)?.apply_overrides(&args.overrides)?;
    log::info!("config: {config:?}");

    let mut session = Session::build(args, config)?;
    match args.task {
        Task::Test => {
            let step = session.task.ckp_step();
            session.test_epoch(None, step)?;
        }
        Task::Debug => {}
        Task::Eval => return Ok(RunOutcome::Task(Box::new(session.task))),
        Task::Train => session.train()?,
    }
    Ok(RunOutcome::Finished)
}

impl Session {
    fn build(args: &Args, config: Config) -> Result<Self, TrainingError> {
        let device = setup_device(args.use_cuda == 1, config.seed);
        let schema = Arc::new(SlotSchema::from_path(&config.npz_config_path)?);
        let task = build_task(&config, &schema, args.model, args.train_mode, &device)?;
        let convertor = FeedConvertor::new(
            config.user_slot_names.clone(),
            config.item_slot_names.clone(),
            config.label_name.clone(),
            device,
        );
        Ok(Self {
            config,
            schema,
            convertor,
            task,
        })
    }

    fn train(&mut self) -> Result<(), TrainingError> {
        let mut summary_writer = SummaryWriter::create(&self.config.summary_dir)?;
        let first_epoch = self.task.ckp_step() + 1;
        let last_epoch = self.config.max_train_steps as i64;
        if first_epoch >= last_epoch {
            log::info!(
                "checkpoint step {} already reaches max_train_steps {}, nothing to train",
                self.task.ckp_step(),
                self.config.max_train_steps
            );
        }

        for epoch_id in first_epoch..last_epoch {
            self.train_epoch(&mut summary_writer, epoch_id)?;
            let model_dir = self.config.model_dir.clone();
            self.task.save_model(&model_dir, epoch_id)?;
            self.test_epoch(Some(&mut summary_writer), epoch_id)?;
        }
        Ok(())
    }

    fn dataset(&self, paths: &[PathBuf], shuffle: bool) -> Result<NpzDataset, TrainingError> {
        Ok(NpzDataset::with_schema(
            paths,
            Arc::clone(&self.schema),
            &self.config.requested_npz_names,
            shuffle,
        )?)
    }

    fn train_epoch(
        &mut self,
        summary_writer: &mut SummaryWriter,
        epoch_id: i64,
    ) -> Result<(), TrainingError> {
        let dataset = self
            .dataset(&self.config.train_npz_list, true)?
            .with_seed(self.config.seed.wrapping_add(epoch_id as u64));

        let mut epoch_losses = Vec::new();
        let mut interval_losses = Vec::new();
        let mut batch_id = 0usize;
        for raw in dataset.get_data_generator(self.config.batch_size)? {
            let batch = BatchData::new(&self.schema, raw?)?;
            if batch.num_items() == 0 {
                log::debug!("skipping batch without items");
                continue;
            }
            let feed = self.convertor.train_test(&batch)?;
            let fetch = self.task.train(&feed)?;
            epoch_losses.push(fetch.loss);
            interval_losses.push(fetch.loss);
            if batch_id % self.config.prt_interval == 0 {
                log::info!("batch_id:{} loss:{:.6}", batch_id, mean(&interval_losses));
                interval_losses.clear();
            }
            batch_id += 1;
        }

        if epoch_losses.is_empty() {
            log::warn!("epoch {epoch_id}: no training batches");
        }
        add_scalar_summary(Some(summary_writer), epoch_id, "train/loss", mean(&epoch_losses))
    }

    fn test_epoch(
        &self,
        mut summary_writer: Option<&mut SummaryWriter>,
        epoch_id: i64,
    ) -> Result<(), TrainingError> {
        if self.config.test_npz_list.is_empty() {
            log::info!("no test archives configured, skipping evaluation");
            return Ok(());
        }
        let dataset = self.dataset(&self.config.test_npz_list, false)?;

        let mut auc_metric = AucMetrics::new();
        let mut seq_rmse_metric = SequenceRmseMetrics::new();
        let mut seq_correlation_metric = SequenceCorrelationMetrics::new();
        for raw in dataset.get_data_generator(self.config.batch_size)? {
            let batch = BatchData::new(&self.schema, raw?)?;
            if batch.num_items() == 0 {
                continue;
            }
            let fetch = self.task.test(&self.convertor.train_test(&batch)?)?;
            let click_id = fetch.labels()?;
            let click_prob = fetch.positive_probs()?;
            auc_metric.add(&click_id, &click_prob)?;

            let labels: Vec<f32> = click_id.iter().map(|&label| label as f32).collect();
            let labels = sequence_unconcat(&labels, batch.seq_lens())?;
            let preds = sequence_unconcat(&click_prob, batch.seq_lens())?;
            seq_rmse_metric.add(&labels, &preds)?;
            seq_correlation_metric.add(&labels, &preds)?;
        }

        log::debug!(
            "{} sequence(s) without a defined correlation",
            seq_correlation_metric.skipped_sequences()
        );
        add_scalar_summary(
            summary_writer.as_deref_mut(),
            epoch_id,
            "test/auc",
            auc_metric.overall_auc(),
        )?;
        add_scalar_summary(
            summary_writer.as_deref_mut(),
            epoch_id,
            "test/seq_rmse",
            seq_rmse_metric.overall_rmse(),
        )?;
        add_scalar_summary(
            summary_writer,
            epoch_id,
            "test/seq_correlation",
            seq_correlation_metric.overall_correlation(),
        )
    }
}

/// Builds model, algorithm and task around a fresh parameter store.
pub fn build_task(
    config: &Config,
    schema: &SlotSchema,
    kind: ModelKind,
    mode: TrainMode,
    device: &Device,
) -> Result<EvalComputationTask, TrainingError> {
    let model_config = config.model_config(schema, device)?;
    let scope = VarMap::new();
    let vb = VarBuilder::from_varmap(&scope, DType::F32, device);
    let model = build_model(kind, &model_config, vb)
        .map_err(|err| TrainingError::initialization(format!("failed to build {kind}: {err}")))?;
    let algorithm = EvalAlgorithm::new(
        model,
        config.optimizer,
        config.lr,
        config.model.sampling_eps,
        device.clone(),
    );
    let task = EvalComputationTask::new(algorithm, scope, &config.model_dir, mode)?;
    task.log_parameter_shapes()?;
    Ok(task)
}

fn mean(values: &[f32]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
    }
}
