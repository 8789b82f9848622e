use std::fs;
use std::path::{Path, PathBuf};

use candle_core::IndexOp;
use candle_nn::VarMap;
use model::SlotInputs;
use rand::Rng;

use crate::algorithm::EvalAlgorithm;
use crate::checkpoint::{
    apply_parameters, checkpoint_path, latest_checkpoint_step, named_parameters, save_parameters,
};
use crate::config::to_runtime_error;
use crate::device::{num_devices, num_threads};
use crate::executor::{
    ExecutionStrategy, Executor, InferenceFetch, ParallelExecutor, SamplingFetch, SingleExecutor,
    TestFetch, TrainFetch, TrainMode,
};
use crate::feed::TrainFeed;
use crate::optimizer::TrainerOptimizer;
use crate::TrainingError;

/// Owns the parameter store shared by every mode, the optimizer over it and
/// the executor that runs requests.
pub struct EvalComputationTask {
    algorithm: EvalAlgorithm,
    scope: VarMap,
    optimizer: TrainerOptimizer,
    executor: Box<dyn Executor>,
    model_dir: PathBuf,
    ckp_step: i64,
}

impl EvalComputationTask {
    /// `scope` must already hold the parameters of `algorithm`'s model. The
    /// latest checkpoint in `model_dir`, if any, is restored.
    pub fn new(
        algorithm: EvalAlgorithm,
        scope: VarMap,
        model_dir: impl Into<PathBuf>,
        mode: TrainMode,
    ) -> Result<Self, TrainingError> {
        let params = named_parameters(&scope)?;
        log::info!(
            "task: {} model with {} parameter tensor(s), {mode} mode",
            algorithm.model_kind(),
            params.len()
        );
        let optimizer = algorithm.build_optimizer(params)?;
        log::info!("optimizer learning rate {}", optimizer.learning_rate());

        let executor: Box<dyn Executor> = match mode {
            TrainMode::Single => Box::new(SingleExecutor),
            TrainMode::Parallel => {
                let device = algorithm.device();
                let devices = num_devices(device);
                let strategy = ExecutionStrategy {
                    num_threads: num_threads(device, devices),
                };
                log::info!(
                    "parallel executor: {devices} shard(s) per batch, {} worker thread(s)",
                    strategy.num_threads
                );
                Box::new(ParallelExecutor::new(devices, strategy))
            }
        };

        let mut task = Self {
            algorithm,
            scope,
            optimizer,
            executor,
            model_dir: model_dir.into(),
            ckp_step: -1,
        };
        let model_dir = task.model_dir.clone();
        task.ckp_step = task.load_model(&model_dir, None)?;
        Ok(task)
    }

    /// Replaces the executor, e.g. to pin the shard count.
    pub fn with_executor(mut self, executor: Box<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn train(&mut self, feed: &TrainFeed) -> Result<TrainFetch, TrainingError> {
        self.executor.train(&self.algorithm, &mut self.optimizer, feed)
    }

    pub fn test(&self, feed: &TrainFeed) -> Result<TestFetch, TrainingError> {
        self.executor.test(&self.algorithm, feed)
    }

    pub fn inference(&self, inputs: &SlotInputs) -> Result<InferenceFetch, TrainingError> {
        self.algorithm.inference(inputs)
    }

    pub fn eps_greedy_sampling<R: Rng + ?Sized>(
        &self,
        inputs: &SlotInputs,
        rng: &mut R,
    ) -> Result<SamplingFetch, TrainingError> {
        self.algorithm.eps_greedy_sampling(inputs, rng)
    }

    pub fn softmax_sampling<R: Rng + ?Sized>(
        &self,
        inputs: &SlotInputs,
        rng: &mut R,
    ) -> Result<SamplingFetch, TrainingError> {
        self.algorithm.softmax_sampling(inputs, rng)
    }

    /// Writes every parameter to `<path>/model-<step>.ckp`.
    pub fn save_model(&self, path: &Path, step: i64) -> Result<PathBuf, TrainingError> {
        fs::create_dir_all(path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create model directory {}: {err}",
                path.display()
            ))
        })?;
        let file = checkpoint_path(path, step);
        save_parameters(&self.scope, &file)?;
        log::info!("saved checkpoint {}", file.display());
        Ok(file)
    }

    /// Restores `step`, or the latest checkpoint when `step` is `None`.
    /// Returns the restored step, -1 when there was nothing to restore.
    pub fn load_model(&mut self, path: &Path, step: Option<i64>) -> Result<i64, TrainingError> {
        let step = match step {
            Some(step) => step,
            None => latest_checkpoint_step(path)?,
        };
        if step < 0 {
            log::info!("no checkpoint in {}, starting from scratch", path.display());
            self.ckp_step = -1;
            return Ok(-1);
        }

        let file = checkpoint_path(path, step);
        apply_parameters(&self.scope, &file, self.algorithm.device())?;
        log::info!("restored checkpoint {}", file.display());
        self.ckp_step = step;
        Ok(step)
    }

    pub fn get_latest_checkpoint(&self, path: &Path) -> Result<i64, TrainingError> {
        latest_checkpoint_step(path)
    }

    /// Step restored at construction (or by the last `load_model`), -1 for none.
    pub fn ckp_step(&self) -> i64 {
        self.ckp_step
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn algorithm(&self) -> &EvalAlgorithm {
        &self.algorithm
    }

    pub fn scope(&self) -> &VarMap {
        &self.scope
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn log_parameter_shapes(&self) -> Result<(), TrainingError> {
        for (name, var) in named_parameters(&self.scope)? {
            let tensor = var.as_tensor();
            let leading = tensor
                .flatten_all()
                .and_then(|flat| {
                    let take = flat.dim(0)?.min(4);
                    flat.i(..take)?.to_vec1::<f32>()
                })
                .map_err(to_runtime_error)?;
            log::info!("{name}: shape={:?} leading={:?}", tensor.dims(), leading);
        }
        Ok(())
    }
}
