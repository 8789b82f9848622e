use std::fmt;
use std::thread;

use candle_core::{backprop::GradStore, Tensor};
use clap::ValueEnum;

use crate::algorithm::{positive_column, EvalAlgorithm};
use crate::config::to_runtime_error;
use crate::feed::TrainFeed;
use crate::optimizer::TrainerOptimizer;
use crate::TrainingError;

pub use crate::algorithm::InferenceOutputs as InferenceFetch;
pub use crate::algorithm::SamplingOutputs as SamplingFetch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TrainMode {
    #[default]
    Single,
    Parallel,
}

impl fmt::Display for TrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainMode::Single => f.write_str("single"),
            TrainMode::Parallel => f.write_str("parallel"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainFetch {
    /// Mean cross entropy over every item of the batch.
    pub loss: f32,
    pub click_prob: Tensor,
    pub click_id: Tensor,
}

#[derive(Debug, Clone)]
pub struct TestFetch {
    pub click_prob: Tensor,
    pub click_id: Tensor,
}

impl TrainFetch {
    pub fn positive_probs(&self) -> Result<Vec<f32>, TrainingError> {
        positive_column(&self.click_prob)
    }

    pub fn labels(&self) -> Result<Vec<i64>, TrainingError> {
        flat_labels(&self.click_id)
    }
}

impl TestFetch {
    pub fn positive_probs(&self) -> Result<Vec<f32>, TrainingError> {
        positive_column(&self.click_prob)
    }

    pub fn labels(&self) -> Result<Vec<i64>, TrainingError> {
        flat_labels(&self.click_id)
    }
}

fn flat_labels(click_id: &Tensor) -> Result<Vec<i64>, TrainingError> {
    click_id
        .flatten_all()
        .and_then(|labels| labels.to_dtype(candle_core::DType::I64))
        .and_then(|labels| labels.to_vec1::<i64>())
        .map_err(to_runtime_error)
}

/// Runs train and test requests for one task.
pub trait Executor: Send + Sync {
    fn mode(&self) -> TrainMode;

    /// Forward, backward and one optimizer step over the whole feed.
    fn train(
        &self,
        algorithm: &EvalAlgorithm,
        optimizer: &mut TrainerOptimizer,
        feed: &TrainFeed,
    ) -> Result<TrainFetch, TrainingError>;

    fn test(&self, algorithm: &EvalAlgorithm, feed: &TrainFeed) -> Result<TestFetch, TrainingError>;
}

/// Whole batches on the task device.
#[derive(Debug, Clone, Default)]
pub struct SingleExecutor;

impl Executor for SingleExecutor {
    fn mode(&self) -> TrainMode {
        TrainMode::Single
    }

    fn train(
        &self,
        algorithm: &EvalAlgorithm,
        optimizer: &mut TrainerOptimizer,
        feed: &TrainFeed,
    ) -> Result<TrainFetch, TrainingError> {
        let outputs = algorithm.train(feed)?;
        let loss = outputs.loss.to_vec0::<f32>().map_err(to_runtime_error)?;
        let mut grads = outputs.loss.backward().map_err(to_runtime_error)?;
        optimizer.step(&mut grads)?;
        Ok(TrainFetch {
            loss,
            click_prob: outputs.click_prob.detach(),
            click_id: outputs.click_id,
        })
    }

    fn test(&self, algorithm: &EvalAlgorithm, feed: &TrainFeed) -> Result<TestFetch, TrainingError> {
        let outputs = algorithm.test(feed)?;
        Ok(TestFetch {
            click_prob: outputs.click_prob,
            click_id: outputs.click_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStrategy {
    pub num_threads: usize,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self { num_threads: 1 }
    }
}

/// Splits every batch into one shard of whole sequences per device and merges
/// the shard gradients before a single optimizer step.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    num_devices: usize,
    strategy: ExecutionStrategy,
}

struct ShardStep {
    weighted_loss: f32,
    grads: GradStore,
    click_prob: Tensor,
    click_id: Tensor,
}

impl ParallelExecutor {
    pub fn new(num_devices: usize, strategy: ExecutionStrategy) -> Self {
        Self {
            num_devices: num_devices.max(1),
            strategy: ExecutionStrategy {
                num_threads: strategy.num_threads.max(1),
            },
        }
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    fn shards(&self, feed: &TrainFeed) -> Result<Vec<TrainFeed>, TrainingError> {
        let shards = feed.split(self.num_devices)?;
        if shards.is_empty() {
            return Err(TrainingError::runtime("batch has no items to split across devices"));
        }
        Ok(shards)
    }

    /// Applies `run` to every shard, at most `num_threads` at a time, keeping
    /// shard order in the result.
    fn run_sharded<T, F>(&self, shards: &[TrainFeed], run: F) -> Result<Vec<T>, TrainingError>
    where
        T: Send,
        F: Fn(&TrainFeed) -> Result<T, TrainingError> + Sync,
    {
        let workers = self.strategy.num_threads.min(shards.len()).max(1);
        if workers == 1 {
            return shards.iter().map(&run).collect();
        }

        let run = &run;
        let mut results = Vec::with_capacity(shards.len());
        thread::scope(|scope| {
            for group in shards.chunks(workers) {
                let handles: Vec<_> = group
                    .iter()
                    .map(|shard| scope.spawn(move || run(shard)))
                    .collect();
                for handle in handles {
                    let result = handle
                        .join()
                        .map_err(|_| TrainingError::runtime("parallel worker panicked"))??;
                    results.push(result);
                }
            }
            Ok::<(), TrainingError>(())
        })?;
        Ok(results)
    }
}

impl Executor for ParallelExecutor {
    fn mode(&self) -> TrainMode {
        TrainMode::Parallel
    }

    fn train(
        &self,
        algorithm: &EvalAlgorithm,
        optimizer: &mut TrainerOptimizer,
        feed: &TrainFeed,
    ) -> Result<TrainFetch, TrainingError> {
        let shards = self.shards(feed)?;
        let total_items = feed.num_items() as f64;
        log::debug!(
            "parallel step: {} item(s) in {} shard(s)",
            feed.num_items(),
            shards.len()
        );

        let steps = self.run_sharded(&shards, |shard| {
            let outputs = algorithm.train(shard)?;
            // weighting by item share makes the summed gradient equal the full-batch mean
            let weight = shard.num_items() as f64 / total_items;
            let weighted = outputs.loss.affine(weight, 0.0).map_err(to_runtime_error)?;
            let grads = weighted.backward().map_err(to_runtime_error)?;
            Ok(ShardStep {
                weighted_loss: weighted.to_vec0::<f32>().map_err(to_runtime_error)?,
                grads,
                click_prob: outputs.click_prob.detach(),
                click_id: outputs.click_id,
            })
        })?;

        let mut loss = 0f32;
        let mut merged: Option<GradStore> = None;
        let mut click_probs = Vec::with_capacity(steps.len());
        let mut click_ids = Vec::with_capacity(steps.len());
        for step in steps {
            loss += step.weighted_loss;
            match merged.as_mut() {
                Some(accum) => optimizer.merge_gradients(accum, step.grads)?,
                None => merged = Some(step.grads),
            }
            click_probs.push(step.click_prob);
            click_ids.push(step.click_id);
        }

        if let Some(mut grads) = merged {
            optimizer.step(&mut grads)?;
        }

        Ok(TrainFetch {
            loss,
            click_prob: Tensor::cat(&click_probs, 0).map_err(to_runtime_error)?,
            click_id: Tensor::cat(&click_ids, 0).map_err(to_runtime_error)?,
        })
    }

    fn test(&self, algorithm: &EvalAlgorithm, feed: &TrainFeed) -> Result<TestFetch, TrainingError> {
        let shards = self.shards(feed)?;
        let outputs = self.run_sharded(&shards, |shard| algorithm.test(shard))?;

        let (click_probs, click_ids): (Vec<_>, Vec<_>) = outputs
            .into_iter()
            .map(|output| (output.click_prob, output.click_id))
            .unzip();
        Ok(TestFetch {
            click_prob: Tensor::cat(&click_probs, 0).map_err(to_runtime_error)?,
            click_id: Tensor::cat(&click_ids, 0).map_err(to_runtime_error)?,
        })
    }
}
