use candle_core::{Device, Tensor, Var, D};
use candle_nn::ops;
use model::{eps_greedy_sample, softmax_sample, ClickModel, ModelKind, SlotInputs};
use rand::Rng;

use crate::config::{to_runtime_error, OptimizerType};
use crate::feed::TrainFeed;
use crate::loss::CrossEntropyLoss;
use crate::optimizer::{OptimizerConfig, TrainerOptimizer};
use crate::TrainingError;

#[derive(Debug, Clone)]
pub struct TrainOutputs {
    /// Mean cross entropy over the items of the feed, still attached to the graph.
    pub loss: Tensor,
    pub click_prob: Tensor,
    pub click_id: Tensor,
}

#[derive(Debug, Clone)]
pub struct TestOutputs {
    pub click_prob: Tensor,
    pub click_id: Tensor,
}

#[derive(Debug, Clone)]
pub struct InferenceOutputs {
    pub click_prob: Tensor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingOutputs {
    /// Chosen position within each sequence, `None` for empty sequences.
    pub sampled_id: Vec<Option<usize>>,
}

/// Click model plus the loss and optimizer settings used to train it.
pub struct EvalAlgorithm {
    model: Box<dyn ClickModel>,
    loss: CrossEntropyLoss,
    optimizer_type: OptimizerType,
    lr: f64,
    sampling_eps: f64,
    device: Device,
}

impl EvalAlgorithm {
    pub fn new(
        model: Box<dyn ClickModel>,
        optimizer_type: OptimizerType,
        lr: f64,
        sampling_eps: f64,
        device: Device,
    ) -> Self {
        Self {
            model,
            loss: CrossEntropyLoss::new(),
            optimizer_type,
            lr,
            sampling_eps,
            device,
        }
    }

    pub fn model_kind(&self) -> ModelKind {
        self.model.kind()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn train(&self, feed: &TrainFeed) -> Result<TrainOutputs, TrainingError> {
        let logits = self.model.forward(&feed.inputs, true).map_err(to_runtime_error)?;
        let click_id = label_column(feed)?;
        let loss = self.loss.compute(&logits, &click_id)?;
        let click_prob = ops::softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
        Ok(TrainOutputs {
            loss,
            click_prob,
            click_id,
        })
    }

    pub fn test(&self, feed: &TrainFeed) -> Result<TestOutputs, TrainingError> {
        let click_prob = self.click_prob(&feed.inputs)?;
        Ok(TestOutputs {
            click_prob,
            click_id: label_column(feed)?,
        })
    }

    pub fn inference(&self, inputs: &SlotInputs) -> Result<InferenceOutputs, TrainingError> {
        Ok(InferenceOutputs {
            click_prob: self.click_prob(inputs)?,
        })
    }

    /// Greedy pick of the most likely click per sequence, uniform with
    /// probability `sampling_eps`.
    pub fn eps_greedy_sampling<R: Rng + ?Sized>(
        &self,
        inputs: &SlotInputs,
        rng: &mut R,
    ) -> Result<SamplingOutputs, TrainingError> {
        let probs = self.click_prob(inputs)?;
        let scores = positive_column(&probs)?;
        Ok(SamplingOutputs {
            sampled_id: eps_greedy_sample(&scores, inputs.item_lod(), self.sampling_eps, rng),
        })
    }

    /// Samples one position per sequence in proportion to its click odds.
    pub fn softmax_sampling<R: Rng + ?Sized>(
        &self,
        inputs: &SlotInputs,
        rng: &mut R,
    ) -> Result<SamplingOutputs, TrainingError> {
        let logits = self.model.forward(inputs, false).map_err(to_runtime_error)?;
        let log_odds = logits
            .narrow(1, 1, 1)
            .and_then(|click| click.sub(&logits.narrow(1, 0, 1)?))
            .and_then(|diff| diff.flatten_all())
            .and_then(|diff| diff.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        Ok(SamplingOutputs {
            sampled_id: softmax_sample(&log_odds, inputs.item_lod(), rng),
        })
    }

    pub fn build_optimizer(
        &self,
        params: Vec<(String, Var)>,
    ) -> Result<TrainerOptimizer, TrainingError> {
        TrainerOptimizer::new(params, OptimizerConfig::from_type(self.optimizer_type, self.lr))
    }

    fn click_prob(&self, inputs: &SlotInputs) -> Result<Tensor, TrainingError> {
        let logits = self.model.forward(inputs, false).map_err(to_runtime_error)?;
        ops::softmax(&logits.detach(), D::Minus1).map_err(to_runtime_error)
    }
}

fn label_column(feed: &TrainFeed) -> Result<Tensor, TrainingError> {
    let items = feed.num_items();
    feed.click_id
        .values()
        .reshape((items, 1))
        .map_err(|err| {
            TrainingError::runtime(format!(
                "label must hold one value per item ({items} items): {err}"
            ))
        })
}

/// Click probability column of a `[items, 2]` tensor as a flat vector.
pub fn positive_column(click_prob: &Tensor) -> Result<Vec<f32>, TrainingError> {
    click_prob
        .narrow(1, 1, 1)
        .and_then(|column| column.flatten_all())
        .and_then(|column| column.to_vec1::<f32>())
        .map_err(to_runtime_error)
}
