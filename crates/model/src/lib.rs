//! List-wise click prediction models.
//!
//! Both variants read slot features for a batch of item sequences and emit
//! two click logits (no click, click) per item.

pub mod birnn;
pub mod config;
pub mod features;
pub mod inputs;
pub mod padding;
pub mod sampling;
pub mod transformer;

use std::fmt;
use std::str::FromStr;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

pub use birnn::BiRnnModel;
pub use config::{ModelConfig, SlotFeatureKind, SlotFeatureSpec};
pub use features::SlotEmbedder;
pub use inputs::{split_sequence_ranges, LodTensor, SlotInputs};
pub use sampling::{eps_greedy_sample, softmax_sample};
pub use transformer::TransformerModel;

/// A model scoring every item of every sequence in a batch.
pub trait ClickModel: Send + Sync {
    fn kind(&self) -> ModelKind;

    /// Click logits `[num_items, 2]`. Dropout is active only when `train` is set.
    fn forward(&self, inputs: &SlotInputs, train: bool) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    BiRnn,
    Transformer,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::BiRnn => f.write_str("BiRNN"),
            ModelKind::Transformer => f.write_str("Trans"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "BiRNN" | "birnn" => Ok(ModelKind::BiRnn),
            "Trans" | "trans" | "transformer" => Ok(ModelKind::Transformer),
            other => Err(format!("unknown model '{other}', expected BiRNN or Trans")),
        }
    }
}

/// Builds the requested model with its parameters registered in `vb`.
pub fn build_model(
    kind: ModelKind,
    config: &ModelConfig,
    vb: VarBuilder,
) -> Result<Box<dyn ClickModel>> {
    log::info!(
        "building {kind} model (embed={}, hidden={}, user_slots={}, item_slots={})",
        config.embed_size,
        config.hidden_size,
        config.user_slots.len(),
        config.item_slots.len()
    );
    match kind {
        ModelKind::BiRnn => Ok(Box::new(BiRnnModel::new(config, vb)?)),
        ModelKind::Transformer => Ok(Box::new(TransformerModel::new(config, vb)?)),
    }
}
