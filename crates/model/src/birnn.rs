use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{gru, linear, Dropout, GRUConfig, Linear, Module, VarBuilder, GRU, RNN};

use crate::config::ModelConfig;
use crate::features::SlotEmbedder;
use crate::inputs::SlotInputs;
use crate::padding::PaddedLayout;
use crate::{ClickModel, ModelKind};

/// Bidirectional GRU over each item sequence.
///
/// The forward GRU reads a sequence left to right, the backward GRU reads it
/// right to left. Both read left-aligned padded batches, so padding always
/// trails the real steps and never leaks into their states.
pub struct BiRnnModel {
    embedder: SlotEmbedder,
    input_proj: Linear,
    forward_gru: GRU,
    backward_gru: GRU,
    head: Linear,
    output: Linear,
    dropout: Option<Dropout>,
    device: Device,
}

impl BiRnnModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;

        let embedder = SlotEmbedder::new(config, vb.pp("slots"))?;
        let input_proj = linear(embedder.output_dim(), hidden, vb.pp("input_proj"))?;
        let forward_gru = gru(hidden, hidden, GRUConfig::default(), vb.pp("gru_forward"))?;
        let backward_gru = gru(hidden, hidden, GRUConfig::default(), vb.pp("gru_backward"))?;
        let head = linear(2 * hidden, hidden, vb.pp("head"))?;
        let output = linear(hidden, 2, vb.pp("output"))?;

        Ok(Self {
            embedder,
            input_proj,
            forward_gru,
            backward_gru,
            head,
            output,
            dropout: config.dropout_p.map(Dropout::new),
            device: config.device.clone(),
        })
    }

    fn apply_dropout(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match &self.dropout {
            Some(dropout) => dropout.forward(xs, train),
            None => Ok(xs.clone()),
        }
    }
}

impl ClickModel for BiRnnModel {
    fn kind(&self) -> ModelKind {
        ModelKind::BiRnn
    }

    fn forward(&self, inputs: &SlotInputs, train: bool) -> Result<Tensor> {
        if inputs.num_items() == 0 {
            return Tensor::zeros((0, 2), DType::F32, &self.device);
        }

        let features = self.embedder.forward(inputs)?;
        let hidden = self.input_proj.forward(&features)?.relu()?;
        let hidden = self.apply_dropout(&hidden, train)?;

        let layout = PaddedLayout::new(inputs.item_lod(), &self.device)?;

        let forward_states = self.forward_gru.seq(&layout.pad(&hidden)?)?;
        let forward_states = self.forward_gru.states_to_tensor(&forward_states)?;
        let forward_items = layout.unpad(&forward_states)?;

        let backward_states = self.backward_gru.seq(&layout.pad_reversed(&hidden)?)?;
        let backward_states = self.backward_gru.states_to_tensor(&backward_states)?;
        let backward_items = layout.unpad_reversed(&backward_states)?;

        let context = Tensor::cat(&[&forward_items, &backward_items], D::Minus1)?;
        let context = self.apply_dropout(&context, train)?;
        let head = self.head.forward(&context)?.relu()?;
        self.output.forward(&head)
    }
}
