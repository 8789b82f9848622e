use std::fmt;

use candle_core::{bail, DType, Device, Result, Tensor, D};
use candle_nn::{embedding, linear, ops, Dropout, Embedding, Init, Linear, Module, VarBuilder};

use crate::config::ModelConfig;
use crate::features::SlotEmbedder;
use crate::inputs::SlotInputs;
use crate::padding::{attention_bias, PaddedLayout};
use crate::{ClickModel, ModelKind};

const LAYER_NORM_EPS: f64 = 1e-5;
const FF_RATIO: usize = 4;

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    hidden_size: usize,
}

impl LayerNorm {
    fn new(hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            hidden_size,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let hidden_size = self.hidden_size as f64;
        let mean = (hidden.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = hidden.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + LAYER_NORM_EPS)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Encoder block with the pre-norm residual layout.
pub struct EncoderBlock {
    hidden_dim: usize,
    heads: usize,
    head_dim: usize,
    norm_attn: LayerNorm,
    norm_mlp: LayerNorm,
    qkv_proj: Linear,
    out_proj: Linear,
    ff_in: Linear,
    ff_out: Linear,
    dropout: Option<Dropout>,
}

impl fmt::Debug for EncoderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderBlock")
            .field("hidden_dim", &self.hidden_dim)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}

impl EncoderBlock {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            hidden_dim: hidden,
            heads: config.num_heads,
            head_dim: config.head_dim(),
            norm_attn: LayerNorm::new(hidden, vb.pp("norm_attn"))?,
            norm_mlp: LayerNorm::new(hidden, vb.pp("norm_mlp"))?,
            qkv_proj: linear(hidden, 3 * hidden, vb.pp("qkv_proj"))?,
            out_proj: linear(hidden, hidden, vb.pp("out_proj"))?,
            ff_in: linear(hidden, FF_RATIO * hidden, vb.pp("ff_in"))?,
            ff_out: linear(FF_RATIO * hidden, hidden, vb.pp("ff_out"))?,
            dropout: config.dropout_p.map(Dropout::new),
        })
    }

    fn expand_to_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_from_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let dims = tensor.dims();
        if dims.len() != 4 {
            bail!(
                "attention output expected [batch, heads, seq, head_dim] got {:?}",
                dims
            );
        }
        let batch = dims[0];
        let seq = dims[2];
        tensor
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.hidden_dim))
    }

    fn apply_dropout(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match &self.dropout {
            Some(dropout) => dropout.forward(xs, train),
            None => Ok(xs.clone()),
        }
    }

    /// `hidden` is `[batch, seq, hidden]`, `bias` is the additive key mask
    /// `[batch, 1, 1, seq]`.
    pub fn forward(&self, hidden: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.norm_attn.forward(hidden)?;
        let qkv = self.qkv_proj.forward(&normed)?;

        let q = self.expand_to_heads(&qkv.narrow(2, 0, self.hidden_dim)?)?;
        let k = self.expand_to_heads(&qkv.narrow(2, self.hidden_dim, self.hidden_dim)?)?;
        let v = self.expand_to_heads(&qkv.narrow(2, 2 * self.hidden_dim, self.hidden_dim)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(bias)?;
        let probs = ops::softmax(&scores, D::Minus1)?;
        let probs = self.apply_dropout(&probs, train)?;

        let attended = self.merge_from_heads(&probs.matmul(&v)?)?;
        let projected = self.out_proj.forward(&attended)?;
        let after_attn = (hidden + self.apply_dropout(&projected, train)?)?;

        let normed_mlp = self.norm_mlp.forward(&after_attn)?;
        let mlp_out = self.ff_out.forward(&self.ff_in.forward(&normed_mlp)?.gelu()?)?;
        after_attn + self.apply_dropout(&mlp_out, train)?
    }
}

/// Transformer encoder over each item sequence.
///
/// Attention is masked to the valid positions of each sequence, so a
/// sequence's outputs do not depend on how much padding the batch needs.
pub struct TransformerModel {
    embedder: SlotEmbedder,
    input_proj: Linear,
    position: Embedding,
    blocks: Vec<EncoderBlock>,
    final_norm: LayerNorm,
    head: Linear,
    output: Linear,
    dropout: Option<Dropout>,
    max_seq_len: usize,
    device: Device,
}

impl TransformerModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;

        let embedder = SlotEmbedder::new(config, vb.pp("slots"))?;
        let input_proj = linear(embedder.output_dim(), hidden, vb.pp("input_proj"))?;
        let position = embedding(config.max_seq_len, hidden, vb.pp("position"))?;

        let mut blocks = Vec::with_capacity(config.num_blocks);
        for index in 0..config.num_blocks {
            blocks.push(EncoderBlock::new(config, vb.pp(format!("blocks.{index}")))?);
        }

        Ok(Self {
            embedder,
            input_proj,
            position,
            blocks,
            final_norm: LayerNorm::new(hidden, vb.pp("final_norm"))?,
            head: linear(hidden, hidden, vb.pp("head"))?,
            output: linear(hidden, 2, vb.pp("output"))?,
            dropout: config.dropout_p.map(Dropout::new),
            max_seq_len: config.max_seq_len,
            device: config.device.clone(),
        })
    }
}

impl ClickModel for TransformerModel {
    fn kind(&self) -> ModelKind {
        ModelKind::Transformer
    }

    fn forward(&self, inputs: &SlotInputs, train: bool) -> Result<Tensor> {
        if inputs.num_items() == 0 {
            return Tensor::zeros((0, 2), DType::F32, &self.device);
        }

        let layout = PaddedLayout::new(inputs.item_lod(), &self.device)?;
        if layout.max_len() > self.max_seq_len {
            bail!(
                "sequence of length {} exceeds max_seq_len {}",
                layout.max_len(),
                self.max_seq_len
            );
        }

        let features = self.embedder.forward(inputs)?;
        let items = self.input_proj.forward(&features)?;
        let positions = Tensor::arange(0u32, layout.max_len() as u32, &self.device)?;
        let mut hidden = layout
            .pad(&items)?
            .broadcast_add(&self.position.forward(&positions)?)?;
        if let Some(dropout) = &self.dropout {
            hidden = dropout.forward(&hidden, train)?;
        }

        let bias = attention_bias(layout.mask())?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &bias, train)?;
        }
        let hidden = self.final_norm.forward(&hidden)?;

        let items = layout.unpad(&hidden)?;
        let head = self.head.forward(&items)?.relu()?;
        self.output.forward(&head)
    }
}
