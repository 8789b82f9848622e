use candle_core::{bail, DType, Device, Result, Tensor, D};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

use crate::config::{ModelConfig, SlotFeatureKind, SlotFeatureSpec};
use crate::inputs::{LodTensor, SlotInputs};

enum SlotEncoder {
    Embedding(Embedding),
    Dense { width: usize },
}

struct SlotFeature {
    name: String,
    encoder: SlotEncoder,
}

impl SlotFeature {
    fn new(spec: &SlotFeatureSpec, embed_size: usize, vb: VarBuilder) -> Result<Self> {
        let encoder = match spec.kind {
            SlotFeatureKind::Categorical { vocab_size } => {
                SlotEncoder::Embedding(embedding(vocab_size, embed_size, vb.pp(&spec.name))?)
            }
            SlotFeatureKind::Dense { width } => SlotEncoder::Dense { width },
        };
        Ok(Self {
            name: spec.name.clone(),
            encoder,
        })
    }

    fn width(&self, embed_size: usize) -> usize {
        match self.encoder {
            SlotEncoder::Embedding(_) => embed_size,
            SlotEncoder::Dense { width } => width,
        }
    }

    /// `[rows, width]` features for one slot.
    fn encode(&self, tensor: &LodTensor) -> Result<Tensor> {
        let values = tensor.values();
        let rows = tensor.rows();
        let per_row = if rows == 0 {
            0
        } else {
            values.elem_count() / rows
        };
        let values = values.reshape((rows, per_row))?;

        match &self.encoder {
            SlotEncoder::Embedding(table) => {
                // [rows, ids] -> [rows, ids, embed] -> sum-pooled [rows, embed]
                let ids = values.to_dtype(DType::U32)?;
                table.forward(&ids)?.sum(1)
            }
            SlotEncoder::Dense { width } => {
                if per_row != *width && rows > 0 {
                    bail!(
                        "slot '{}' rows hold {per_row} value(s), expected {width}",
                        self.name
                    );
                }
                values.to_dtype(DType::F32)
            }
        }
    }
}

/// Turns slot tensors into one feature row per item.
///
/// User-level features are repeated for every item of their sequence and
/// concatenated with the item-level features.
pub struct SlotEmbedder {
    user: Vec<SlotFeature>,
    item: Vec<SlotFeature>,
    output_dim: usize,
    device: Device,
}

impl SlotEmbedder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let user = build_features(&config.user_slots, config.embed_size, vb.pp("user"))?;
        let item = build_features(&config.item_slots, config.embed_size, vb.pp("item"))?;
        let output_dim = user
            .iter()
            .chain(&item)
            .map(|feature| feature.width(config.embed_size))
            .sum();

        Ok(Self {
            user,
            item,
            output_dim,
            device: config.device.clone(),
        })
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// `[num_items, output_dim]` features for `inputs`.
    pub fn forward(&self, inputs: &SlotInputs) -> Result<Tensor> {
        let num_items = inputs.num_items();
        let mut columns = Vec::with_capacity(self.user.len() + self.item.len());

        if !self.user.is_empty() {
            let owner = item_owner_index(inputs, &self.device)?;
            for feature in &self.user {
                let tensor = inputs.get(&feature.name)?;
                if tensor.seq_lens().iter().any(|&len| len != 1) {
                    bail!("user slot '{}' must hold one row per sequence", feature.name);
                }
                let per_sequence = feature.encode(tensor)?;
                columns.push(per_sequence.index_select(&owner, 0)?);
            }
        }

        for feature in &self.item {
            let tensor = inputs.get(&feature.name)?;
            if tensor.lod() != inputs.item_lod() {
                bail!(
                    "item slot '{}' does not share the batch item offsets",
                    feature.name
                );
            }
            columns.push(feature.encode(tensor)?);
        }

        let features = Tensor::cat(&columns, D::Minus1)?;
        let (rows, _) = features.dims2()?;
        if rows != num_items {
            bail!("expected {num_items} feature row(s), got {rows}");
        }
        Ok(features)
    }
}

fn build_features(
    specs: &[SlotFeatureSpec],
    embed_size: usize,
    vb: VarBuilder,
) -> Result<Vec<SlotFeature>> {
    specs
        .iter()
        .map(|spec| SlotFeature::new(spec, embed_size, vb.clone()))
        .collect()
}

/// For every item, the index of the sequence that owns it.
fn item_owner_index(inputs: &SlotInputs, device: &Device) -> Result<Tensor> {
    let owners: Vec<u32> = inputs
        .seq_lens()
        .iter()
        .enumerate()
        .flat_map(|(seq, &len)| std::iter::repeat(seq as u32).take(len))
        .collect();
    Tensor::from_vec(owners, inputs.num_items(), device)
}
