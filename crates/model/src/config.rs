use candle_core::{DType, Device, Error, Result};

/// How a slot's raw values become features.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotFeatureKind {
    /// Integer ids looked up in an embedding table. Rows with several ids are
    /// sum-pooled.
    Categorical { vocab_size: usize },
    /// Float values used as-is, `width` values per row.
    Dense { width: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotFeatureSpec {
    pub name: String,
    pub kind: SlotFeatureKind,
}

impl SlotFeatureSpec {
    pub fn categorical(name: impl Into<String>, vocab_size: usize) -> Self {
        Self {
            name: name.into(),
            kind: SlotFeatureKind::Categorical { vocab_size },
        }
    }

    pub fn dense(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            kind: SlotFeatureKind::Dense { width },
        }
    }
}

/// Configuration shared by both click model variants.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub user_slots: Vec<SlotFeatureSpec>,
    pub item_slots: Vec<SlotFeatureSpec>,
    pub embed_size: usize,
    pub hidden_size: usize,
    /// Encoder blocks of the transformer variant.
    pub num_blocks: usize,
    pub num_heads: usize,
    /// Longest sequence the positional table of the transformer can address.
    pub max_seq_len: usize,
    pub dropout_p: Option<f32>,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.item_slots.is_empty() {
            return Err(Error::Msg("at least one item slot is required".into()));
        }
        if self.embed_size == 0 {
            return Err(Error::Msg("embed_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_blocks == 0 {
            return Err(Error::Msg("num_blocks must be greater than zero".into()));
        }
        if self.num_heads == 0 {
            return Err(Error::Msg("num_heads must be greater than zero".into()));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if self.max_seq_len == 0 {
            return Err(Error::Msg("max_seq_len must be greater than zero".into()));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        for slot in self.user_slots.iter().chain(&self.item_slots) {
            match slot.kind {
                SlotFeatureKind::Categorical { vocab_size: 0 } => {
                    return Err(Error::Msg(format!(
                        "slot '{}' needs a positive vocab_size",
                        slot.name
                    )));
                }
                SlotFeatureKind::Dense { width: 0 } => {
                    return Err(Error::Msg(format!(
                        "slot '{}' needs a positive width",
                        slot.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads.max(1)
    }
}
