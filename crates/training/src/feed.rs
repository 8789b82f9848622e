use candle_core::{Device, Tensor};
use model::{split_sequence_ranges, LodTensor, SlotInputs};
use slot_data::{BatchData, FieldValues, LodField};

use crate::config::to_runtime_error;
use crate::TrainingError;

/// Inputs and label of one train/test batch.
#[derive(Debug, Clone)]
pub struct TrainFeed {
    pub inputs: SlotInputs,
    pub click_id: LodTensor,
}

impl TrainFeed {
    /// Number of feed entries: every slot plus the label.
    pub fn len(&self) -> usize {
        self.inputs.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn num_sequences(&self) -> usize {
        self.inputs.num_sequences()
    }

    pub fn num_items(&self) -> usize {
        self.inputs.num_items()
    }

    /// Splits the batch into at most `parts` shards of whole sequences.
    /// Shards without items are dropped.
    pub fn split(&self, parts: usize) -> Result<Vec<TrainFeed>, TrainingError> {
        let mut shards = Vec::new();
        for (start, end) in split_sequence_ranges(self.num_sequences(), parts) {
            let shard = TrainFeed {
                inputs: self
                    .inputs
                    .narrow_sequences(start, end)
                    .map_err(to_runtime_error)?,
                click_id: self
                    .click_id
                    .narrow_sequences(start, end)
                    .map_err(to_runtime_error)?,
            };
            if shard.num_items() > 0 {
                shards.push(shard);
            }
        }
        Ok(shards)
    }
}

/// Converts assembled batches into model feeds on one device.
#[derive(Debug, Clone)]
pub struct FeedConvertor {
    user_slot_names: Vec<String>,
    item_slot_names: Vec<String>,
    label_name: String,
    device: Device,
}

impl FeedConvertor {
    pub fn new(
        user_slot_names: Vec<String>,
        item_slot_names: Vec<String>,
        label_name: impl Into<String>,
        device: Device,
    ) -> Self {
        Self {
            user_slot_names,
            item_slot_names,
            label_name: label_name.into(),
            device,
        }
    }

    pub fn train_test(&self, batch: &BatchData) -> Result<TrainFeed, TrainingError> {
        let inputs = self.inference(batch)?;
        let label = batch.require(&self.label_name)?;
        let click_id = create_tensor(label, &self.device)?;
        Ok(TrainFeed { inputs, click_id })
    }

    pub fn inference(&self, batch: &BatchData) -> Result<SlotInputs, TrainingError> {
        let item_lod = slot_data::seq_lens_to_lod(batch.seq_lens());
        let mut inputs = SlotInputs::new(item_lod).map_err(to_runtime_error)?;
        for name in self.user_slot_names.iter().chain(&self.item_slot_names) {
            let field = batch.require(name)?;
            let tensor = create_tensor(field, &self.device)?;
            inputs.insert(name.as_str(), tensor).map_err(to_runtime_error)?;
        }
        Ok(inputs)
    }
}

/// Copies a batch field into a device tensor with the same shape and offsets.
pub fn create_tensor(field: &LodField, device: &Device) -> Result<LodTensor, TrainingError> {
    let values = match &field.values {
        FieldValues::Int64(values) => {
            let data: Vec<i64> = values.iter().copied().collect();
            Tensor::from_vec(data, values.shape(), device)
        }
        FieldValues::Float32(values) => {
            let data: Vec<f32> = values.iter().copied().collect();
            Tensor::from_vec(data, values.shape(), device)
        }
    }
    .map_err(to_runtime_error)?;
    LodTensor::new(values, field.lod.clone()).map_err(to_runtime_error)
}
