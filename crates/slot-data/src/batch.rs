use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis};

use crate::error::{DataError, Result};
use crate::schema::{SlotDType, SlotLevel, SlotSchema};

/// Row-major values of one field. The first axis indexes rows.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValues {
    Int64(ArrayD<i64>),
    Float32(ArrayD<f32>),
}

impl FieldValues {
    pub fn dtype(&self) -> SlotDType {
        match self {
            FieldValues::Int64(_) => SlotDType::Int64,
            FieldValues::Float32(_) => SlotDType::Float32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            FieldValues::Int64(values) => values.shape(),
            FieldValues::Float32(values) => values.shape(),
        }
    }

    pub fn rows(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    /// Number of scalars per row.
    pub fn row_width(&self) -> usize {
        self.shape().iter().skip(1).product()
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        match self {
            FieldValues::Int64(values) => FieldValues::Int64(values.select(Axis(0), rows)),
            FieldValues::Float32(values) => FieldValues::Float32(values.select(Axis(0), rows)),
        }
    }

    pub fn as_int64(&self) -> Option<&ArrayD<i64>> {
        match self {
            FieldValues::Int64(values) => Some(values),
            FieldValues::Float32(_) => None,
        }
    }

    pub fn as_float32(&self) -> Option<&ArrayD<f32>> {
        match self {
            FieldValues::Float32(values) => Some(values),
            FieldValues::Int64(_) => None,
        }
    }
}

/// One batch as produced by the dataset reader.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub seq_lens: Vec<usize>,
    pub fields: BTreeMap<String, FieldValues>,
}

impl RawBatch {
    pub fn num_sequences(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn num_items(&self) -> usize {
        self.seq_lens.iter().sum()
    }
}

/// Field values annotated with sequence boundaries.
///
/// `lod[i]..lod[i + 1]` are the rows belonging to sequence `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct LodField {
    pub values: FieldValues,
    pub lod: Vec<usize>,
}

impl LodField {
    pub fn num_sequences(&self) -> usize {
        self.lod.len().saturating_sub(1)
    }

    pub fn seq_lens(&self) -> Vec<usize> {
        self.lod.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// A mini-batch with level-of-detail offsets attached to every field.
#[derive(Debug, Clone)]
pub struct BatchData {
    seq_lens: Vec<usize>,
    fields: BTreeMap<String, LodField>,
}

impl BatchData {
    pub fn new(schema: &SlotSchema, raw: RawBatch) -> Result<Self> {
        let num_sequences = raw.num_sequences();
        let num_items = raw.num_items();
        let item_lod = seq_lens_to_lod(&raw.seq_lens);
        let user_lod: Vec<usize> = (0..=num_sequences).collect();

        let mut fields = BTreeMap::new();
        for (name, values) in raw.fields {
            let spec = schema.slot(&name)?;
            let (expected_rows, lod) = match spec.level {
                SlotLevel::User => (num_sequences, user_lod.clone()),
                SlotLevel::Item => (num_items, item_lod.clone()),
            };
            if values.rows() != expected_rows {
                return Err(DataError::Batch(format!(
                    "field '{name}' has {} row(s), expected {expected_rows}",
                    values.rows()
                )));
            }
            fields.insert(name, LodField { values, lod });
        }

        Ok(Self {
            seq_lens: raw.seq_lens,
            fields,
        })
    }

    pub fn seq_lens(&self) -> &[usize] {
        &self.seq_lens
    }

    pub fn num_sequences(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn num_items(&self) -> usize {
        self.seq_lens.iter().sum()
    }

    pub fn field(&self, name: &str) -> Option<&LodField> {
        self.fields.get(name)
    }

    /// Like [`BatchData::field`] but a missing field is an error naming it.
    pub fn require(&self, name: &str) -> Result<&LodField> {
        self.fields
            .get(name)
            .ok_or_else(|| DataError::Batch(format!("batch is missing field '{name}'")))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Converts per-sequence lengths into offsets `[0, l0, l0 + l1, ...]`.
pub fn seq_lens_to_lod(seq_lens: &[usize]) -> Vec<usize> {
    let mut lod = Vec::with_capacity(seq_lens.len() + 1);
    let mut offset = 0usize;
    lod.push(offset);
    for &len in seq_lens {
        offset += len;
        lod.push(offset);
    }
    lod
}

/// Splits a flat per-item vector back into one vector per sequence.
pub fn sequence_unconcat<T: Clone>(values: &[T], seq_lens: &[usize]) -> Result<Vec<Vec<T>>> {
    let total: usize = seq_lens.iter().sum();
    if total != values.len() {
        return Err(DataError::InvalidArgument(format!(
            "sequence lengths sum to {total} but {} value(s) were given",
            values.len()
        )));
    }

    let mut offset = 0usize;
    let mut sequences = Vec::with_capacity(seq_lens.len());
    for &len in seq_lens {
        sequences.push(values[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};

    fn schema() -> SlotSchema {
        SlotSchema::from_json_str(
            r#"{
                "slots": {
                    "user_id": { "level": "user", "dtype": "int64", "vocab_size": 4 },
                    "item_id": { "level": "item", "dtype": "int64", "vocab_size": 8 },
                    "click_id": { "level": "item", "dtype": "int64" }
                }
            }"#,
        )
        .unwrap()
    }

    fn raw_batch() -> RawBatch {
        let mut fields = BTreeMap::new();
        fields.insert(
            "user_id".to_string(),
            FieldValues::Int64(array![1i64, 2].into_dyn()),
        );
        fields.insert(
            "item_id".to_string(),
            FieldValues::Int64(array![1i64, 2, 3, 4, 5].into_dyn()),
        );
        RawBatch {
            seq_lens: vec![3, 2],
            fields,
        }
    }

    #[test]
    fn lod_offsets_follow_levels() {
        let batch = BatchData::new(&schema(), raw_batch()).unwrap();
        assert_eq!(batch.num_sequences(), 2);
        assert_eq!(batch.num_items(), 5);
        assert_eq!(batch.field("item_id").unwrap().lod, vec![0, 3, 5]);
        assert_eq!(batch.field("user_id").unwrap().lod, vec![0, 1, 2]);
        assert_eq!(batch.field("item_id").unwrap().seq_lens(), vec![3, 2]);
        assert!(batch.field("click_id").is_none());
        assert!(batch.require("click_id").is_err());
    }

    #[test]
    fn rejects_row_count_mismatch() {
        let mut raw = raw_batch();
        raw.fields.insert(
            "click_id".to_string(),
            FieldValues::Int64(ArrayD::zeros(IxDyn(&[4]))),
        );
        let err = BatchData::new(&schema(), raw).unwrap_err();
        assert!(err.to_string().contains("click_id"));
    }

    #[test]
    fn unconcat_splits_by_lengths() {
        let parts = sequence_unconcat(&[1, 2, 3, 4, 5, 6], &[2, 0, 4]).unwrap();
        assert_eq!(parts, vec![vec![1, 2], vec![], vec![3, 4, 5, 6]]);
        assert!(sequence_unconcat(&[1, 2], &[3]).is_err());
    }

    #[test]
    fn select_rows_keeps_row_shape() {
        let values = FieldValues::Float32(
            array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn(),
        );
        let picked = values.select_rows(&[2, 0]);
        assert_eq!(picked.shape(), &[2, 2]);
        assert_eq!(picked.row_width(), 2);
        assert_eq!(
            picked.as_float32().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![5.0, 6.0, 1.0, 2.0]
        );
    }
}
