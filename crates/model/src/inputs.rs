use std::collections::BTreeMap;

use candle_core::{bail, Error, Result, Tensor};

/// Tensor rows grouped into sequences: `lod[i]..lod[i + 1]` belong to sequence `i`.
#[derive(Debug, Clone)]
pub struct LodTensor {
    values: Tensor,
    lod: Vec<usize>,
}

impl LodTensor {
    pub fn new(values: Tensor, lod: Vec<usize>) -> Result<Self> {
        let rows = values.dims().first().copied().unwrap_or(0);
        validate_lod(&lod, rows)?;
        Ok(Self { values, lod })
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn lod(&self) -> &[usize] {
        &self.lod
    }

    pub fn rows(&self) -> usize {
        self.lod.last().copied().unwrap_or(0)
    }

    pub fn num_sequences(&self) -> usize {
        self.lod.len() - 1
    }

    pub fn seq_lens(&self) -> Vec<usize> {
        self.lod.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Rows of sequences `start..end`, with offsets rebased to zero.
    pub fn narrow_sequences(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.num_sequences() {
            bail!(
                "sequence range {start}..{end} out of bounds for {} sequence(s)",
                self.num_sequences()
            );
        }
        let first_row = self.lod[start];
        let last_row = self.lod[end];
        let values = self.values.narrow(0, first_row, last_row - first_row)?;
        let lod = self.lod[start..=end]
            .iter()
            .map(|offset| offset - first_row)
            .collect();
        Ok(Self { values, lod })
    }
}

fn validate_lod(lod: &[usize], rows: usize) -> Result<()> {
    match (lod.first(), lod.last()) {
        (Some(0), Some(&last)) if last == rows => {}
        _ => bail!("lod {lod:?} does not cover {rows} row(s)"),
    }
    if lod.windows(2).any(|w| w[1] < w[0]) {
        bail!("lod {lod:?} is not monotonic");
    }
    Ok(())
}

/// Named slot tensors of one batch.
///
/// Every slot covers the same sequences; item slots additionally share the
/// item offsets that drive padding inside the models.
#[derive(Debug, Clone)]
pub struct SlotInputs {
    slots: BTreeMap<String, LodTensor>,
    item_lod: Vec<usize>,
}

impl SlotInputs {
    pub fn new(item_lod: Vec<usize>) -> Result<Self> {
        if item_lod.first() != Some(&0) || item_lod.windows(2).any(|w| w[1] < w[0]) {
            bail!("invalid item lod {item_lod:?}");
        }
        Ok(Self {
            slots: BTreeMap::new(),
            item_lod,
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: LodTensor) -> Result<()> {
        let name = name.into();
        if tensor.num_sequences() != self.num_sequences() {
            bail!(
                "slot '{name}' covers {} sequence(s), batch has {}",
                tensor.num_sequences(),
                self.num_sequences()
            );
        }
        self.slots.insert(name, tensor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&LodTensor> {
        self.slots
            .get(name)
            .ok_or_else(|| Error::Msg(format!("missing slot '{name}' in model inputs")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Number of slots held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn item_lod(&self) -> &[usize] {
        &self.item_lod
    }

    pub fn seq_lens(&self) -> Vec<usize> {
        self.item_lod.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn num_sequences(&self) -> usize {
        self.item_lod.len() - 1
    }

    pub fn num_items(&self) -> usize {
        self.item_lod.last().copied().unwrap_or(0)
    }

    /// Inputs restricted to sequences `start..end`.
    pub fn narrow_sequences(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.num_sequences() {
            bail!(
                "sequence range {start}..{end} out of bounds for {} sequence(s)",
                self.num_sequences()
            );
        }
        let first_item = self.item_lod[start];
        let mut narrowed = SlotInputs::new(
            self.item_lod[start..=end]
                .iter()
                .map(|offset| offset - first_item)
                .collect(),
        )?;
        for (name, tensor) in &self.slots {
            narrowed
                .slots
                .insert(name.clone(), tensor.narrow_sequences(start, end)?);
        }
        Ok(narrowed)
    }
}

/// Splits `num_sequences` into at most `parts` contiguous, non-empty ranges
/// whose sizes differ by at most one.
pub fn split_sequence_ranges(num_sequences: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.max(1).min(num_sequences);
    if parts == 0 {
        return Vec::new();
    }
    let base = num_sequences / parts;
    let remainder = num_sequences % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0usize;
    for part in 0..parts {
        let len = base + usize::from(part < remainder);
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}
