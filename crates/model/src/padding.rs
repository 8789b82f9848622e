use candle_core::{bail, DType, Device, Result, Tensor};

/// Moves between flat item rows `[num_items, dim]` and a padded
/// `[batch, max_len, dim]` layout where every sequence is left-aligned.
///
/// Padding rows read from an appended zero row, so padded positions are
/// exactly zero on the way in and ignored on the way out.
#[derive(Debug, Clone)]
pub struct PaddedLayout {
    batch: usize,
    max_len: usize,
    num_items: usize,
    gather: Tensor,
    gather_reversed: Tensor,
    scatter: Tensor,
    scatter_reversed: Tensor,
    mask: Tensor,
}

impl PaddedLayout {
    pub fn new(lod: &[usize], device: &Device) -> Result<Self> {
        if lod.is_empty() {
            bail!("lod must contain at least one offset");
        }
        let batch = lod.len() - 1;
        let num_items = lod[batch];
        let lens: Vec<usize> = lod.windows(2).map(|w| w[1] - w[0]).collect();
        let max_len = lens.iter().copied().max().unwrap_or(0);
        let pad_row = num_items as u32;

        let mut gather = Vec::with_capacity(batch * max_len);
        let mut gather_reversed = Vec::with_capacity(batch * max_len);
        let mut mask = Vec::with_capacity(batch * max_len);
        for (seq, &len) in lens.iter().enumerate() {
            let start = lod[seq];
            for pos in 0..max_len {
                if pos < len {
                    gather.push((start + pos) as u32);
                    gather_reversed.push((start + len - 1 - pos) as u32);
                    mask.push(1f32);
                } else {
                    gather.push(pad_row);
                    gather_reversed.push(pad_row);
                    mask.push(0f32);
                }
            }
        }

        let mut scatter = Vec::with_capacity(num_items);
        let mut scatter_reversed = Vec::with_capacity(num_items);
        for (seq, &len) in lens.iter().enumerate() {
            for pos in 0..len {
                scatter.push((seq * max_len + pos) as u32);
                scatter_reversed.push((seq * max_len + len - 1 - pos) as u32);
            }
        }

        Ok(Self {
            batch,
            max_len,
            num_items,
            gather: Tensor::from_vec(gather, batch * max_len, device)?,
            gather_reversed: Tensor::from_vec(gather_reversed, batch * max_len, device)?,
            scatter: Tensor::from_vec(scatter, num_items, device)?,
            scatter_reversed: Tensor::from_vec(scatter_reversed, num_items, device)?,
            mask: Tensor::from_vec(mask, (batch, max_len), device)?,
        })
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// `[batch, max_len]` with 1.0 at valid positions and 0.0 at padding.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn pad(&self, items: &Tensor) -> Result<Tensor> {
        self.gather_rows(items, &self.gather)
    }

    /// Like [`PaddedLayout::pad`] with every sequence in reverse order.
    pub fn pad_reversed(&self, items: &Tensor) -> Result<Tensor> {
        self.gather_rows(items, &self.gather_reversed)
    }

    pub fn unpad(&self, padded: &Tensor) -> Result<Tensor> {
        self.scatter_rows(padded, &self.scatter)
    }

    /// Inverse of [`PaddedLayout::pad_reversed`].
    pub fn unpad_reversed(&self, padded: &Tensor) -> Result<Tensor> {
        self.scatter_rows(padded, &self.scatter_reversed)
    }

    fn gather_rows(&self, items: &Tensor, index: &Tensor) -> Result<Tensor> {
        let (rows, dim) = items.dims2()?;
        if rows != self.num_items {
            bail!("expected {} item row(s), got {rows}", self.num_items);
        }
        let zero = Tensor::zeros((1, dim), items.dtype(), items.device())?;
        let with_pad = Tensor::cat(&[items, &zero], 0)?;
        with_pad
            .index_select(index, 0)?
            .reshape((self.batch, self.max_len, dim))
    }

    fn scatter_rows(&self, padded: &Tensor, index: &Tensor) -> Result<Tensor> {
        let (batch, max_len, dim) = padded.dims3()?;
        if batch != self.batch || max_len != self.max_len {
            bail!(
                "expected padded [{}, {}, _], got [{batch}, {max_len}, _]",
                self.batch,
                self.max_len
            );
        }
        padded
            .reshape((batch * max_len, dim))?
            .index_select(index, 0)
    }
}

/// Additive attention bias `[batch, 1, 1, max_len]`: 0 for valid keys, a
/// large negative value for padding.
pub fn attention_bias(mask: &Tensor) -> Result<Tensor> {
    let (batch, max_len) = mask.dims2()?;
    mask.to_dtype(DType::F32)?
        .affine(1e9, -1e9)?
        .reshape((batch, 1, 1, max_len))
}
