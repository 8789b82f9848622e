use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::config::to_runtime_error;
use crate::TrainingError;

/// Mean cross entropy between per-item click distributions and integer labels.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// `logits` is `[items, classes]`; `targets` holds one class id per item
    /// (`[items]` or `[items, 1]`).
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (items, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects [items, classes] logits, got {:?}",
                logits.dims()
            ))
        })?;
        if classes == 0 {
            return Err(TrainingError::runtime(
                "logits class dimension must be greater than zero",
            ));
        }
        if targets.elem_count() != items {
            return Err(TrainingError::runtime(format!(
                "{} target(s) for {} logit row(s)",
                targets.elem_count(),
                items
            )));
        }
        if items == 0 {
            return Err(TrainingError::runtime("no items available for loss computation"));
        }

        let targets_flat = targets
            .to_device(logits.device())
            .and_then(|t| t.reshape((items,)))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;
        nll.mean_all().map_err(to_runtime_error)
    }
}
