use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::config::{to_runtime_error, OptimizerType};
use crate::TrainingError;

const EPS: f64 = 1e-12;
/// Adam epsilon used for click model training.
pub const ADAM_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    Adam(AdamConfig),
    Sgd(SgdConfig),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamConfig {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: ADAM_EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f64,
}

impl OptimizerConfig {
    pub fn from_type(kind: OptimizerType, learning_rate: f64) -> Self {
        match kind {
            OptimizerType::Adam => OptimizerConfig::Adam(AdamConfig::new(learning_rate)),
            OptimizerType::Sgd => OptimizerConfig::Sgd(SgdConfig { learning_rate }),
        }
    }
}

/// First-order optimizer over a fixed set of named parameters.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Option<Tensor>,
    second_moment: Option<Tensor>,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }

            let (first_moment, second_moment) = match config {
                OptimizerConfig::Adam(_) => (
                    Some(tensor.zeros_like().map_err(to_runtime_error)?),
                    Some(tensor.zeros_like().map_err(to_runtime_error)?),
                ),
                OptimizerConfig::Sgd(_) => (None, None),
            };

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Adam(cfg) => cfg.learning_rate,
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
        }
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Consumes the gradients of every tracked parameter and applies one update.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                processed.push((index, grad));
            }
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Adam(cfg) => self.step_adam(cfg, processed),
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed),
        }
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        for (index, grad) in processed {
            let slot = &self.params[index];
            let update = grad
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    fn step_adam(
        &mut self,
        cfg: AdamConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let (Some(prev_m), Some(prev_v)) = (&slot.first_moment, &slot.second_moment) else {
                return Err(TrainingError::runtime(format!(
                    "missing Adam moments for '{}'",
                    slot.name
                )));
            };

            let new_m = prev_m
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = prev_v
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v_hat| v_hat.sqrt())
                .and_then(|root| root.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .and_then(|ratio| ratio.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = Some(new_m);
            slot.second_moment = Some(new_v);
        }

        Ok(())
    }

    /// Adds `new_grads` into `accum` for every tracked parameter.
    pub fn merge_gradients(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), TrainingError> {
        for slot in &self.params {
            let tensor = slot.param.as_tensor();
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = if let Some(existing) = accum.remove(tensor) {
                    existing.add(&grad).map_err(to_runtime_error)?
                } else {
                    grad
                };
                accum.insert(tensor, combined);
            }
        }

        // gradients of non-parameter tensors (inputs, padding indices) are dropped
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_grads(var: &Var) -> GradStore {
        // d/dx (x^2) = 2x
        var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn sgd_moves_against_gradient() {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("x".to_string(), var.clone())],
            OptimizerConfig::from_type(OptimizerType::Sgd, 0.25),
        )
        .unwrap();

        let mut grads = quadratic_grads(&var);
        optimizer.step(&mut grads).unwrap();

        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![0.5, -1.0]);
        assert_eq!(optimizer.steps_taken(), 1);
        assert!(grads.get(var.as_tensor()).is_none());
    }

    #[test]
    fn adam_first_step_has_learning_rate_magnitude() {
        let var = Var::new(&[3.0f32, -3.0], &Device::Cpu).unwrap();
        let config = OptimizerConfig::from_type(OptimizerType::Adam, 0.1);
        assert!(matches!(config, OptimizerConfig::Adam(cfg) if cfg.epsilon == ADAM_EPSILON));
        let mut optimizer =
            TrainerOptimizer::new(vec![("x".to_string(), var.clone())], config).unwrap();

        let mut grads = quadratic_grads(&var);
        optimizer.step(&mut grads).unwrap();

        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 2.9).abs() < 1e-4);
        assert!((values[1] + 2.9).abs() < 1e-4);
    }

    #[test]
    fn merged_gradients_add_up() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let optimizer = TrainerOptimizer::new(
            vec![("x".to_string(), var.clone())],
            OptimizerConfig::from_type(OptimizerType::Sgd, 1.0),
        )
        .unwrap();

        let mut accum = quadratic_grads(&var);
        optimizer
            .merge_gradients(&mut accum, quadratic_grads(&var))
            .unwrap();
        let merged = accum.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(merged, vec![4.0]);
    }

    #[test]
    fn rejects_empty_parameter_list() {
        let config = OptimizerConfig::from_type(OptimizerType::Adam, 0.1);
        assert!(TrainerOptimizer::new(vec![], config).is_err());
    }
}
