use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::VarMap;

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

/// Parameter-update capability driven by the epoch runner.
///
/// Gradients from successive backward passes are handed to
/// [`accumulate`](Optimizer::accumulate) and summed until
/// [`zero_grad`](Optimizer::zero_grad) drops them.
pub trait Optimizer {
    fn accumulate(&mut self, grads: GradStore) -> Result<(), TrainingError>;
    fn step(&mut self) -> Result<(), TrainingError>;
    fn zero_grad(&mut self);
    /// Learning rate of the first parameter group.
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Decoupled (AdamW-style) decay; `0.0` gives plain Adam.
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1.0,
            beta1: 0.9,
            beta2: 0.98,
            epsilon: 1e-9,
            weight_decay: 0.0,
        }
    }
}

impl From<&config::OptimizerConfig> for AdamConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    grad: Option<Tensor>,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl Adam {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let shape = tensor.dims().to_vec();
            let first_moment = Tensor::zeros(shape.as_slice(), DType::F32, tensor.device())?;
            let second_moment = Tensor::zeros(shape.as_slice(), DType::F32, tensor.device())?;

            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                grad: None,
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

    /// Every variable in `var_map`, ordered by name.
    pub fn from_var_map(var_map: &VarMap, config: AdamConfig) -> Result<Self, TrainingError> {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| TrainingError::initialization("variable map lock poisoned"))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Self::new(named, config)
    }

    /// Updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Parameters currently holding a buffered gradient.
    pub fn pending_gradients(&self) -> usize {
        self.params.iter().filter(|slot| slot.grad.is_some()).count()
    }

    pub fn gradient(&self, name: &str) -> Option<&Tensor> {
        self.params
            .iter()
            .find(|slot| slot.name == name)
            .and_then(|slot| slot.grad.as_ref())
    }
}

impl Optimizer for Adam {
    fn accumulate(&mut self, mut grads: GradStore) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            slot.grad = Some(match slot.grad.take() {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            });
        }
        // Anything left belongs to tensors the optimizer does not own.
        Ok(())
    }

    fn step(&mut self) -> Result<(), TrainingError> {
        if self.params.iter().all(|slot| slot.grad.is_none()) {
            log::debug!("optimizer step skipped: no buffered gradients");
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
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

        for slot in &mut self.params {
            let Some(grad) = slot.grad.as_ref() else {
                continue;
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = slot.param.as_tensor().to_dtype(DType::F32)?;
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };

            let next = decayed.sub(&update)?;
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype)?
            };
            slot.param.set(&cast)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    fn zero_grad(&mut self) {
        for slot in &mut self.params {
            slot.grad = None;
        }
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }
}

/// Stand-in for evaluation runs, where no parameters are updated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOptimizer;

impl Optimizer for NoopOptimizer {
    fn accumulate(&mut self, _grads: GradStore) -> Result<(), TrainingError> {
        Ok(())
    }

    fn step(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn zero_grad(&mut self) {}

    fn learning_rate(&self) -> f64 {
        0.0
    }

    fn set_learning_rate(&mut self, _lr: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_grads(var: &Var, scale: f64) -> GradStore {
        // d/dw sum(scale * w^2) = 2 * scale * w
        var.as_tensor()
            .sqr()
            .unwrap()
            .affine(scale, 0.0)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap()
    }

    #[test]
    fn accumulate_sums_gradients_until_zeroed() {
        let w = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let mut adam = Adam::new(vec![("w".into(), w.clone())], AdamConfig::default()).unwrap();

        adam.accumulate(quadratic_grads(&w, 1.0)).unwrap();
        adam.accumulate(quadratic_grads(&w, 1.0)).unwrap();
        let grad = adam.gradient("w").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![4.0, -8.0]);

        adam.zero_grad();
        assert_eq!(adam.pending_gradients(), 0);
    }

    #[test]
    fn step_moves_parameters_against_the_gradient() {
        let w = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let config = AdamConfig {
            learning_rate: 0.1,
            ..AdamConfig::default()
        };
        let mut adam = Adam::new(vec![("w".into(), w.clone())], config).unwrap();

        adam.accumulate(quadratic_grads(&w, 1.0)).unwrap();
        adam.step().unwrap();

        // First Adam step moves each weight by ~lr * sign(grad).
        let values = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-4, "{values:?}");
        assert!((values[1] + 1.9).abs() < 1e-4, "{values:?}");
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn step_without_gradients_is_a_no_op() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut adam = Adam::new(vec![("w".into(), w.clone())], AdamConfig::default()).unwrap();
        adam.step().unwrap();
        assert_eq!(adam.steps(), 0);
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
    }

    #[test]
    fn learning_rate_is_adjustable() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut adam = Adam::new(vec![("w".into(), w)], AdamConfig::default()).unwrap();
        adam.set_learning_rate(3e-4);
        assert_eq!(adam.learning_rate(), 3e-4);
    }

    #[test]
    fn rejects_empty_parameter_list() {
        assert!(Adam::new(Vec::new(), AdamConfig::default()).is_err());
    }
}
