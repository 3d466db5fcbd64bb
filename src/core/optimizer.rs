//! Adam optimizer over candle `Var`s with serialisable state
//!
//! Weight decay is the classic L2 form: `decay * param` is added to the
//! gradient before the moment updates.

use std::collections::BTreeMap;

use candle_core::{backprop::GradStore, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{HyperRouteError, Result};

/// Adam hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Step size
    pub lr: f64,
    /// First moment decay rate
    pub beta1: f64,
    /// Second moment decay rate
    pub beta2: f64,
    /// Numerical stability constant
    pub eps: f64,
    /// L2 penalty added to gradients
    pub weight_decay: f64,
}

impl AdamConfig {
    /// Default betas and epsilon with the given step size and decay
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        AdamConfig {
            lr,
            weight_decay,
            ..Self::default()
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Exported moments of one parameter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamState {
    /// Updates applied so far
    pub step: u64,
    /// Shape of the parameter
    pub shape: Vec<usize>,
    /// First moment, row-major
    pub exp_avg: Vec<f32>,
    /// Second moment, row-major
    pub exp_avg_sq: Vec<f32>,
}

/// Full optimizer state, keyed by parameter name
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Hyperparameters in effect when exported
    pub config: AdamConfig,
    /// Per-parameter moments; parameters never updated are absent
    pub state: BTreeMap<String, ParamState>,
}

struct Moments {
    step: u64,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Adam optimizer
pub struct Adam {
    config: AdamConfig,
    params: Vec<(String, Var)>,
    moments: BTreeMap<String, Moments>,
}

impl Adam {
    /// Track `params` (name, variable)
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> Self {
        Adam {
            config,
            params,
            moments: BTreeMap::new(),
        }
    }

    /// Hyperparameters
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Apply one update from `grads`; parameters without a gradient are skipped
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config.clone();

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let param = var.as_tensor().detach();
            let grad = if weight_decay != 0.0 {
                grad.add(&param.affine(weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            if !self.moments.contains_key(name) {
                self.moments.insert(
                    name.clone(),
                    Moments {
                        step: 0,
                        exp_avg: param.zeros_like()?,
                        exp_avg_sq: param.zeros_like()?,
                    },
                );
            }
            let Some(m) = self.moments.get_mut(name) else {
                continue;
            };

            m.step += 1;
            m.exp_avg = m
                .exp_avg
                .affine(beta1, 0.0)?
                .add(&grad.affine(1.0 - beta1, 0.0)?)?
                .detach();
            m.exp_avg_sq = m
                .exp_avg_sq
                .affine(beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - beta2, 0.0)?)?
                .detach();

            let t = m.step as i32;
            let bias_correction1 = 1.0 - beta1.powi(t);
            let bias_correction2 = 1.0 - beta2.powi(t);
            let step_size = lr / bias_correction1;

            let denom = m
                .exp_avg_sq
                .sqrt()?
                .affine(1.0 / bias_correction2.sqrt(), eps)?;
            let update = m.exp_avg.div(&denom)?.affine(step_size, 0.0)?;
            var.set(&param.sub(&update)?)?;
        }
        Ok(())
    }

    /// Snapshot of hyperparameters and moments
    pub fn state(&self) -> Result<OptimizerState> {
        let mut state = BTreeMap::new();
        for (name, m) in &self.moments {
            state.insert(
                name.clone(),
                ParamState {
                    step: m.step,
                    shape: m.exp_avg.dims().to_vec(),
                    exp_avg: m.exp_avg.flatten_all()?.to_vec1::<f32>()?,
                    exp_avg_sq: m.exp_avg_sq.flatten_all()?.to_vec1::<f32>()?,
                },
            );
        }
        Ok(OptimizerState {
            config: self.config.clone(),
            state,
        })
    }

    /// Restore moments exported by [`Adam::state`]
    ///
    /// Every entry must name a tracked parameter of the same shape. The
    /// hyperparameters of this optimizer are kept.
    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        let mut moments = BTreeMap::new();
        for (name, saved) in &state.state {
            let Some((_, var)) = self.params.iter().find(|(n, _)| n == name) else {
                return Err(HyperRouteError::Checkpoint(format!(
                    "optimizer state for unknown parameter '{name}'"
                )));
            };
            let tensor = var.as_tensor();
            let numel: usize = saved.shape.iter().product();
            if saved.shape != tensor.dims()
                || saved.exp_avg.len() != numel
                || saved.exp_avg_sq.len() != numel
            {
                return Err(HyperRouteError::Checkpoint(format!(
                    "optimizer state for '{name}' has shape {:?}, parameter has {:?}",
                    saved.shape,
                    tensor.dims()
                )));
            }
            let device = tensor.device();
            moments.insert(
                name.clone(),
                Moments {
                    step: saved.step,
                    exp_avg: Tensor::from_slice(&saved.exp_avg, tensor.dims(), device)?,
                    exp_avg_sq: Tensor::from_slice(&saved.exp_avg_sq, tensor.dims(), device)?,
                },
            );
        }
        self.moments = moments;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn reference_adam(x0: f64, steps: usize, cfg: &AdamConfig) -> f64 {
        // loss = x², so dL/dx = 2x
        let (mut x, mut m, mut v) = (x0, 0.0, 0.0);
        for t in 1..=steps {
            let g = 2.0 * x + cfg.weight_decay * x;
            m = cfg.beta1 * m + (1.0 - cfg.beta1) * g;
            v = cfg.beta2 * v + (1.0 - cfg.beta2) * g * g;
            let bc1 = 1.0 - cfg.beta1.powi(t as i32);
            let bc2 = 1.0 - cfg.beta2.powi(t as i32);
            x -= cfg.lr / bc1 * m / (v.sqrt() / bc2.sqrt() + cfg.eps);
        }
        x
    }

    fn run(cfg: AdamConfig, steps: usize) -> (Var, Adam) {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let mut adam = Adam::new(vec![("w".to_string(), var.clone())], cfg);
        for _ in 0..steps {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            adam.step(&grads).unwrap();
        }
        (var, adam)
    }

    #[test]
    fn test_adam_matches_hand_computed_steps() {
        let cfg = AdamConfig::new(0.1, 0.0);
        let (var, _) = run(cfg.clone(), 3);
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] as f64 - reference_adam(1.0, 3, &cfg)).abs() < 1e-5);
        assert!((values[1] as f64 - reference_adam(-2.0, 3, &cfg)).abs() < 1e-5);
        // first step moves by lr in the gradient sign
        let (var, _) = run(cfg, 1);
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-6);
        assert!((values[1] + 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_weight_decay_is_added_to_gradient() {
        let cfg = AdamConfig::new(0.05, 0.5);
        let (var, _) = run(cfg.clone(), 4);
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] as f64 - reference_adam(1.0, 4, &cfg)).abs() < 1e-5);
    }

    #[test]
    fn test_state_round_trip() {
        let (_, adam) = run(AdamConfig::new(0.1, 0.0), 2);
        let state = adam.state().unwrap();
        assert_eq!(state.state["w"].step, 2);

        let var = Var::new(&[0.0f32, 0.0], &Device::Cpu).unwrap();
        let mut fresh = Adam::new(vec![("w".to_string(), var)], AdamConfig::new(0.1, 0.0));
        fresh.load_state(&state).unwrap();
        assert_eq!(fresh.state().unwrap(), state);
    }

    #[test]
    fn test_load_rejects_foreign_state() {
        let (_, adam) = run(AdamConfig::default(), 1);
        let state = adam.state().unwrap();

        let var = Var::new(&[0.0f32, 0.0, 0.0], &Device::Cpu).unwrap();
        let mut other = Adam::new(vec![("w".to_string(), var.clone())], AdamConfig::default());
        assert!(matches!(other.load_state(&state), Err(HyperRouteError::Checkpoint(_))));

        let mut renamed = Adam::new(vec![("v".to_string(), var)], AdamConfig::default());
        assert!(matches!(renamed.load_state(&state), Err(HyperRouteError::Checkpoint(_))));
    }
}
