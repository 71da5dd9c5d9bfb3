use crate::core::tree::{ParamTree, TreeError};
use std::fmt;
use std::str::FromStr;

use super::config::ConfigError;

/// Parameters plus whatever per-parameter buffers the optimizer keeps
/// (Adam keeps first and second moments; plain descent keeps none).
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub params: ParamTree,
    pub slots: Vec<ParamTree>,
}

/// First-order update rule over parameter trees.
///
/// The gradient passed to [`Optimizer::update`] is already scaled by the
/// learning rate, so built-in rules use a unit step size.
pub trait Optimizer: fmt::Debug {
    fn init_state(&self, params: ParamTree) -> OptimizerState;

    /// Applies one update. `step` is the zero-based update index.
    fn update(
        &self,
        step: usize,
        grad: &ParamTree,
        state: OptimizerState,
    ) -> Result<OptimizerState, TreeError>;

    fn params(&self, state: &OptimizerState) -> ParamTree {
        state.params.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    step_size: f64,
}

impl Sgd {
    pub fn new(step_size: f64) -> Self {
        Self { step_size }
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Optimizer for Sgd {
    fn init_state(&self, params: ParamTree) -> OptimizerState {
        OptimizerState {
            params,
            slots: Vec::new(),
        }
    }

    fn update(
        &self,
        _step: usize,
        grad: &ParamTree,
        state: OptimizerState,
    ) -> Result<OptimizerState, TreeError> {
        let lr = self.step_size;
        let params = state.params.zip_with(grad, |p, g| p - &(g * lr))?;
        Ok(OptimizerState {
            params,
            slots: state.slots,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adam {
    step_size: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
}

impl Adam {
    pub fn new(step_size: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            step_size,
            beta1,
            beta2,
            epsilon,
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(1.0, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn init_state(&self, params: ParamTree) -> OptimizerState {
        let zeros = params.zeros_like();
        OptimizerState {
            slots: vec![zeros.clone(), zeros],
            params,
        }
    }

    fn update(
        &self,
        step: usize,
        grad: &ParamTree,
        state: OptimizerState,
    ) -> Result<OptimizerState, TreeError> {
        let Self {
            step_size,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
        } = *self;

        let [m, v] = <[ParamTree; 2]>::try_from(state.slots).map_err(|slots| {
            TreeError::StructureMismatch {
                path: "/".to_string(),
                reason: format!("Adam expects 2 moment buffers, found {}", slots.len()),
            }
        })?;

        let m = m.zip_with(grad, |m, g| m * b1 + g * (1.0 - b1))?;
        let v = v.zip_with(grad, |v, g| v * b2 + g.mapv(|x| x * x) * (1.0 - b2))?;

        let t = i32::try_from(step).unwrap_or(i32::MAX).saturating_add(1);
        let bc1 = 1.0 - b1.powi(t);
        let bc2 = 1.0 - b2.powi(t);

        let delta = m.zip_with(&v, |m, v| {
            let m_hat = m / bc1;
            let v_hat = v / bc2;
            m_hat / (v_hat.mapv(f64::sqrt) + eps)
        })?;
        let params = state.params.zip_with(&delta, |p, d| p - &(d * step_size))?;

        Ok(OptimizerState {
            params,
            slots: vec![m, v],
        })
    }
}

/// Built-in optimizers selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl OptimizerKind {
    pub fn default_learning_rate(self) -> f64 {
        match self {
            OptimizerKind::Sgd => 0.1,
            OptimizerKind::Adam => 0.02,
        }
    }

    pub fn build(self) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Sgd => Box::new(Sgd::default()),
            OptimizerKind::Adam => Box::new(Adam::default()),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::Adam => write!(f, "adam"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(ConfigError::InvalidValue {
                name: "optimizer",
                reason: format!("unknown optimizer '{}', expected 'sgd' or 'adam'", other),
            }),
        }
    }
}

/// Either a built-in optimizer (which also resets the learning rate to its
/// default) or a caller-supplied one (learning rate left untouched).
#[derive(Debug)]
pub enum OptimizerChoice {
    Named(OptimizerKind),
    Custom(Box<dyn Optimizer>),
}

impl Default for OptimizerChoice {
    fn default() -> Self {
        OptimizerChoice::Named(OptimizerKind::Sgd)
    }
}

impl From<OptimizerKind> for OptimizerChoice {
    fn from(kind: OptimizerKind) -> Self {
        OptimizerChoice::Named(kind)
    }
}

impl OptimizerChoice {
    /// Resolves to the optimizer and, for built-ins, its default learning rate.
    pub fn resolve(self) -> (Box<dyn Optimizer>, Option<f64>) {
        match self {
            OptimizerChoice::Named(kind) => (kind.build(), Some(kind.default_learning_rate())),
            OptimizerChoice::Custom(optimizer) => (optimizer, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn tree(values: &[f64]) -> ParamTree {
        ParamTree::from_entries([("seq", ParamTree::leaf(arr1(values).into_dyn()))])
    }

    fn seq_values(tree: &ParamTree) -> Vec<f64> {
        tree.leaf_at("seq").unwrap().iter().copied().collect()
    }

    #[test]
    fn sgd_subtracts_gradient() {
        let sgd = Sgd::default();
        let state = sgd.init_state(tree(&[1.0, -2.0]));
        let state = sgd.update(0, &tree(&[0.5, -0.5]), state).unwrap();
        assert_eq!(seq_values(&sgd.params(&state)), vec![0.5, -1.5]);
    }

    #[test]
    fn adam_first_step_moves_by_step_size_along_gradient_sign() {
        let adam = Adam::default();
        let state = adam.init_state(tree(&[1.0, 1.0]));
        assert_eq!(state.slots.len(), 2);
        let state = adam.update(0, &tree(&[0.5, -3.0]), state).unwrap();
        let values = seq_values(&adam.params(&state));
        assert!((values[0] - 0.0).abs() < 1e-6);
        assert!((values[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn adam_rejects_state_without_moments() {
        let adam = Adam::default();
        let state = Sgd::default().init_state(tree(&[1.0]));
        assert!(adam.update(0, &tree(&[1.0]), state).is_err());
    }

    #[test]
    fn update_rejects_mismatched_gradient() {
        let sgd = Sgd::default();
        let state = sgd.init_state(tree(&[1.0, 2.0]));
        assert!(sgd.update(0, &tree(&[1.0]), state).is_err());
    }

    #[test]
    fn named_optimizers_carry_default_learning_rates() {
        let (_, lr) = OptimizerChoice::from(OptimizerKind::Sgd).resolve();
        assert_eq!(lr, Some(0.1));
        let (_, lr) = OptimizerChoice::from("adam".parse::<OptimizerKind>().unwrap()).resolve();
        assert_eq!(lr, Some(0.02));
        let (_, lr) = OptimizerChoice::Custom(Box::new(Sgd::new(0.5))).resolve();
        assert_eq!(lr, None);
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
    }
}
