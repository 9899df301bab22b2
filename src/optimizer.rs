use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-7;
const SGD_MOMENTUM: f32 = 0.99;

/// Optimizer kinds accepted in hyperparameter sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    Adam,
    /// Stochastic gradient descent with momentum 0.99
    #[serde(rename = "sgd")]
    SgdMomentum,
}

/// What the compile step needs to construct an optimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: OptimizerType,
    pub learning_rate: f32,
}

impl OptimizerSpec {
    pub fn new(kind: OptimizerType, learning_rate: f32) -> Self {
        Self { kind, learning_rate }
    }

    pub fn build(&self) -> Optimizer {
        Optimizer::new(*self)
    }
}

#[derive(Debug, Clone)]
enum OptimizerState {
    Adam {
        step: i32,
        first_moments: Vec<ArrayD<f32>>,
        second_moments: Vec<ArrayD<f32>>,
    },
    SgdMomentum {
        velocities: Vec<ArrayD<f32>>,
    },
}

/// Stateful optimizer. Parameter slots are identified by their position in the
/// list passed to `update`, which must be stable across calls.
#[derive(Debug, Clone)]
pub struct Optimizer {
    pub learning_rate: f32,
    state: OptimizerState,
}

impl Optimizer {
    pub fn new(spec: OptimizerSpec) -> Self {
        let state = match spec.kind {
            OptimizerType::Adam => OptimizerState::Adam {
                step: 0,
                first_moments: Vec::new(),
                second_moments: Vec::new(),
            },
            OptimizerType::SgdMomentum => OptimizerState::SgdMomentum {
                velocities: Vec::new(),
            },
        };
        Self { learning_rate: spec.learning_rate, state }
    }

    /// Applies one update to every (value, gradient) slot
    pub fn update(&mut self, slots: Vec<(&mut ArrayD<f32>, &ArrayD<f32>)>) {
        let learning_rate = self.learning_rate;
        match &mut self.state {
            OptimizerState::Adam { step, first_moments, second_moments } => {
                *step += 1;
                let correction =
                    (1.0 - ADAM_BETA2.powi(*step)).sqrt() / (1.0 - ADAM_BETA1.powi(*step));
                let step_size = learning_rate * correction;
                for (i, (value, grad)) in slots.into_iter().enumerate() {
                    if first_moments.len() <= i {
                        first_moments.push(ArrayD::zeros(value.raw_dim()));
                        second_moments.push(ArrayD::zeros(value.raw_dim()));
                    }
                    Zip::from(value)
                        .and(grad)
                        .and(&mut first_moments[i])
                        .and(&mut second_moments[i])
                        .for_each(|w, &g, m, v| {
                            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                            *w -= step_size * *m / (v.sqrt() + ADAM_EPSILON);
                        });
                }
            }
            OptimizerState::SgdMomentum { velocities } => {
                for (i, (value, grad)) in slots.into_iter().enumerate() {
                    if velocities.len() <= i {
                        velocities.push(ArrayD::zeros(value.raw_dim()));
                    }
                    Zip::from(value)
                        .and(grad)
                        .and(&mut velocities[i])
                        .for_each(|w, &g, vel| {
                            *vel = SGD_MOMENTUM * *vel - learning_rate * g;
                            *w += *vel;
                        });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn test_sgd_moves_against_gradient() {
        let mut optimizer = OptimizerSpec::new(OptimizerType::SgdMomentum, 0.1).build();
        let mut value = arr1(&[1.0f32, -1.0]).into_dyn();
        let grad = arr1(&[1.0f32, -2.0]).into_dyn();

        optimizer.update(vec![(&mut value, &grad)]);
        assert_abs_diff_eq!(value[[0]], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(value[[1]], -0.8, epsilon = 1e-6);

        // momentum carries the previous velocity
        optimizer.update(vec![(&mut value, &grad)]);
        assert_abs_diff_eq!(value[[0]], 0.9 - 0.1 * 0.99 - 0.1, epsilon = 1e-5);
    }

    #[test]
    fn test_adam_first_step_is_learning_rate_sized() {
        let mut optimizer = OptimizerSpec::new(OptimizerType::Adam, 0.01).build();
        let mut value = arr1(&[0.5f32]).into_dyn();
        let grad = arr1(&[3.0f32]).into_dyn();

        optimizer.update(vec![(&mut value, &grad)]);
        assert_abs_diff_eq!(value[[0]], 0.49, epsilon = 1e-4);
    }

    #[test]
    fn test_optimizer_kind_names() {
        let kind: OptimizerType = serde_json::from_str("\"sgd\"").unwrap();
        assert_eq!(kind, OptimizerType::SgdMomentum);
    }
}
