use serde::{Deserialize, Serialize};

/// Activation kinds accepted in hyperparameter sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    Linear,
    #[serde(rename = "relu")]
    ReLU,
    Sigmoid,
    Tanh,
    Softmax,
    /// Leaky rectifier, slope taken from `leaky_alpha`
    Leaky,
}

impl ActivationType {
    /// Binds the kind to a concrete function. `leaky_alpha` is only read for `Leaky`.
    pub fn resolve(self, leaky_alpha: f32) -> Activation {
        match self {
            ActivationType::Linear => Activation::Linear,
            ActivationType::ReLU => Activation::ReLU,
            ActivationType::Sigmoid => Activation::Sigmoid,
            ActivationType::Tanh => Activation::Tanh,
            ActivationType::Softmax => Activation::Softmax,
            ActivationType::Leaky => Activation::LeakyReLU(leaky_alpha),
        }
    }

    /// True when the function acts on each element independently
    pub fn is_elementwise(self) -> bool {
        !matches!(self, ActivationType::Softmax)
    }
}

/// A resolved activation function as stored in a layer graph
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    ReLU,
    Sigmoid,
    Tanh,
    /// Normalizes each example's feature row, only valid on flat tensors
    Softmax,
    LeakyReLU(f32),
}

impl Activation {
    /// Applies an element-wise activation to a given input
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::ReLU => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Linear | Activation::Softmax => x,
            Activation::LeakyReLU(alpha) => if x > 0.0 { x } else { alpha * x },
        }
    }

    /// Derivative of the element-wise activation with respect to its preactivation
    pub fn derivative(&self, x: f32) -> f32 {
        match self {
            Activation::Sigmoid => {
                let sigmoid = 1.0 / (1.0 + (-x).exp());
                sigmoid * (1.0 - sigmoid)
            },
            Activation::ReLU => if x > 0.0 { 1.0 } else { 0.0 },
            Activation::Tanh => 1.0 - x.tanh().powi(2),
            Activation::Linear | Activation::Softmax => 1.0,
            Activation::LeakyReLU(alpha) => if x > 0.0 { 1.0 } else { *alpha },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::ReLU => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Softmax => "softmax",
            Activation::LeakyReLU(_) => "leaky_relu",
        }
    }
}
