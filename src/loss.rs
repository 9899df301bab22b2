use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

const EPSILON: f32 = 1e-7;

/// Loss functions, also usable as reported metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Loss {
    #[serde(rename = "mse", alias = "mean_squared_error")]
    MeanSquaredError,
    #[serde(rename = "mae", alias = "mean_absolute_error")]
    MeanAbsoluteError,
    #[serde(rename = "binary_crossentropy")]
    BinaryCrossEntropy,
    #[serde(rename = "categorical_crossentropy")]
    CrossEntropyLoss,
}

impl Loss {
    pub fn name(&self) -> &'static str {
        match self {
            Loss::MeanSquaredError => "mse",
            Loss::MeanAbsoluteError => "mae",
            Loss::BinaryCrossEntropy => "binary_crossentropy",
            Loss::CrossEntropyLoss => "categorical_crossentropy",
        }
    }

    /// Batch-averaged loss for predictions and targets of shape (examples, outputs)
    pub fn calculate(&self, prediction: &Array2<f32>, target: &Array2<f32>) -> f32 {
        let count = prediction.len().max(1) as f32;
        let examples = prediction.nrows().max(1) as f32;
        match self {
            Loss::MeanSquaredError => {
                Zip::from(prediction)
                    .and(target)
                    .fold(0.0, |acc, &p, &t| acc + (p - t).powi(2))
                    / count
            }
            Loss::MeanAbsoluteError => {
                Zip::from(prediction)
                    .and(target)
                    .fold(0.0, |acc, &p, &t| acc + (p - t).abs())
                    / count
            }
            Loss::BinaryCrossEntropy => {
                Zip::from(prediction).and(target).fold(0.0, |acc, &p, &t| {
                    let p = p.clamp(EPSILON, 1.0 - EPSILON);
                    acc - (t * p.ln() + (1.0 - t) * (1.0 - p).ln())
                }) / count
            }
            Loss::CrossEntropyLoss => {
                // -Σ(target * log(prediction)) per example
                Zip::from(prediction).and(target).fold(0.0, |acc, &p, &t| {
                    acc - t * p.clamp(EPSILON, 1.0 - EPSILON).ln()
                }) / examples
            }
        }
    }

    /// Gradient of `calculate` with respect to the prediction
    pub fn gradient(&self, prediction: &Array2<f32>, target: &Array2<f32>) -> Array2<f32> {
        let count = prediction.len().max(1) as f32;
        let examples = prediction.nrows().max(1) as f32;
        match self {
            Loss::MeanSquaredError => {
                Zip::from(prediction).and(target).map_collect(|&p, &t| 2.0 * (p - t) / count)
            }
            Loss::MeanAbsoluteError => {
                Zip::from(prediction).and(target).map_collect(|&p, &t| {
                    let diff = p - t;
                    if diff > 0.0 {
                        1.0 / count
                    } else if diff < 0.0 {
                        -1.0 / count
                    } else {
                        0.0
                    }
                })
            }
            Loss::BinaryCrossEntropy => {
                Zip::from(prediction).and(target).map_collect(|&p, &t| {
                    let p = p.clamp(EPSILON, 1.0 - EPSILON);
                    (p - t) / (p * (1.0 - p)) / count
                })
            }
            Loss::CrossEntropyLoss => {
                Zip::from(prediction).and(target).map_collect(|&p, &t| {
                    -t / p.clamp(EPSILON, 1.0 - EPSILON) / examples
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_mean_squared_error() {
        let prediction = array![[1.0, 0.5], [0.0, 0.0]];
        let target = array![[1.0, 1.0], [1.0, 0.0]];
        // (0 + 0.25 + 1 + 0) / 4
        assert_abs_diff_eq!(
            Loss::MeanSquaredError.calculate(&prediction, &target),
            0.3125,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_mse_gradient_matches_finite_difference() {
        let prediction = array![[0.2, 0.7], [0.4, 0.9]];
        let target = array![[0.0, 1.0], [1.0, 0.5]];
        let grad = Loss::MeanSquaredError.gradient(&prediction, &target);

        let h = 1e-3;
        let mut shifted = prediction.clone();
        shifted[[1, 0]] += h;
        let numeric = (Loss::MeanSquaredError.calculate(&shifted, &target)
            - Loss::MeanSquaredError.calculate(&prediction, &target)) / h;
        assert_abs_diff_eq!(grad[[1, 0]], numeric, epsilon = 1e-2);
    }

    #[test]
    fn test_binary_cross_entropy_is_finite_at_extremes() {
        let prediction = array![[0.0], [1.0]];
        let target = array![[1.0], [0.0]];
        let loss = Loss::BinaryCrossEntropy.calculate(&prediction, &target);
        assert!(loss.is_finite());
        assert!(loss > 10.0);
    }

    #[test]
    fn test_loss_names_parse() {
        let loss: Loss = serde_json::from_str("\"mse\"").unwrap();
        assert_eq!(loss, Loss::MeanSquaredError);
        let loss: Loss = serde_json::from_str("\"mean_absolute_error\"").unwrap();
        assert_eq!(loss, Loss::MeanAbsoluteError);
    }
}
