use thiserror::Error;

/// Result type for goes16ci operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),

    #[error("spatial width {width} is not min_data_width {min_data_width} times a power of two")]
    DepthRatio { width: usize, min_data_width: usize },

    #[error("input has {found} variables but the scaler was fitted on {expected}")]
    VariableMismatch { expected: usize, found: usize },

    #[error("variable {variable} has zero range and cannot be rescaled")]
    ZeroRange { variable: usize },

    #[error("scaler has not been fitted")]
    NotFitted,

    #[error("graph error: {0}")]
    Graph(String),

    #[error("cannot place model on {device}: {reason}")]
    Placement { device: String, reason: String },

    #[error("model has not been compiled")]
    NotCompiled,

    #[error("engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl Error {
    /// Create a shape validation error
    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        Error::InvalidShape(msg.into())
    }

    /// Create a hyperparameter validation error
    pub fn invalid_hyperparameter(msg: impl Into<String>) -> Self {
        Error::InvalidHyperparameter(msg.into())
    }

    /// Create a graph construction error
    pub fn graph(msg: impl Into<String>) -> Self {
        Error::Graph(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Error::Engine(msg.into())
    }
}
