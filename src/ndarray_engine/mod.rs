//! Reference engine that executes layer graphs on ndarray tensors.

mod model;
mod program;
mod session;

pub use model::NdArrayModel;
pub use session::{NdArrayEngine, NdArraySession};
