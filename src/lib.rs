pub mod backend;
pub mod cancel;
pub mod error;
pub mod guidance;
pub mod load;
pub mod model;
pub mod options;
pub mod schedule;
pub mod scheduler;
pub mod tensor;
pub mod tiles;

pub mod diffuser;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancellationToken;
pub use error::{DiffusionError, Result};
pub use options::{GenerationOptions, ModelConfig, TileOptions};
