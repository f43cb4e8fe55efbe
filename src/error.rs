use thiserror::Error;

use crate::options::{DiffuserKind, PipelineKind, SchedulerKind};

pub type Result<T> = std::result::Result<T, DiffusionError>;

#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Scheduler {scheduler:?} is not supported by the {pipeline:?} pipeline")]
    UnsupportedScheduler {
        pipeline: PipelineKind,
        scheduler: SchedulerKind,
    },

    #[error("Diffuser {diffuser:?} is not supported by the {pipeline:?} pipeline")]
    UnsupportedDiffuser {
        pipeline: PipelineKind,
        diffuser: DiffuserKind,
    },

    #[error("Missing input: {0}")]
    MissingInput(&'static str),

    #[error("Diffusion run was cancelled")]
    Cancelled,

    #[error("Non-finite values in {context}")]
    NumericalFault { context: String },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiffusionError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        DiffusionError::Configuration(message.into())
    }

    pub fn shape_mismatch<S: Into<String>>(context: S, expected: &[usize], found: &[usize]) -> Self {
        DiffusionError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// True when the run ended because its cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DiffusionError::Cancelled)
    }
}
