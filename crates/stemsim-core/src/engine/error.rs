use thiserror::Error;

use super::config::ConfigError;
use super::kernels::KernelError;
use super::pipeline::Stage;
use crate::core::io::store::StoreError;
use crate::core::optics::aberration::AberrationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid simulation configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Aberration input error: {0}")]
    Aberration(#[from] AberrationError),

    #[error("Kernel failure in the {stage} stage: {source}")]
    Kernel { stage: Stage, source: KernelError },

    #[error("Storage failure in the {stage} stage: {source}")]
    Store { stage: Stage, source: StoreError },

    #[error(
        "Series finalization requested tag '{tag}', which was never written to the scratch accumulator"
    )]
    ScratchConsistency { tag: String },

    #[error("Frozen phonon result has shape {found:?}, but earlier realizations had {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn kernel(stage: Stage) -> impl FnOnce(KernelError) -> Self {
        move |source| EngineError::Kernel { stage, source }
    }

    pub(crate) fn store(stage: Stage) -> impl FnOnce(StoreError) -> Self {
        move |source| EngineError::Store { stage, source }
    }
}
