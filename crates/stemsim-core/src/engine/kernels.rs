use super::config::Algorithm;
use crate::core::models::structure::Structure;
use crate::core::optics::probe::FrequencyGrid;
use ndarray::{Array2, ArrayD};
use num_complex::Complex64;
use std::error::Error as StdError;
use std::path::Path;
use thiserror::Error;

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

/// Failure reported by a simulation kernel.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct KernelError {
    message: String,
    #[source]
    source: Option<BoxedSource>,
}

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The product of one frozen-phonon realization.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenPhononResult {
    pub output: ArrayD<f64>,
    pub dpc_com: Option<ArrayD<f64>>,
}

impl FrozenPhononResult {
    pub fn new(output: ArrayD<f64>, dpc_com: Option<ArrayD<f64>>) -> Self {
        Self { output, dpc_com }
    }
}

/// Everything an output kernel needs besides the potential or matrix.
#[derive(Debug, Clone, Copy)]
pub struct OutputRequest<'a> {
    /// Aberration phase surface over [`SimulationKernels::probe_frequencies`].
    pub aberration_surface: &'a Array2<Complex64>,
    pub wavelength: f64,
    /// Working probe defocus in Angstroms.
    pub defocus: f64,
    pub include_dpc_com: bool,
}

/// The numerical building blocks the pipeline orchestrates.
///
/// Implementations own their own sampling parameters; the engine only decides
/// which kernel runs when, with which seed and aberration surface, and what
/// happens to the result. Kernels may parallelize internally.
pub trait SimulationKernels {
    type Potential;
    type ScatteringMatrix;

    /// Spatial-frequency grid of the probe window used by `algorithm`.
    fn probe_frequencies(&self, algorithm: Algorithm) -> &FrequencyGrid;

    /// Computes the projected potential of one thermal configuration.
    fn compute_potential(
        &self,
        structure: &Structure,
        phonon_seed: u64,
    ) -> Result<Self::Potential, KernelError>;

    fn import_potential(&self, artifact: &Path) -> Result<Self::Potential, KernelError>;

    fn compute_scattering_matrix(
        &self,
        potential: &Self::Potential,
    ) -> Result<Self::ScatteringMatrix, KernelError>;

    fn import_scattering_matrix(
        &self,
        artifact: &Path,
    ) -> Result<Self::ScatteringMatrix, KernelError>;

    /// Moves the focal plane of `matrix` to `defocus`.
    fn refocus(&self, matrix: &mut Self::ScatteringMatrix, defocus: f64)
    -> Result<(), KernelError>;

    fn multislice_output(
        &self,
        potential: &Self::Potential,
        request: &OutputRequest<'_>,
    ) -> Result<FrozenPhononResult, KernelError>;

    fn prism_output(
        &self,
        matrix: &Self::ScatteringMatrix,
        request: &OutputRequest<'_>,
    ) -> Result<FrozenPhononResult, KernelError>;

    /// Real-valued export of a potential for persistence, if supported.
    fn potential_dataset(&self, _potential: &Self::Potential) -> Option<ArrayD<f64>> {
        None
    }

    /// Real-valued export of a scattering matrix for persistence, if supported.
    fn matrix_dataset(&self, _matrix: &Self::ScatteringMatrix) -> Option<ArrayD<f64>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_exposes_its_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such artifact");
        let err = KernelError::with_source("failed to import potential", io);
        assert_eq!(err.to_string(), "failed to import potential");
        assert_eq!(err.source().unwrap().to_string(), "no such artifact");
        assert!(KernelError::new("plain").source().is_none());
    }
}
