use super::config::{Algorithm, PotentialSource};
use super::error::EngineError;
use super::kernels::{FrozenPhononResult, KernelError, OutputRequest, SimulationKernels};
use super::state::SimulationParameters;
use crate::core::io::store::DatasetStore;
use crate::core::optics::aberration::build_aberration_surface;
use ndarray::ArrayD;
use std::fmt;
use tracing::{debug, info, instrument};

pub const POTENTIAL_DATASET: &str = "potential";
pub const MATRIX_DATASET: &str = "smatrix";

/// A step of the simulation pipeline, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Potential,
    Scattering,
    Refocus,
    Output,
    Accumulate,
    SeriesFinalize,
    Metadata,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Potential => "potential",
            Stage::Scattering => "scattering",
            Stage::Refocus => "refocus",
            Stage::Output => "output",
            Stage::Accumulate => "accumulate",
            Stage::SeriesFinalize => "series-finalize",
            Stage::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// How far a realization has progressed through the pipeline.
#[derive(Debug)]
pub enum PreparedStage<P, S> {
    PotentialReady(P),
    ScatteringReady(S),
    Refocused { matrix: S, defocus: f64 },
}

/// Drives the kernels through one frozen-phonon realization.
///
/// When an artifact store is attached, the potential and scattering matrix of
/// the first realization are persisted if the output settings request it.
pub struct PipelineRunner<'a, K: SimulationKernels> {
    kernels: &'a K,
    artifact: Option<&'a DatasetStore>,
}

impl<'a, K: SimulationKernels> PipelineRunner<'a, K> {
    pub fn new(kernels: &'a K) -> Self {
        Self {
            kernels,
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: &'a DatasetStore) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Runs the potential stage and, for PRISM, the scattering stage.
    #[instrument(skip_all, fields(phonon = params.state.phonon_index))]
    pub fn prepare(
        &self,
        params: &SimulationParameters,
    ) -> Result<PreparedStage<K::Potential, K::ScatteringMatrix>, EngineError> {
        let config = params.config;

        let potential = match &config.potential_source {
            PotentialSource::ImportMatrix(path) => {
                if config.algorithm != Algorithm::Prism {
                    return Err(EngineError::Internal(
                        "scattering matrix import reached a multislice run".to_string(),
                    ));
                }
                info!(path = %path.display(), "Importing scattering matrix.");
                let matrix = self
                    .kernels
                    .import_scattering_matrix(path)
                    .map_err(EngineError::kernel(Stage::Scattering))?;
                return Ok(PreparedStage::ScatteringReady(matrix));
            }
            PotentialSource::ImportPotential(path) => {
                info!(path = %path.display(), "Importing potential.");
                self.kernels
                    .import_potential(path)
                    .map_err(EngineError::kernel(Stage::Potential))?
            }
            PotentialSource::ComputeFromStructure => {
                debug!(
                    seed = params.state.phonon_seed,
                    atoms = params.structure.len(),
                    "Computing projected potential."
                );
                self.kernels
                    .compute_potential(params.structure, params.state.phonon_seed)
                    .map_err(EngineError::kernel(Stage::Potential))?
            }
        };

        if config.output.save_potential && params.state.phonon_index == 0 {
            self.persist(
                Stage::Potential,
                POTENTIAL_DATASET,
                self.kernels.potential_dataset(&potential),
            )?;
        }

        match config.algorithm {
            Algorithm::Multislice => Ok(PreparedStage::PotentialReady(potential)),
            Algorithm::Prism => {
                debug!("Computing compact scattering matrix.");
                let matrix = self
                    .kernels
                    .compute_scattering_matrix(&potential)
                    .map_err(EngineError::kernel(Stage::Scattering))?;
                if config.output.save_smatrix && params.state.phonon_index == 0 {
                    self.persist(
                        Stage::Scattering,
                        MATRIX_DATASET,
                        self.kernels.matrix_dataset(&matrix),
                    )?;
                }
                Ok(PreparedStage::ScatteringReady(matrix))
            }
        }
    }

    /// Applies matrix refocus for the current working defocus.
    ///
    /// A no-op unless refocus is enabled and the stage holds a scattering matrix
    /// that is not already at that defocus.
    pub fn refocus(
        &self,
        stage: PreparedStage<K::Potential, K::ScatteringMatrix>,
        params: &SimulationParameters,
    ) -> Result<PreparedStage<K::Potential, K::ScatteringMatrix>, EngineError> {
        if !params.config.matrix_refocus {
            return Ok(stage);
        }
        let defocus = params.state.probe_defocus;
        let mut matrix = match stage {
            PreparedStage::PotentialReady(_) => return Ok(stage),
            PreparedStage::Refocused {
                defocus: current, ..
            } if current == defocus => return Ok(stage),
            PreparedStage::ScatteringReady(matrix) | PreparedStage::Refocused { matrix, .. } => {
                matrix
            }
        };
        debug!(defocus, "Refocusing scattering matrix.");
        self.kernels
            .refocus(&mut matrix, defocus)
            .map_err(EngineError::kernel(Stage::Refocus))?;
        Ok(PreparedStage::Refocused { matrix, defocus })
    }

    /// Runs the output kernel matching the stage with the current aberrations.
    pub fn output(
        &self,
        stage: &PreparedStage<K::Potential, K::ScatteringMatrix>,
        params: &SimulationParameters,
    ) -> Result<FrozenPhononResult, EngineError> {
        let config = params.config;
        let grid = self.kernels.probe_frequencies(config.algorithm);
        let surface = build_aberration_surface(
            grid.q(),
            grid.q_theta(),
            params.wavelength,
            &params.state.aberrations,
        );
        let request = OutputRequest {
            aberration_surface: &surface,
            wavelength: params.wavelength,
            defocus: params.state.probe_defocus,
            include_dpc_com: config.output.save_dpc_com,
        };

        let mut result = match stage {
            PreparedStage::PotentialReady(potential) => {
                self.kernels.multislice_output(potential, &request)
            }
            PreparedStage::ScatteringReady(matrix) | PreparedStage::Refocused { matrix, .. } => {
                self.kernels.prism_output(matrix, &request)
            }
        }
        .map_err(EngineError::kernel(Stage::Output))?;

        if config.output.save_dpc_com {
            if result.dpc_com.is_none() {
                return Err(EngineError::kernel(Stage::Output)(KernelError::new(
                    "output kernel did not produce the requested DPC-CoM signal",
                )));
            }
        } else {
            result.dpc_com = None;
        }
        Ok(result)
    }

    /// One full traversal for the current state; no retries.
    pub fn run(&self, params: &SimulationParameters) -> Result<FrozenPhononResult, EngineError> {
        let stage = self.prepare(params)?;
        let stage = self.refocus(stage, params)?;
        self.output(&stage, params)
    }

    fn persist(
        &self,
        stage: Stage,
        name: &str,
        dataset: Option<ArrayD<f64>>,
    ) -> Result<(), EngineError> {
        let Some(artifact) = self.artifact else {
            return Ok(());
        };
        match dataset {
            Some(data) => {
                info!(dataset = name, "Saving {} to the output artifact.", name);
                artifact
                    .write(name, &data)
                    .map_err(EngineError::store(stage))
            }
            None => Err(EngineError::kernel(stage)(KernelError::new(format!(
                "the kernel set cannot export its {} for saving",
                name
            )))),
        }
    }
}
