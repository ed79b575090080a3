use crate::core::io::store::DatasetStore;
use crate::core::models::structure::Structure;
use crate::core::optics::aberration::Aberration;
use crate::engine::config::{ConfigError, PotentialSource, SimulationConfig};
use crate::engine::ensemble::{PhononSeeds, run_ensemble};
use crate::engine::error::EngineError;
use crate::engine::kernels::SimulationKernels;
use crate::engine::pipeline::{MATRIX_DATASET, POTENTIAL_DATASET, PipelineRunner, Stage};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::series::{ScratchAccumulator, finalize_series, run_series};
use crate::engine::state::{PhononAverage, SimulationParameters};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, instrument, warn};

pub const OUTPUT_DATASET: &str = "output";
pub const DPC_DATASET: &str = "dpc_com";

pub const SETUP_PHASE: &str = "Setup";
/// Counts one task step per frozen phonon realization.
pub const FROZEN_PHONON_PHASE: &str = "Frozen Phonons";
/// Counts one task step per (phonon, series point) realization.
pub const DEFOCUS_SERIES_PHASE: &str = "Defocus Series";
pub const SERIES_FINALIZATION_PHASE: &str = "Series Finalization";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SeriesMetadata {
    pub tags: Vec<String>,
    pub defocus: Vec<f64>,
}

/// Run description written to `metadata.toml` in the output artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulationMetadata {
    pub algorithm: String,
    pub potential_source: String,
    pub energy_kev: f64,
    pub wavelength: f64,
    pub num_fp: usize,
    pub random_seed: u64,
    pub probe_defocus: f64,
    pub c3: f64,
    pub c5: f64,
    pub probe_semiangle_mrad: f64,
    pub pixel_size: (f64, f64),
    pub probe_step: (f64, f64),
    pub interpolation_factor: (usize, usize),
    pub matrix_refocus: bool,
    pub datasets: Vec<String>,
    pub aberrations: Vec<Aberration>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub series: Option<SeriesMetadata>,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub output_path: PathBuf,
    pub datasets: Vec<String>,
    pub metadata: SimulationMetadata,
}

/// Runs a complete simulation and writes its artifact.
///
/// Configuration problems are reported before anything is written to disk.
/// A defocus series accumulates through a scratch store next to the output,
/// which is removed once every tag has been finalized.
#[instrument(skip_all, name = "simulation_workflow")]
pub fn run<K: SimulationKernels>(
    config: &SimulationConfig,
    structure: &Structure,
    kernels: &K,
    reporter: &ProgressReporter,
) -> Result<SimulationResult, EngineError> {
    // === Phase 0: Validation and setup ===
    reporter.report(Progress::PhaseStart { name: SETUP_PHASE });
    config.validate()?;
    if config.potential_source == PotentialSource::ComputeFromStructure && structure.is_empty() {
        return Err(ConfigError::InvalidValue {
            parameter: "structure",
            reason: "the specimen contains no atoms".to_string(),
        }
        .into());
    }

    let mut params = SimulationParameters::new(config, structure);
    info!(
        algorithm = %config.algorithm,
        source = config.potential_source.label(),
        wavelength = params.wavelength,
        num_fp = config.phonons.num_fp,
        "Starting simulation."
    );

    if config.series.is_some() {
        DatasetStore::check_replaceable(&config.scratch_path())
            .map_err(EngineError::store(Stage::Setup))?;
    }
    let artifact =
        DatasetStore::create(&config.output.path).map_err(EngineError::store(Stage::Setup))?;
    let runner = PipelineRunner::new(kernels).with_artifact(&artifact);
    let mut seeds = PhononSeeds::new(config.phonons.random_seed);
    let num_fp = config.phonons.num_fp;
    let mut datasets = Vec::new();
    reporter.report(Progress::PhaseFinish);

    match &config.series {
        None => {
            // === Phase 1: Frozen phonon ensemble ===
            reporter.report(Progress::PhaseStart {
                name: FROZEN_PHONON_PHASE,
            });
            reporter.report(Progress::TaskStart {
                total_steps: num_fp as u64,
            });
            let accumulator = run_ensemble(&runner, &mut params, num_fp, &mut seeds, reporter)?;
            reporter.report(Progress::TaskFinish);

            let mean = accumulator.into_mean().ok_or_else(|| {
                EngineError::Internal("no frozen phonon realization was accumulated".to_string())
            })?;
            write_average(&artifact, OUTPUT_DATASET, DPC_DATASET, &mean, &mut datasets)?;
            reporter.report(Progress::PhaseFinish);
        }
        Some(series) => {
            // === Phase 1: Defocus series scan ===
            let points = series.points();
            reporter.report(Progress::PhaseStart {
                name: DEFOCUS_SERIES_PHASE,
            });
            reporter.report(Progress::TaskStart {
                total_steps: (num_fp * points.len()) as u64,
            });
            let mut scratch = ScratchAccumulator::new(config.scratch_path());
            let scanned = run_series(
                &runner,
                &mut params,
                num_fp,
                &points,
                &mut scratch,
                &mut seeds,
                reporter,
            );
            reporter.report(Progress::TaskFinish);
            reporter.report(Progress::PhaseFinish);
            if let Err(err) = scanned {
                if let Err(cleanup) = scratch.discard() {
                    warn!("Failed to remove series scratch store: {}", cleanup);
                }
                return Err(err);
            }

            // === Phase 2: Series finalization ===
            reporter.report(Progress::PhaseStart {
                name: SERIES_FINALIZATION_PHASE,
            });
            finalize_series(&scratch, &points, num_fp, |point, mean| {
                params.enter_series_point(point);
                write_average(
                    &artifact,
                    &format!("{}_{}", OUTPUT_DATASET, point.tag),
                    &format!("{}_{}", DPC_DATASET, point.tag),
                    &mean,
                    &mut datasets,
                )
            })?;
            scratch.discard()?;
            reporter.report(Progress::PhaseFinish);
        }
    }

    // === Phase 3: Metadata ===
    if config.output.save_potential {
        datasets.push(POTENTIAL_DATASET.to_string());
    }
    if config.output.save_smatrix {
        datasets.push(MATRIX_DATASET.to_string());
    }
    let metadata = build_metadata(&params, &datasets);
    artifact
        .write_metadata(&metadata)
        .map_err(EngineError::store(Stage::Metadata))?;
    info!(
        path = %artifact.path().display(),
        datasets = datasets.len(),
        "Simulation finished."
    );

    Ok(SimulationResult {
        output_path: artifact.path().to_path_buf(),
        datasets,
        metadata,
    })
}

fn write_average(
    artifact: &DatasetStore,
    output_name: &str,
    dpc_name: &str,
    mean: &PhononAverage,
    datasets: &mut Vec<String>,
) -> Result<(), EngineError> {
    artifact
        .write(output_name, &mean.output)
        .map_err(EngineError::store(Stage::Output))?;
    datasets.push(output_name.to_string());
    if let Some(dpc) = &mean.dpc_com {
        artifact
            .write(dpc_name, dpc)
            .map_err(EngineError::store(Stage::Output))?;
        datasets.push(dpc_name.to_string());
    }
    Ok(())
}

fn build_metadata(params: &SimulationParameters, datasets: &[String]) -> SimulationMetadata {
    let config = params.config;
    let mut nominal = params.clone();
    nominal.set_defocus(config.optics.probe_defocus);

    SimulationMetadata {
        algorithm: config.algorithm.to_string(),
        potential_source: config.potential_source.label().to_string(),
        energy_kev: config.optics.energy_kev,
        wavelength: params.wavelength,
        num_fp: config.phonons.num_fp,
        random_seed: config.phonons.random_seed,
        probe_defocus: config.optics.probe_defocus,
        c3: config.optics.c3,
        c5: config.optics.c5,
        probe_semiangle_mrad: config.optics.probe_semiangle_mrad,
        pixel_size: config.sampling.pixel_size,
        probe_step: config.sampling.probe_step,
        interpolation_factor: config.sampling.interpolation_factor,
        matrix_refocus: config.matrix_refocus,
        datasets: datasets.to_vec(),
        aberrations: nominal.state.aberrations,
        series: config.series.as_ref().map(|series| SeriesMetadata {
            tags: series.points().into_iter().map(|p| p.tag).collect(),
            defocus: series.values().to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::store::StoreError;
    use crate::core::models::structure::Atom;
    use crate::engine::config::tests::base_builder;
    use crate::engine::config::{Algorithm, DefocusSeries};
    use crate::engine::testing::MockKernels;
    use crate::kernels::incoherent::IncoherentKernels;
    use nalgebra::{Point3, Vector3};
    use ndarray::{ArrayD, IxDyn};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn specimen() -> Structure {
        Structure::new(
            Vector3::new(3.0, 3.0, 2.0),
            vec![
                Atom::new(14, Point3::new(0.75, 0.75, 0.0)).with_thermal_sigma(0.05),
                Atom::new(14, Point3::new(2.25, 2.25, 1.0)).with_thermal_sigma(0.05),
            ],
        )
    }

    #[test]
    fn ensemble_run_writes_mean_and_metadata() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("result");
        let config = base_builder()
            .num_fp(2)
            .save_dpc_com(true)
            .output_path(output.clone())
            .build()
            .unwrap();
        let kernels = MockKernels::new();

        let result = run(&config, &specimen(), &kernels, &ProgressReporter::new()).unwrap();
        assert_eq!(result.datasets, vec!["output", "dpc_com"]);

        let store = DatasetStore::open(&output).unwrap();
        assert_eq!(
            store.read(OUTPUT_DATASET).unwrap(),
            ArrayD::from_elem(IxDyn(MockKernels::OUTPUT_SHAPE), 5.0)
        );
        let metadata: SimulationMetadata = store.read_metadata().unwrap();
        assert_eq!(metadata, result.metadata);
        assert_eq!(metadata.algorithm, "prism");
        assert!(metadata.series.is_none());
    }

    #[test]
    fn series_run_writes_one_output_per_tag_and_removes_scratch() {
        let dir = tempdir().unwrap();
        let config = base_builder()
            .num_fp(2)
            .series(Some(DefocusSeries::from_values(vec![0.0, 100.0]).unwrap()))
            .output_path(dir.path().join("series"))
            .build()
            .unwrap();
        let kernels = MockKernels::new();

        let result = run(&config, &specimen(), &kernels, &ProgressReporter::new()).unwrap();
        assert_eq!(result.datasets, vec!["output_df0000", "output_df0001"]);
        assert_eq!(kernels.potential_calls(), 2);
        assert!(!config.scratch_path().exists());

        let store = DatasetStore::open(&result.output_path).unwrap();
        assert_eq!(
            store.read("output_df0001").unwrap(),
            ArrayD::from_elem(IxDyn(MockKernels::OUTPUT_SHAPE), 105.0)
        );
        let series = result.metadata.series.unwrap();
        assert_eq!(series.tags, vec!["df0000", "df0001"]);
        assert_eq!(series.defocus, vec![0.0, 100.0]);
    }

    #[test]
    fn failed_series_leaves_no_scratch_behind() {
        let dir = tempdir().unwrap();
        let config = base_builder()
            .series(Some(DefocusSeries::from_values(vec![0.0, 1.0]).unwrap()))
            .output_path(dir.path().join("series"))
            .build()
            .unwrap();
        let kernels = MockKernels::new().failing_at(Stage::Output);

        let err = run(&config, &specimen(), &kernels, &ProgressReporter::new()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Kernel {
                stage: Stage::Output,
                ..
            }
        ));
        assert!(!config.scratch_path().exists());
    }

    #[test]
    fn invalid_configuration_fails_before_any_file_is_created() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("never");
        let mut config = base_builder().output_path(output.clone()).build().unwrap();
        config.algorithm = Algorithm::Multislice;
        config.potential_source = PotentialSource::ImportMatrix("old".into());

        let err = run(&config, &specimen(), &MockKernels::new(), &ProgressReporter::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ConfigError::Conflict(_))));
        assert!(!output.exists());
    }

    #[test]
    fn existing_user_directory_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("my_results");
        std::fs::create_dir_all(output.join("thesis")).unwrap();
        std::fs::write(output.join("thesis/chapter1.tex"), "draft").unwrap();
        let config = base_builder().output_path(output.clone()).build().unwrap();

        let err = run(&config, &specimen(), &MockKernels::new(), &ProgressReporter::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store {
                stage: Stage::Setup,
                source: StoreError::NotAStore { .. },
            }
        ));
        assert!(output.join("thesis/chapter1.tex").is_file());
    }

    #[test]
    fn foreign_scratch_directory_stops_a_series_before_output_is_replaced() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("series");
        let config = base_builder()
            .series(Some(DefocusSeries::from_values(vec![0.0, 1.0]).unwrap()))
            .output_path(output.clone())
            .build()
            .unwrap();
        std::fs::create_dir_all(config.scratch_path()).unwrap();
        std::fs::write(config.scratch_path().join("keep.txt"), "mine").unwrap();

        let err = run(&config, &specimen(), &MockKernels::new(), &ProgressReporter::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Store { stage: Stage::Setup, .. }));
        assert!(config.scratch_path().join("keep.txt").is_file());
        assert!(!output.exists());
    }

    #[test]
    fn rerun_into_a_previous_artifact_replaces_it() {
        let dir = tempdir().unwrap();
        let config = base_builder()
            .save_dpc_com(true)
            .output_path(dir.path().join("out"))
            .build()
            .unwrap();
        run(&config, &specimen(), &MockKernels::new(), &ProgressReporter::new()).unwrap();

        let mut plain = config.clone();
        plain.output.save_dpc_com = false;
        let result = run(&plain, &specimen(), &MockKernels::new(), &ProgressReporter::new()).unwrap();
        let store = DatasetStore::open(&result.output_path).unwrap();
        assert!(store.contains(OUTPUT_DATASET));
        assert!(!store.contains(DPC_DATASET));
    }

    #[test]
    fn importing_from_the_output_artifact_is_rejected_untouched() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("run");
        let first = base_builder()
            .save_potential(true)
            .output_path(output.clone())
            .build()
            .unwrap();
        run(&first, &specimen(), &MockKernels::new(), &ProgressReporter::new()).unwrap();

        let mut second = first.clone();
        second.output.save_potential = false;
        second.potential_source = PotentialSource::ImportPotential(output.join("."));
        let err = run(&second, &specimen(), &MockKernels::new(), &ProgressReporter::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ConfigError::Conflict(_))));
        assert!(DatasetStore::open(&output).unwrap().contains(POTENTIAL_DATASET));
    }

    #[test]
    fn empty_specimen_is_rejected() {
        let dir = tempdir().unwrap();
        let config = base_builder()
            .output_path(dir.path().join("out"))
            .build()
            .unwrap();
        let err = run(
            &config,
            &Structure::default(),
            &MockKernels::new(),
            &ProgressReporter::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn saved_potential_can_seed_a_later_run() {
        let dir = tempdir().unwrap();
        let first_path = dir.path().join("first");
        let first = base_builder()
            .algorithm(Algorithm::Multislice)
            .pixel_size((0.25, 0.25))
            .probe_step((0.75, 0.75))
            .potential_bound(1.0)
            .save_potential(true)
            .output_path(first_path.clone())
            .build()
            .unwrap();
        let kernels = IncoherentKernels::new(&first, &specimen()).unwrap();
        let result = run(&first, &specimen(), &kernels, &ProgressReporter::new()).unwrap();
        assert!(result.datasets.contains(&POTENTIAL_DATASET.to_string()));

        let mut second = first.clone();
        second.potential_source = PotentialSource::ImportPotential(first_path.clone());
        second.output.save_potential = false;
        second.output.path = dir.path().join("second");
        let reimported = run(&second, &specimen(), &kernels, &ProgressReporter::new()).unwrap();

        let a = DatasetStore::open(&first_path).unwrap().read(OUTPUT_DATASET).unwrap();
        let b = DatasetStore::open(&reimported.output_path)
            .unwrap()
            .read(OUTPUT_DATASET)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(reimported.metadata.potential_source, "import-potential");
    }

    #[test]
    fn progress_events_bracket_each_phase() {
        let dir = tempdir().unwrap();
        let config = base_builder()
            .num_fp(3)
            .output_path(dir.path().join("out"))
            .build()
            .unwrap();
        let events = Mutex::new(Vec::new());
        {
            let reporter = ProgressReporter::with_callback(Box::new(|event| {
                if !matches!(event, Progress::StatusUpdate { .. }) {
                    events.lock().unwrap().push(event);
                }
            }));
            run(&config, &specimen(), &MockKernels::new(), &reporter).unwrap();
        }
        let events = events.into_inner().unwrap();
        let increments = events
            .iter()
            .filter(|e| matches!(e, Progress::TaskIncrement))
            .count();
        assert_eq!(increments, 3);
        assert_eq!(events.first(), Some(&Progress::PhaseStart { name: "Setup" }));
        assert_eq!(events.last(), Some(&Progress::PhaseFinish));
    }
}
