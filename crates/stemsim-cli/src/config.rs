mod defaults;

use crate::cli::SimulateArgs;
use crate::error::{CliError, Result};
use defaults::DefaultsConfig;
use rand::Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use stemsim::core::optics::aberration::read_aberrations_from_path;
use stemsim::engine::config::{
    self as core_config, Algorithm, DefocusSeries, PotentialSource, SimulationConfigBuilder,
};
use stemsim::engine::ensemble::MAX_PHONON_SEED;
use stemsim::engine::error::EngineError;
use tracing::{debug, info};

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialOpticsConfig {
    energy_kev: Option<f64>,
    probe_defocus: Option<f64>,
    c3: Option<f64>,
    c5: Option<f64>,
    probe_semiangle: Option<f64>,
    aberrations_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialSamplingConfig {
    pixel_size: Option<[f64; 2]>,
    probe_step: Option<[f64; 2]>,
    potential_bound: Option<f64>,
    interpolation_factor: Option<[usize; 2]>,
    tile: Option<[usize; 3]>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialPhononConfig {
    num_fp: Option<usize>,
    random_seed: Option<u64>,
    thermal_effects: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialPipelineConfig {
    import_potential: Option<PathBuf>,
    import_smatrix: Option<PathBuf>,
    matrix_refocus: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct PartialSeriesConfig {
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
    values: Option<Vec<f64>>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialOutputConfig {
    save_dpc_com: Option<bool>,
    save_potential: Option<bool>,
    save_smatrix: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialSimulationConfig {
    algorithm: Option<String>,
    optics: Option<PartialOpticsConfig>,
    sampling: Option<PartialSamplingConfig>,
    phonons: Option<PartialPhononConfig>,
    pipeline: Option<PartialPipelineConfig>,
    series: Option<PartialSeriesConfig>,
    output: Option<PartialOutputConfig>,
}

/// A fully merged run description.
#[derive(Debug)]
pub struct ResolvedSimulation {
    pub config: core_config::SimulationConfig,
    /// Replication of the specimen cell along x, y and z.
    pub tile: [usize; 3],
}

impl PartialSimulationConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    pub fn merge_with_cli(mut self, args: &SimulateArgs) -> Result<ResolvedSimulation> {
        self.apply_set_values(&args.set_values)?;
        let defaults = DefaultsConfig::default();

        let optics = self.optics.take().unwrap_or_default();
        let sampling = self.sampling.take().unwrap_or_default();
        let phonons = self.phonons.take().unwrap_or_default();
        let pipeline = self.pipeline.take().unwrap_or_default();
        let output = self.output.take().unwrap_or_default();

        let algorithm: Algorithm = args
            .algorithm
            .as_deref()
            .or(self.algorithm.as_deref())
            .unwrap_or(defaults.algorithm)
            .parse()
            .map_err(|e: core_config::ConfigError| CliError::Config(e.to_string()))?;

        let aberrations = match args.aberrations.as_ref().or(optics.aberrations_file.as_ref()) {
            Some(path) => {
                info!("Reading aberrations from {:?}", path);
                read_aberrations_from_path(path).map_err(EngineError::from)?
            }
            None => Vec::new(),
        };

        let random_seed = args.seed.or(phonons.random_seed).unwrap_or_else(|| {
            let seed = rand::thread_rng().gen_range(0..MAX_PHONON_SEED);
            info!("No random seed given, using {}.", seed);
            seed
        });

        let source = Self::merge_potential_source(args, &pipeline)?;
        let series = Self::merge_series(args.defocus_series.as_deref(), self.series.take())?;

        let pixel_size = sampling.pixel_size.unwrap_or(defaults.pixel_size);
        let probe_step = sampling.probe_step.unwrap_or(defaults.probe_step);
        let interpolation = sampling
            .interpolation_factor
            .unwrap_or(defaults.interpolation_factor);

        let builder = SimulationConfigBuilder::new()
            .algorithm(algorithm)
            .potential_source(source)
            .matrix_refocus(args.matrix_refocus || pipeline.matrix_refocus.unwrap_or(false))
            .energy_kev(
                args.energy
                    .or(optics.energy_kev)
                    .unwrap_or(defaults.energy_kev),
            )
            .probe_defocus(args.probe_defocus.or(optics.probe_defocus).unwrap_or(0.0))
            .c3(args.c3.or(optics.c3).unwrap_or(0.0))
            .c5(args.c5.or(optics.c5).unwrap_or(0.0))
            .probe_semiangle_mrad(
                optics
                    .probe_semiangle
                    .unwrap_or(defaults.probe_semiangle_mrad),
            )
            .aberrations(aberrations)
            .pixel_size((pixel_size[0], pixel_size[1]))
            .probe_step((probe_step[0], probe_step[1]))
            .potential_bound(sampling.potential_bound.unwrap_or(defaults.potential_bound))
            .interpolation_factor((interpolation[0], interpolation[1]))
            .num_fp(args.num_fp.or(phonons.num_fp).unwrap_or(defaults.num_fp))
            .random_seed(random_seed)
            .include_thermal_effects(if args.no_thermal_effects {
                false
            } else {
                phonons
                    .thermal_effects
                    .unwrap_or(defaults.include_thermal_effects)
            })
            .series(series)
            .output_path(args.output.clone())
            .save_dpc_com(args.save_dpc_com || output.save_dpc_com.unwrap_or(false))
            .save_potential(args.save_potential || output.save_potential.unwrap_or(false))
            .save_smatrix(args.save_smatrix || output.save_smatrix.unwrap_or(false));

        let config = builder
            .build()
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(ResolvedSimulation {
            config,
            tile: sampling.tile.unwrap_or(defaults.tile),
        })
    }

    fn merge_potential_source(
        args: &SimulateArgs,
        file: &PartialPipelineConfig,
    ) -> Result<PotentialSource> {
        if let Some(path) = &args.import.import_potential {
            return Ok(PotentialSource::ImportPotential(path.clone()));
        }
        if let Some(path) = &args.import.import_smatrix {
            return Ok(PotentialSource::ImportMatrix(path.clone()));
        }
        match (&file.import_potential, &file.import_smatrix) {
            (Some(_), Some(_)) => Err(CliError::Config(
                "`pipeline.import-potential` and `pipeline.import-smatrix` are mutually exclusive"
                    .to_string(),
            )),
            (Some(path), None) => Ok(PotentialSource::ImportPotential(path.clone())),
            (None, Some(path)) => Ok(PotentialSource::ImportMatrix(path.clone())),
            (None, None) => Ok(PotentialSource::ComputeFromStructure),
        }
    }

    fn merge_series(
        cli_range: Option<&str>,
        file: Option<PartialSeriesConfig>,
    ) -> Result<Option<DefocusSeries>> {
        let to_config_error = |e: core_config::ConfigError| CliError::Config(e.to_string());

        if let Some(range) = cli_range {
            let (min, max, step) = parse_series_range(range)?;
            return DefocusSeries::from_range(min, max, step)
                .map(Some)
                .map_err(to_config_error);
        }
        let Some(file) = file else {
            return Ok(None);
        };
        match (file.values, file.min, file.max, file.step) {
            (Some(values), None, None, None) => DefocusSeries::from_values(values)
                .map(Some)
                .map_err(to_config_error),
            (None, Some(min), Some(max), Some(step)) => DefocusSeries::from_range(min, max, step)
                .map(Some)
                .map_err(to_config_error),
            (Some(_), ..) => Err(CliError::Config(
                "`series` takes either `values` or `min`/`max`/`step`, not both".to_string(),
            )),
            _ => Err(CliError::Config(
                "`series` requires all of `min`, `max` and `step`".to_string(),
            )),
        }
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value_str)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };

            match key {
                "algorithm" => self.algorithm = Some(value_str.to_string()),
                "optics.energy-kev" => {
                    self.optics.get_or_insert_with(Default::default).energy_kev =
                        Some(parse_value(key, value_str)?);
                }
                "optics.probe-defocus" => {
                    self.optics.get_or_insert_with(Default::default).probe_defocus =
                        Some(parse_value(key, value_str)?);
                }
                "optics.c3" => {
                    self.optics.get_or_insert_with(Default::default).c3 =
                        Some(parse_value(key, value_str)?);
                }
                "optics.c5" => {
                    self.optics.get_or_insert_with(Default::default).c5 =
                        Some(parse_value(key, value_str)?);
                }
                "optics.probe-semiangle" => {
                    self.optics
                        .get_or_insert_with(Default::default)
                        .probe_semiangle = Some(parse_value(key, value_str)?);
                }
                "sampling.potential-bound" => {
                    self.sampling
                        .get_or_insert_with(Default::default)
                        .potential_bound = Some(parse_value(key, value_str)?);
                }
                "phonons.num-fp" => {
                    self.phonons.get_or_insert_with(Default::default).num_fp =
                        Some(parse_value(key, value_str)?);
                }
                "phonons.random-seed" => {
                    self.phonons.get_or_insert_with(Default::default).random_seed =
                        Some(parse_value(key, value_str)?);
                }
                "phonons.thermal-effects" => {
                    self.phonons
                        .get_or_insert_with(Default::default)
                        .thermal_effects = Some(parse_value(key, value_str)?);
                }
                "pipeline.matrix-refocus" => {
                    self.pipeline
                        .get_or_insert_with(Default::default)
                        .matrix_refocus = Some(parse_value(key, value_str)?);
                }
                "output.save-dpc-com" => {
                    self.output.get_or_insert_with(Default::default).save_dpc_com =
                        Some(parse_value(key, value_str)?);
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        CliError::Config(format!(
            "Invalid {} value for {}: {}",
            std::any::type_name::<T>(),
            key,
            value
        ))
    })
}

fn parse_series_range(range: &str) -> Result<(f64, f64, f64)> {
    let parts: Vec<&str> = range.split(':').collect();
    let [min, max, step] = parts.as_slice() else {
        return Err(CliError::Argument(format!(
            "Invalid defocus series '{}'. Expected MIN:MAX:STEP.",
            range
        )));
    };
    let parse = |s: &str| {
        s.trim().parse::<f64>().map_err(|_| {
            CliError::Argument(format!("Invalid number '{}' in defocus series", s))
        })
    };
    Ok((parse(min)?, parse(max)?, parse(step)?))
}
