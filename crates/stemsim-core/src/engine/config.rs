use crate::core::optics::aberration::Aberration;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const SCRATCH_SUFFIX: &str = "scratch";

/// Upper bound on the number of points a defocus range may expand to.
pub const MAX_SERIES_POINTS: usize = 10_000;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue {
        parameter: &'static str,
        reason: String,
    },

    #[error("Conflicting settings: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    Multislice,
    Prism,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Multislice => write!(f, "multislice"),
            Algorithm::Prism => write!(f, "prism"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multislice" | "m" => Ok(Algorithm::Multislice),
            "prism" | "p" => Ok(Algorithm::Prism),
            other => Err(ConfigError::InvalidValue {
                parameter: "algorithm",
                reason: format!("unknown algorithm '{}', expected 'prism' or 'multislice'", other),
            }),
        }
    }
}

/// Where the pipeline obtains the potential and, for PRISM, the scattering matrix.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "kebab-case")]
pub enum PotentialSource {
    #[default]
    ComputeFromStructure,
    ImportPotential(PathBuf),
    ImportMatrix(PathBuf),
}

impl PotentialSource {
    pub fn label(&self) -> &'static str {
        match self {
            PotentialSource::ComputeFromStructure => "compute-from-structure",
            PotentialSource::ImportPotential(_) => "import-potential",
            PotentialSource::ImportMatrix(_) => "import-matrix",
        }
    }

    /// Artifact an import reads from.
    pub fn path(&self) -> Option<&Path> {
        match self {
            PotentialSource::ComputeFromStructure => None,
            PotentialSource::ImportPotential(path) | PotentialSource::ImportMatrix(path) => {
                Some(path)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpticsConfig {
    pub energy_kev: f64,
    pub probe_defocus: f64,
    pub c3: f64,
    pub c5: f64,
    pub probe_semiangle_mrad: f64,
    pub aberrations: Vec<Aberration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// Potential pixel size `(y, x)` in Angstroms.
    pub pixel_size: (f64, f64),
    /// Probe scan step `(y, x)` in Angstroms.
    pub probe_step: (f64, f64),
    pub potential_bound: f64,
    /// PRISM interpolation factor `(y, x)`.
    pub interpolation_factor: (usize, usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhononConfig {
    pub num_fp: usize,
    pub random_seed: u64,
    pub include_thermal_effects: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub tag: String,
    pub defocus: f64,
}

/// A sweep of probe defocus values, each producing its own averaged output.
#[derive(Debug, Clone, PartialEq)]
pub struct DefocusSeries {
    values: Vec<f64>,
}

impl DefocusSeries {
    pub fn from_values(values: Vec<f64>) -> Result<Self, ConfigError> {
        if values.is_empty() {
            return Err(ConfigError::InvalidValue {
                parameter: "series",
                reason: "a defocus series needs at least one value".to_string(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidValue {
                parameter: "series",
                reason: "defocus values must be finite".to_string(),
            });
        }
        Ok(Self { values })
    }

    /// Inclusive range `min, min + step, ...` up to `max`.
    pub fn from_range(min: f64, max: f64, step: f64) -> Result<Self, ConfigError> {
        if !(step > 0.0) || !step.is_finite() {
            return Err(ConfigError::InvalidValue {
                parameter: "series.step",
                reason: format!("step must be positive, got {}", step),
            });
        }
        if !(max >= min) {
            return Err(ConfigError::InvalidValue {
                parameter: "series.max",
                reason: format!("max ({}) must not be below min ({})", max, min),
            });
        }
        let intervals = ((max - min) / step + 1e-9).floor();
        if !intervals.is_finite() || intervals >= MAX_SERIES_POINTS as f64 {
            return Err(ConfigError::InvalidValue {
                parameter: "series.step",
                reason: format!(
                    "{}:{}:{} expands to more than {} defocus values",
                    min, max, step, MAX_SERIES_POINTS
                ),
            });
        }
        let count = intervals as usize + 1;
        Self::from_values((0..count).map(|i| min + i as f64 * step).collect())
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Series points with stable tags `df0000`, `df0001`, ...
    pub fn points(&self) -> Vec<SeriesPoint> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, &defocus)| SeriesPoint {
                tag: format!("df{:04}", i),
                defocus,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub save_dpc_com: bool,
    pub save_potential: bool,
    pub save_smatrix: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub algorithm: Algorithm,
    pub potential_source: PotentialSource,
    pub matrix_refocus: bool,
    pub optics: OpticsConfig,
    pub sampling: SamplingConfig,
    pub phonons: PhononConfig,
    pub series: Option<DefocusSeries>,
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Location of the out-of-core accumulator used by a defocus series.
    pub fn scratch_path(&self) -> PathBuf {
        let mut name = self
            .output
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "output".into());
        name.push(".");
        name.push(SCRATCH_SUFFIX);
        self.output.path.with_file_name(name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |parameter: &'static str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    parameter,
                    reason: format!("must be a positive number, got {}", value),
                })
            }
        };

        positive("optics.energy-kev", self.optics.energy_kev)?;
        positive("optics.probe-semiangle", self.optics.probe_semiangle_mrad)?;
        positive("sampling.pixel-size (y)", self.sampling.pixel_size.0)?;
        positive("sampling.pixel-size (x)", self.sampling.pixel_size.1)?;
        positive("sampling.probe-step (y)", self.sampling.probe_step.0)?;
        positive("sampling.probe-step (x)", self.sampling.probe_step.1)?;
        positive("sampling.potential-bound", self.sampling.potential_bound)?;

        for (parameter, value) in [
            ("optics.probe-defocus", self.optics.probe_defocus),
            ("optics.c3", self.optics.c3),
            ("optics.c5", self.optics.c5),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidValue {
                    parameter,
                    reason: "must be finite".to_string(),
                });
            }
        }

        if self.sampling.interpolation_factor.0 == 0 || self.sampling.interpolation_factor.1 == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "sampling.interpolation-factor",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.phonons.num_fp == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "phonons.num-fp",
                reason: "at least one frozen phonon configuration is required".to_string(),
            });
        }

        if self.algorithm == Algorithm::Multislice {
            if matches!(self.potential_source, PotentialSource::ImportMatrix(_)) {
                return Err(ConfigError::Conflict(
                    "a scattering matrix cannot be imported for a multislice simulation".to_string(),
                ));
            }
            if self.matrix_refocus {
                return Err(ConfigError::Conflict(
                    "matrix refocus only applies to the PRISM algorithm".to_string(),
                ));
            }
            if self.output.save_smatrix {
                return Err(ConfigError::Conflict(
                    "a multislice simulation has no scattering matrix to save".to_string(),
                ));
            }
        }
        if self.output.save_potential
            && matches!(self.potential_source, PotentialSource::ImportMatrix(_))
        {
            return Err(ConfigError::Conflict(
                "no potential is calculated when the scattering matrix is imported".to_string(),
            ));
        }

        if let Some(source) = self.potential_source.path() {
            let mut replaced = vec![("output", self.output.path.clone())];
            if self.series.is_some() {
                replaced.push(("series scratch", self.scratch_path()));
            }
            for (role, path) in replaced {
                if same_location(source, &path) {
                    return Err(ConfigError::Conflict(format!(
                        "cannot import from '{}' because it is also the {} location",
                        source.display(),
                        role
                    )));
                }
            }
        }
        Ok(())
    }
}

fn same_location(a: &Path, b: &Path) -> bool {
    normalized(a) == normalized(b)
}

/// Resolves symlinks when the path exists, otherwise removes `.` and `..`
/// lexically from its absolute form.
fn normalized(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other),
        }
    }
    clean
}

#[derive(Default)]
pub struct SimulationConfigBuilder {
    algorithm: Option<Algorithm>,
    potential_source: Option<PotentialSource>,
    matrix_refocus: Option<bool>,
    energy_kev: Option<f64>,
    probe_defocus: Option<f64>,
    c3: Option<f64>,
    c5: Option<f64>,
    probe_semiangle_mrad: Option<f64>,
    aberrations: Option<Vec<Aberration>>,
    pixel_size: Option<(f64, f64)>,
    probe_step: Option<(f64, f64)>,
    potential_bound: Option<f64>,
    interpolation_factor: Option<(usize, usize)>,
    num_fp: Option<usize>,
    random_seed: Option<u64>,
    include_thermal_effects: Option<bool>,
    series: Option<DefocusSeries>,
    output_path: Option<PathBuf>,
    save_dpc_com: Option<bool>,
    save_potential: Option<bool>,
    save_smatrix: Option<bool>,
}

impl SimulationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }
    pub fn potential_source(mut self, source: PotentialSource) -> Self {
        self.potential_source = Some(source);
        self
    }
    pub fn matrix_refocus(mut self, refocus: bool) -> Self {
        self.matrix_refocus = Some(refocus);
        self
    }
    pub fn energy_kev(mut self, energy: f64) -> Self {
        self.energy_kev = Some(energy);
        self
    }
    pub fn probe_defocus(mut self, defocus: f64) -> Self {
        self.probe_defocus = Some(defocus);
        self
    }
    pub fn c3(mut self, c3: f64) -> Self {
        self.c3 = Some(c3);
        self
    }
    pub fn c5(mut self, c5: f64) -> Self {
        self.c5 = Some(c5);
        self
    }
    pub fn probe_semiangle_mrad(mut self, semiangle: f64) -> Self {
        self.probe_semiangle_mrad = Some(semiangle);
        self
    }
    pub fn aberrations(mut self, aberrations: Vec<Aberration>) -> Self {
        self.aberrations = Some(aberrations);
        self
    }
    pub fn pixel_size(mut self, pixel_size: (f64, f64)) -> Self {
        self.pixel_size = Some(pixel_size);
        self
    }
    pub fn probe_step(mut self, step: (f64, f64)) -> Self {
        self.probe_step = Some(step);
        self
    }
    pub fn potential_bound(mut self, bound: f64) -> Self {
        self.potential_bound = Some(bound);
        self
    }
    pub fn interpolation_factor(mut self, factor: (usize, usize)) -> Self {
        self.interpolation_factor = Some(factor);
        self
    }
    pub fn num_fp(mut self, n: usize) -> Self {
        self.num_fp = Some(n);
        self
    }
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }
    pub fn include_thermal_effects(mut self, include: bool) -> Self {
        self.include_thermal_effects = Some(include);
        self
    }
    pub fn series(mut self, series: Option<DefocusSeries>) -> Self {
        self.series = series;
        self
    }
    pub fn output_path(mut self, path: PathBuf) -> Self {
        self.output_path = Some(path);
        self
    }
    pub fn save_dpc_com(mut self, save: bool) -> Self {
        self.save_dpc_com = Some(save);
        self
    }
    pub fn save_potential(mut self, save: bool) -> Self {
        self.save_potential = Some(save);
        self
    }
    pub fn save_smatrix(mut self, save: bool) -> Self {
        self.save_smatrix = Some(save);
        self
    }

    pub fn build(self) -> Result<SimulationConfig, ConfigError> {
        let optics = OpticsConfig {
            energy_kev: self
                .energy_kev
                .ok_or(ConfigError::MissingParameter("energy_kev"))?,
            probe_defocus: self.probe_defocus.unwrap_or(0.0),
            c3: self.c3.unwrap_or(0.0),
            c5: self.c5.unwrap_or(0.0),
            probe_semiangle_mrad: self
                .probe_semiangle_mrad
                .ok_or(ConfigError::MissingParameter("probe_semiangle_mrad"))?,
            aberrations: self.aberrations.unwrap_or_default(),
        };
        let sampling = SamplingConfig {
            pixel_size: self
                .pixel_size
                .ok_or(ConfigError::MissingParameter("pixel_size"))?,
            probe_step: self
                .probe_step
                .ok_or(ConfigError::MissingParameter("probe_step"))?,
            potential_bound: self
                .potential_bound
                .ok_or(ConfigError::MissingParameter("potential_bound"))?,
            interpolation_factor: self.interpolation_factor.unwrap_or((1, 1)),
        };
        let phonons = PhononConfig {
            num_fp: self.num_fp.ok_or(ConfigError::MissingParameter("num_fp"))?,
            random_seed: self
                .random_seed
                .ok_or(ConfigError::MissingParameter("random_seed"))?,
            include_thermal_effects: self.include_thermal_effects.unwrap_or(true),
        };
        let output = OutputConfig {
            path: self
                .output_path
                .ok_or(ConfigError::MissingParameter("output_path"))?,
            save_dpc_com: self.save_dpc_com.unwrap_or(false),
            save_potential: self.save_potential.unwrap_or(false),
            save_smatrix: self.save_smatrix.unwrap_or(false),
        };

        let config = SimulationConfig {
            algorithm: self
                .algorithm
                .ok_or(ConfigError::MissingParameter("algorithm"))?,
            potential_source: self.potential_source.unwrap_or_default(),
            matrix_refocus: self.matrix_refocus.unwrap_or(false),
            optics,
            sampling,
            phonons,
            series: self.series,
            output,
        };
        config.validate()?;
        Ok(config)
    }
}
