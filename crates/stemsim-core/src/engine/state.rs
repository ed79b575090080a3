use super::config::{SeriesPoint, SimulationConfig};
use super::error::EngineError;
use super::kernels::FrozenPhononResult;
use crate::core::models::structure::Structure;
use crate::core::optics::aberration::{Aberration, normalize_and_override};
use crate::core::optics::probe::electron_wavelength;
use ndarray::ArrayD;

/// Mutable per-iteration state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub phonon_index: usize,
    pub phonon_seed: u64,
    /// Tag of the current series point; `None` outside a series.
    pub current_tag: Option<String>,
    pub probe_defocus: f64,
    /// Normalized aberration terms for the current working defocus.
    pub aberrations: Vec<Aberration>,
}

/// Everything one simulation run reads, plus the state it mutates.
///
/// The configuration and structure are borrowed for the lifetime of the run
/// and never change; only [`RunState`] is updated between iterations.
#[derive(Debug, Clone)]
pub struct SimulationParameters<'a> {
    pub config: &'a SimulationConfig,
    pub structure: &'a Structure,
    pub wavelength: f64,
    pub state: RunState,
}

impl<'a> SimulationParameters<'a> {
    pub fn new(config: &'a SimulationConfig, structure: &'a Structure) -> Self {
        let wavelength = electron_wavelength(config.optics.energy_kev);
        let probe_defocus = config.optics.probe_defocus;
        let mut params = Self {
            config,
            structure,
            wavelength,
            state: RunState {
                phonon_index: 0,
                phonon_seed: config.phonons.random_seed,
                current_tag: None,
                probe_defocus,
                aberrations: Vec::new(),
            },
        };
        params.set_defocus(probe_defocus);
        params
    }

    pub fn begin_phonon(&mut self, index: usize, seed: u64) {
        self.state.phonon_index = index;
        self.state.phonon_seed = seed;
    }

    /// Sets the working defocus and re-derives the aberration list from the
    /// configured base terms, so overrides never compound across points.
    pub fn set_defocus(&mut self, defocus: f64) {
        let optics = &self.config.optics;
        self.state.probe_defocus = defocus;
        self.state.aberrations = normalize_and_override(
            optics.aberrations.clone(),
            defocus,
            optics.c3,
            optics.c5,
            self.wavelength,
        );
    }

    pub fn enter_series_point(&mut self, point: &SeriesPoint) {
        self.state.current_tag = Some(point.tag.clone());
        self.set_defocus(point.defocus);
    }
}

/// Incoherent mean over frozen-phonon realizations.
#[derive(Debug, Clone, PartialEq)]
pub struct PhononAverage {
    pub output: ArrayD<f64>,
    pub dpc_com: Option<ArrayD<f64>>,
}

/// Running sum of frozen-phonon realizations, owned and passed by value.
#[derive(Debug, Clone, Default)]
pub struct EnsembleAccumulator {
    output: Option<ArrayD<f64>>,
    dpc_com: Option<ArrayD<f64>>,
    realizations: usize,
}

impl EnsembleAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn realizations(&self) -> usize {
        self.realizations
    }

    /// Adds one realization. The first one is taken as is.
    pub fn fold(mut self, result: FrozenPhononResult) -> Result<Self, EngineError> {
        match self.output.as_mut() {
            None => {
                self.output = Some(result.output);
                self.dpc_com = result.dpc_com;
            }
            Some(sum) => {
                add_into(sum, &result.output)?;
                match (self.dpc_com.as_mut(), result.dpc_com.as_ref()) {
                    (Some(sum), Some(dpc)) => add_into(sum, dpc)?,
                    (None, None) => {}
                    _ => {
                        return Err(EngineError::Internal(
                            "DPC-CoM output appeared or vanished between realizations".to_string(),
                        ));
                    }
                }
            }
        }
        self.realizations += 1;
        Ok(self)
    }

    /// Divides the sums by the number of folded realizations; `None` if empty.
    pub fn into_mean(self) -> Option<PhononAverage> {
        let count = self.realizations as f64;
        let output = self.output?;
        Some(PhononAverage {
            output: output / count,
            dpc_com: self.dpc_com.map(|dpc| dpc / count),
        })
    }
}

pub(crate) fn add_into(sum: &mut ArrayD<f64>, value: &ArrayD<f64>) -> Result<(), EngineError> {
    if sum.shape() != value.shape() {
        return Err(EngineError::ShapeMismatch {
            expected: sum.shape().to_vec(),
            found: value.shape().to_vec(),
        });
    }
    *sum += value;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::tests::base_builder;
    use crate::core::optics::aberration::Aberration;
    use ndarray::{ArrayD, IxDyn};
    use std::f64::consts::PI;

    fn constant(shape: &[usize], value: f64) -> ArrayD<f64> {
        ArrayD::from_elem(IxDyn(shape), value)
    }

    #[test]
    fn single_realization_is_bit_identical() {
        let output = ArrayD::from_shape_fn(IxDyn(&[3, 2, 1]), |ix| {
            0.1 * ix[0] as f64 + 1.0 / 3.0 + ix[1] as f64
        });
        let dpc = constant(&[3, 2, 2], 0.7);
        let mean = EnsembleAccumulator::new()
            .fold(FrozenPhononResult::new(output.clone(), Some(dpc.clone())))
            .unwrap()
            .into_mean()
            .unwrap();
        assert_eq!(mean.output, output);
        assert_eq!(mean.dpc_com, Some(dpc));
    }

    #[test]
    fn constant_realizations_average_to_the_constant() {
        let mut acc = EnsembleAccumulator::new();
        for _ in 0..4 {
            acc = acc
                .fold(FrozenPhononResult::new(constant(&[2, 2], 1.5), None))
                .unwrap();
        }
        assert_eq!(acc.realizations(), 4);
        let mean = acc.into_mean().unwrap();
        assert_eq!(mean.output, constant(&[2, 2], 1.5));
        assert!(mean.dpc_com.is_none());
    }

    #[test]
    fn mean_is_linear_over_realizations() {
        let acc = EnsembleAccumulator::new()
            .fold(FrozenPhononResult::new(constant(&[2], 1.0), Some(constant(&[2], 2.0))))
            .unwrap()
            .fold(FrozenPhononResult::new(constant(&[2], 3.0), Some(constant(&[2], 6.0))))
            .unwrap();
        let mean = acc.into_mean().unwrap();
        assert_eq!(mean.output, constant(&[2], 2.0));
        assert_eq!(mean.dpc_com, Some(constant(&[2], 4.0)));
    }

    #[test]
    fn shape_change_between_realizations_is_rejected() {
        let result = EnsembleAccumulator::new()
            .fold(FrozenPhononResult::new(constant(&[2, 2], 1.0), None))
            .unwrap()
            .fold(FrozenPhononResult::new(constant(&[2, 3], 1.0), None));
        assert!(matches!(
            result,
            Err(EngineError::ShapeMismatch { expected, found })
                if expected == vec![2, 2] && found == vec![2, 3]
        ));
    }

    #[test]
    fn empty_accumulator_has_no_mean() {
        assert!(EnsembleAccumulator::new().into_mean().is_none());
    }

    #[test]
    fn set_defocus_rederives_from_base_terms() {
        let config = base_builder()
            .aberrations(vec![Aberration::new(0, 2, 5.0, 30.0), Aberration::new(2, 2, 1.0, 0.0)])
            .build()
            .unwrap();
        let structure = Structure::default();
        let mut params = SimulationParameters::new(&config, &structure);
        assert_eq!(params.state.aberrations[0], Aberration::new(0, 2, 5.0, 30.0));

        params.set_defocus(100.0);
        let c1 = params.state.aberrations[0];
        assert!((c1.magnitude - 100.0 * PI / params.wavelength).abs() < 1e-9);
        assert_eq!(c1.angle, 0.0);

        params.set_defocus(0.0);
        assert_eq!(params.state.aberrations[0], Aberration::new(0, 2, 5.0, 30.0));
        assert_eq!(params.state.aberrations.len(), 2);
    }

    #[test]
    fn entering_a_series_point_sets_tag_and_defocus() {
        let config = base_builder().build().unwrap();
        let structure = Structure::default();
        let mut params = SimulationParameters::new(&config, &structure);
        params.enter_series_point(&SeriesPoint {
            tag: "df0003".into(),
            defocus: -50.0,
        });
        assert_eq!(params.state.current_tag.as_deref(), Some("df0003"));
        assert_eq!(params.state.probe_defocus, -50.0);
        assert_eq!(params.state.aberrations.len(), 1);
    }
}
