use crate::core::io::store::DatasetStore;
use crate::core::models::structure::Structure;
use crate::core::optics::probe::FrequencyGrid;
use crate::engine::config::{Algorithm, SimulationConfig};
use crate::engine::kernels::{FrozenPhononResult, KernelError, OutputRequest, SimulationKernels};
use crate::engine::pipeline::{MATRIX_DATASET, POTENTIAL_DATASET};
use ndarray::{Array2, Array3, ArrayD, Ix2};
use num_complex::Complex64;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;
use std::path::Path;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Real-space half-width of the probe window in Angstroms.
const PROBE_WINDOW_RADIUS: f64 = 4.0;
/// Exponent of the Z-contrast weighting of each atom.
const Z_CONTRAST_EXPONENT: f64 = 1.7;
const MIN_WINDOW_PIXELS: usize = 4;

/// Compact stand-in for a PRISM scattering matrix: the potential it was built
/// from plus the focal plane it was last refocused to.
///
/// The focal plane is subtracted from the probe defocus carried by the
/// aberration surface, so a matrix refocused to the working defocus images as
/// an in-focus probe.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactMatrix {
    pub potential: Array2<f64>,
    pub focal_plane: f64,
}

/// Reference kernel set based on incoherent imaging.
///
/// The potential is a sum of projected Gaussians weighted by `Z^1.7`; each
/// frozen phonon displaces atoms by a seeded normal draw of their thermal
/// sigma. The image at a probe position is the probe intensity convolved with
/// the potential, and the DPC signal is the centre of mass of that product.
/// PRISM samples the probe on a grid coarsened by the interpolation factor.
#[derive(Debug, Clone)]
pub struct IncoherentKernels {
    grid_shape: (usize, usize),
    pixel_size: (f64, f64),
    probe_step: (f64, f64),
    scan_shape: (usize, usize),
    potential_bound: f64,
    include_thermal_effects: bool,
    semiangle: f64,
    multislice_grid: FrequencyGrid,
    prism_grid: FrequencyGrid,
}

impl IncoherentKernels {
    pub fn new(config: &SimulationConfig, structure: &Structure) -> Result<Self, KernelError> {
        let cell = structure.cell_dimensions();
        if !(cell.x > 0.0 && cell.y > 0.0) {
            return Err(KernelError::new(format!(
                "cell dimensions must be positive, got {} x {} Angstroms",
                cell.x, cell.y
            )));
        }
        let sampling = &config.sampling;
        let pixel_size = sampling.pixel_size;
        let grid_shape = (
            pixels_across(cell.y, pixel_size.0),
            pixels_across(cell.x, pixel_size.1),
        );
        let scan_shape = (
            ((cell.y / sampling.probe_step.0).floor() as usize).max(1),
            ((cell.x / sampling.probe_step.1).floor() as usize).max(1),
        );

        let coarse_pixel = (
            pixel_size.0 * sampling.interpolation_factor.0 as f64,
            pixel_size.1 * sampling.interpolation_factor.1 as f64,
        );
        let multislice_grid = FrequencyGrid::new(
            (
                window_pixels(pixel_size.0, grid_shape.0),
                window_pixels(pixel_size.1, grid_shape.1),
            ),
            pixel_size,
        );
        let prism_grid = FrequencyGrid::new(
            (
                window_pixels(coarse_pixel.0, pixels_across(cell.y, coarse_pixel.0)),
                window_pixels(coarse_pixel.1, pixels_across(cell.x, coarse_pixel.1)),
            ),
            coarse_pixel,
        );

        debug!(
            ?grid_shape,
            ?scan_shape,
            probe_window = ?multislice_grid.shape(),
            prism_window = ?prism_grid.shape(),
            "Incoherent kernels initialized."
        );

        Ok(Self {
            grid_shape,
            pixel_size,
            probe_step: sampling.probe_step,
            scan_shape,
            potential_bound: sampling.potential_bound,
            include_thermal_effects: config.phonons.include_thermal_effects,
            semiangle: config.optics.probe_semiangle_mrad * 1e-3,
            multislice_grid,
            prism_grid,
        })
    }

    pub fn grid_shape(&self) -> (usize, usize) {
        self.grid_shape
    }

    pub fn scan_shape(&self) -> (usize, usize) {
        self.scan_shape
    }

    fn read_grid_dataset(&self, artifact: &Path, name: &str) -> Result<Array2<f64>, KernelError> {
        let data = DatasetStore::open(artifact)
            .and_then(|store| store.read(name))
            .map_err(|e| {
                KernelError::with_source(
                    format!("failed to import '{}' from '{}'", name, artifact.display()),
                    e,
                )
            })?;
        let data = data.into_dimensionality::<Ix2>().map_err(|e| {
            KernelError::with_source(format!("dataset '{}' is not two-dimensional", name), e)
        })?;
        if data.dim() != self.grid_shape {
            return Err(KernelError::new(format!(
                "imported '{}' has shape {:?}, but the specimen grid is {:?}",
                name,
                data.dim(),
                self.grid_shape
            )));
        }
        Ok(data)
    }

    fn image(
        &self,
        potential: &Array2<f64>,
        grid: &FrequencyGrid,
        request: &OutputRequest<'_>,
        focal_plane: f64,
    ) -> Result<FrozenPhononResult, KernelError> {
        let probe = probe_intensity(grid, request, self.semiangle, focal_plane)?;
        let (wy, wx) = probe.dim();
        let window_pixel = grid.pixel_size();
        let offsets: Vec<(f64, f64, f64)> = probe
            .indexed_iter()
            .filter(|(_, weight)| **weight > 0.0)
            .map(|((j, i), &weight)| {
                (
                    weight,
                    (j as f64 - (wy / 2) as f64) * window_pixel.0,
                    (i as f64 - (wx / 2) as f64) * window_pixel.1,
                )
            })
            .collect();

        let (sy, sx) = self.scan_shape;
        let positions: Vec<(usize, usize)> = (0..sy)
            .flat_map(|j| (0..sx).map(move |i| (j, i)))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let iterator = positions.iter();

        #[cfg(feature = "parallel")]
        let iterator = positions.par_iter();

        let signals: Vec<(f64, f64, f64)> = iterator
            .map(|&(j, i)| {
                let origin = (j as f64 * self.probe_step.0, i as f64 * self.probe_step.1);
                self.probe_signal(potential, origin, &offsets)
            })
            .collect();

        let output = Array3::from_shape_fn((sy, sx, 1), |(j, i, _)| signals[j * sx + i].0);
        let dpc_com = request.include_dpc_com.then(|| {
            Array3::from_shape_fn((sy, sx, 2), |(j, i, k)| {
                let (_, com_x, com_y) = signals[j * sx + i];
                if k == 0 { com_x } else { com_y }
            })
            .into_dyn()
        });
        Ok(FrozenPhononResult::new(output.into_dyn(), dpc_com))
    }

    /// Returns `(intensity, com_x, com_y)` for a probe centred at `origin`.
    fn probe_signal(
        &self,
        potential: &Array2<f64>,
        origin: (f64, f64),
        offsets: &[(f64, f64, f64)],
    ) -> (f64, f64, f64) {
        let (ny, nx) = self.grid_shape;
        let mut total = 0.0;
        let mut moment = (0.0, 0.0);
        for &(weight, dy, dx) in offsets {
            let j = wrap_index(((origin.0 + dy) / self.pixel_size.0).round(), ny);
            let i = wrap_index(((origin.1 + dx) / self.pixel_size.1).round(), nx);
            let value = weight * potential[[j, i]];
            total += value;
            moment.0 += value * dx;
            moment.1 += value * dy;
        }
        if total > 0.0 {
            (total, moment.0 / total, moment.1 / total)
        } else {
            (total, 0.0, 0.0)
        }
    }
}

impl SimulationKernels for IncoherentKernels {
    type Potential = Array2<f64>;
    type ScatteringMatrix = CompactMatrix;

    fn probe_frequencies(&self, algorithm: Algorithm) -> &FrequencyGrid {
        match algorithm {
            Algorithm::Multislice => &self.multislice_grid,
            Algorithm::Prism => &self.prism_grid,
        }
    }

    fn compute_potential(
        &self,
        structure: &Structure,
        phonon_seed: u64,
    ) -> Result<Array2<f64>, KernelError> {
        let (ny, nx) = self.grid_shape;
        let mut potential = Array2::<f64>::zeros((ny, nx));
        let mut rng = StdRng::seed_from_u64(phonon_seed);

        let width = self.potential_bound / 3.0;
        let norm = 1.0 / (2.0 * PI * width * width);
        let reach = (
            (self.potential_bound / self.pixel_size.0).ceil() as isize,
            (self.potential_bound / self.pixel_size.1).ceil() as isize,
        );

        for atom in structure.atoms() {
            let mut y = atom.position.y;
            let mut x = atom.position.x;
            if self.include_thermal_effects && atom.thermal_sigma > 0.0 {
                let normal = Normal::new(0.0, atom.thermal_sigma).map_err(|e| {
                    KernelError::with_source("invalid thermal displacement distribution", e)
                })?;
                y += normal.sample(&mut rng);
                x += normal.sample(&mut rng);
            }
            let weight = f64::from(atom.atomic_number).powf(Z_CONTRAST_EXPONENT)
                * atom.occupancy
                * norm;

            let cj = (y / self.pixel_size.0).round() as isize;
            let ci = (x / self.pixel_size.1).round() as isize;
            for dj in -reach.0..=reach.0 {
                let py = (cj + dj) as f64 * self.pixel_size.0;
                for di in -reach.1..=reach.1 {
                    let px = (ci + di) as f64 * self.pixel_size.1;
                    let r2 = (py - y).powi(2) + (px - x).powi(2);
                    if r2 > self.potential_bound * self.potential_bound {
                        continue;
                    }
                    let j = wrap_index((cj + dj) as f64, ny);
                    let i = wrap_index((ci + di) as f64, nx);
                    potential[[j, i]] += weight * (-r2 / (2.0 * width * width)).exp();
                }
            }
        }
        Ok(potential)
    }

    fn import_potential(&self, artifact: &Path) -> Result<Array2<f64>, KernelError> {
        self.read_grid_dataset(artifact, POTENTIAL_DATASET)
    }

    fn compute_scattering_matrix(
        &self,
        potential: &Array2<f64>,
    ) -> Result<CompactMatrix, KernelError> {
        Ok(CompactMatrix {
            potential: potential.clone(),
            focal_plane: 0.0,
        })
    }

    fn import_scattering_matrix(&self, artifact: &Path) -> Result<CompactMatrix, KernelError> {
        Ok(CompactMatrix {
            potential: self.read_grid_dataset(artifact, MATRIX_DATASET)?,
            focal_plane: 0.0,
        })
    }

    fn refocus(&self, matrix: &mut CompactMatrix, defocus: f64) -> Result<(), KernelError> {
        matrix.focal_plane = defocus;
        Ok(())
    }

    fn multislice_output(
        &self,
        potential: &Array2<f64>,
        request: &OutputRequest<'_>,
    ) -> Result<FrozenPhononResult, KernelError> {
        self.image(potential, &self.multislice_grid, request, 0.0)
    }

    fn prism_output(
        &self,
        matrix: &CompactMatrix,
        request: &OutputRequest<'_>,
    ) -> Result<FrozenPhononResult, KernelError> {
        self.image(&matrix.potential, &self.prism_grid, request, matrix.focal_plane)
    }

    fn potential_dataset(&self, potential: &Array2<f64>) -> Option<ArrayD<f64>> {
        Some(potential.clone().into_dyn())
    }

    fn matrix_dataset(&self, matrix: &CompactMatrix) -> Option<ArrayD<f64>> {
        Some(matrix.potential.clone().into_dyn())
    }
}

/// Normalized intensity of the aberrated, aperture-limited probe over the
/// window of `grid`, centred at pixel `(ny / 2, nx / 2)`.
///
/// `focal_plane` is a defocus already applied to the specimen side; its C1
/// phase `pi * lambda * df * q^2` is removed from the surface.
fn probe_intensity(
    grid: &FrequencyGrid,
    request: &OutputRequest<'_>,
    semiangle: f64,
    focal_plane: f64,
) -> Result<Array2<f64>, KernelError> {
    let chi = request.aberration_surface;
    if chi.dim() != grid.shape() {
        return Err(KernelError::new(format!(
            "aberration surface has shape {:?}, expected the probe window {:?}",
            chi.dim(),
            grid.shape()
        )));
    }

    let aperture: Vec<(f64, f64, f64)> = grid
        .q()
        .indexed_iter()
        .filter(|(_, q)| request.wavelength * **q <= semiangle)
        .map(|(ix, &q)| {
            let theta = grid.q_theta()[ix];
            let refocused = PI * request.wavelength * focal_plane * q * q;
            (q * theta.sin(), q * theta.cos(), refocused - chi[ix].re)
        })
        .collect();
    if aperture.is_empty() {
        return Err(KernelError::new(
            "the probe aperture contains no sampled frequencies",
        ));
    }

    let (wy, wx) = grid.shape();
    let (py, px) = grid.pixel_size();
    let mut intensity = Array2::from_shape_fn((wy, wx), |(j, i)| {
        let y = (j as f64 - (wy / 2) as f64) * py;
        let x = (i as f64 - (wx / 2) as f64) * px;
        let psi: Complex64 = aperture
            .iter()
            .map(|&(qy, qx, phase)| Complex64::from_polar(1.0, phase + 2.0 * PI * (qx * x + qy * y)))
            .sum();
        psi.norm_sqr()
    });
    let total = intensity.sum();
    if total > 0.0 {
        intensity /= total;
    }
    Ok(intensity)
}

fn pixels_across(extent: f64, pixel: f64) -> usize {
    ((extent / pixel).round() as usize).max(1)
}

fn window_pixels(pixel: f64, limit: usize) -> usize {
    let wanted = ((2.0 * PROBE_WINDOW_RADIUS / pixel).ceil() as usize)
        .next_power_of_two()
        .max(MIN_WINDOW_PIXELS);
    wanted.min(limit.max(1))
}

fn wrap_index(index: f64, len: usize) -> usize {
    (index as isize).rem_euclid(len as isize) as usize
}
