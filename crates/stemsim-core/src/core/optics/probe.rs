use ndarray::Array2;

const PLANCK: f64 = 6.626_070_15e-34;
const ELECTRON_MASS: f64 = 9.109_383_701_5e-31;
const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;
const SPEED_OF_LIGHT: f64 = 299_792_458.0;
const METERS_TO_ANGSTROM: f64 = 1e10;

/// Relativistic electron wavelength in Angstroms for a beam energy in keV.
pub fn electron_wavelength(energy_kev: f64) -> f64 {
    let volts = energy_kev * 1e3;
    let momentum_sq = 2.0
        * ELECTRON_MASS
        * ELEMENTARY_CHARGE
        * volts
        * (1.0 + ELEMENTARY_CHARGE * volts / (2.0 * ELECTRON_MASS * SPEED_OF_LIGHT.powi(2)));
    PLANCK / momentum_sq.sqrt() * METERS_TO_ANGSTROM
}

/// Sample frequencies of a discrete Fourier transform of length `n` with spacing `d`,
/// in the usual FFT ordering (zero first, then positive, then negative).
pub fn fft_frequencies(n: usize, d: f64) -> Vec<f64> {
    let scale = 1.0 / (n as f64 * d);
    (0..n)
        .map(|k| {
            let k = if k < n.div_ceil(2) {
                k as f64
            } else {
                k as f64 - n as f64
            };
            k * scale
        })
        .collect()
}

/// Spatial-frequency magnitude and azimuth over a 2D probe window.
///
/// Both arrays share the `(ny, nx)` shape of the window, which is what
/// [`build_aberration_surface`](super::aberration::build_aberration_surface)
/// requires.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyGrid {
    q: Array2<f64>,
    q_theta: Array2<f64>,
    pixel_size: (f64, f64),
}

impl FrequencyGrid {
    /// Builds the grid for a window of `shape = (ny, nx)` pixels of size
    /// `pixel_size = (py, px)` Angstroms.
    pub fn new(shape: (usize, usize), pixel_size: (f64, f64)) -> Self {
        let (ny, nx) = shape;
        let qy = fft_frequencies(ny, pixel_size.0);
        let qx = fft_frequencies(nx, pixel_size.1);

        let q = Array2::from_shape_fn((ny, nx), |(j, i)| qx[i].hypot(qy[j]));
        let q_theta = Array2::from_shape_fn((ny, nx), |(j, i)| qy[j].atan2(qx[i]));

        Self {
            q,
            q_theta,
            pixel_size,
        }
    }

    pub fn q(&self) -> &Array2<f64> {
        &self.q
    }

    pub fn q_theta(&self) -> &Array2<f64> {
        &self.q_theta
    }

    pub fn shape(&self) -> (usize, usize) {
        self.q.dim()
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        self.pixel_size
    }
}
