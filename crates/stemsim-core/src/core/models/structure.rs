use nalgebra::{Point3, Vector3};

/// Represents a single atomic site within a specimen.
///
/// Each site carries the information the potential kernel needs to place a
/// projected potential and to draw a thermal displacement for a frozen-phonon
/// realization.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// Atomic number (Z) of the element at this site.
    pub atomic_number: u32,
    /// Cartesian position in Angstroms.
    pub position: Point3<f64>,
    /// Fractional site occupancy in `[0, 1]`.
    pub occupancy: f64,
    /// Root-mean-square thermal displacement in Angstroms.
    pub thermal_sigma: f64,
}

impl Atom {
    /// Creates a fully occupied atom with no thermal vibration.
    ///
    /// # Arguments
    ///
    /// * `atomic_number` - The atomic number of the element.
    /// * `position` - The Cartesian position in Angstroms.
    pub fn new(atomic_number: u32, position: Point3<f64>) -> Self {
        Self {
            atomic_number,
            position,
            occupancy: 1.0,
            thermal_sigma: 0.0,
        }
    }

    pub fn with_occupancy(mut self, occupancy: f64) -> Self {
        self.occupancy = occupancy;
        self
    }

    pub fn with_thermal_sigma(mut self, sigma: f64) -> Self {
        self.thermal_sigma = sigma;
        self
    }
}

/// An orthorhombic simulation cell populated with atoms.
///
/// The cell is the unit that potential kernels slice and project. Positions are
/// stored in Angstroms relative to the cell origin; tiling replicates the
/// content along each axis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Structure {
    cell_dimensions: Vector3<f64>,
    atoms: Vec<Atom>,
}

impl Structure {
    /// Creates a structure from explicit cell dimensions and atoms.
    ///
    /// # Arguments
    ///
    /// * `cell_dimensions` - Cell edge lengths `(x, y, z)` in Angstroms.
    /// * `atoms` - The atomic sites within the cell.
    pub fn new(cell_dimensions: Vector3<f64>, atoms: Vec<Atom>) -> Self {
        Self {
            cell_dimensions,
            atoms,
        }
    }

    pub fn cell_dimensions(&self) -> Vector3<f64> {
        self.cell_dimensions
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Replicates the cell content `tile[axis]` times along each axis.
    ///
    /// The resulting cell dimensions are scaled accordingly. A tile count of
    /// zero on any axis is treated as one.
    ///
    /// # Return
    ///
    /// Returns a new structure containing every replicated atom.
    pub fn tiled(&self, tile: [usize; 3]) -> Self {
        let [tx, ty, tz] = tile.map(|t| t.max(1));
        if tx == 1 && ty == 1 && tz == 1 {
            return self.clone();
        }

        let cell = self.cell_dimensions;
        let mut atoms = Vec::with_capacity(self.atoms.len() * tx * ty * tz);
        for iz in 0..tz {
            for iy in 0..ty {
                for ix in 0..tx {
                    let shift = Vector3::new(
                        ix as f64 * cell.x,
                        iy as f64 * cell.y,
                        iz as f64 * cell.z,
                    );
                    atoms.extend(self.atoms.iter().map(|atom| Atom {
                        position: atom.position + shift,
                        ..atom.clone()
                    }));
                }
            }
        }

        Self {
            cell_dimensions: Vector3::new(
                cell.x * tx as f64,
                cell.y * ty as f64,
                cell.z * tz as f64,
            ),
            atoms,
        }
    }
}
