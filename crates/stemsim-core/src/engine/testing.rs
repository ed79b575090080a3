//! Deterministic kernels for exercising the engine without any physics.

use super::config::Algorithm;
use super::kernels::{FrozenPhononResult, KernelError, OutputRequest, SimulationKernels};
use super::pipeline::Stage;
use crate::core::models::structure::Structure;
use crate::core::optics::probe::FrequencyGrid;
use ndarray::{ArrayD, IxDyn};
use std::cell::{Cell, RefCell};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub(crate) struct MockPotential {
    pub index: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MockMatrix {
    pub index: usize,
    pub focal_plane: Option<f64>,
}

/// Every output pixel equals `10 * k + defocus`, where `k` counts the
/// potentials computed before this one (imports count as `k = 0`).
pub(crate) struct MockKernels {
    grid: FrequencyGrid,
    potential_calls: Cell<usize>,
    matrix_calls: Cell<usize>,
    multislice_calls: Cell<usize>,
    refocus_log: RefCell<Vec<f64>>,
    imports: RefCell<Vec<String>>,
    fail_at: Option<Stage>,
    with_dpc: bool,
}

impl MockKernels {
    pub const OUTPUT_SHAPE: &'static [usize] = &[2, 3, 1];
    pub const DPC_SHAPE: &'static [usize] = &[2, 3, 2];

    pub fn new() -> Self {
        Self {
            grid: FrequencyGrid::new((4, 4), (0.1, 0.1)),
            potential_calls: Cell::new(0),
            matrix_calls: Cell::new(0),
            multislice_calls: Cell::new(0),
            refocus_log: RefCell::new(Vec::new()),
            imports: RefCell::new(Vec::new()),
            fail_at: None,
            with_dpc: true,
        }
    }

    pub fn failing_at(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub fn without_dpc(mut self) -> Self {
        self.with_dpc = false;
        self
    }

    pub fn potential_calls(&self) -> usize {
        self.potential_calls.get()
    }

    pub fn matrix_calls(&self) -> usize {
        self.matrix_calls.get()
    }

    pub fn multislice_calls(&self) -> usize {
        self.multislice_calls.get()
    }

    pub fn refocus_log(&self) -> Vec<f64> {
        self.refocus_log.borrow().clone()
    }

    pub fn imports(&self) -> Vec<String> {
        self.imports.borrow().clone()
    }

    pub fn expected_value(phonon: usize, defocus: f64) -> f64 {
        10.0 * phonon as f64 + defocus
    }

    fn check(&self, stage: Stage) -> Result<(), KernelError> {
        if self.fail_at == Some(stage) {
            Err(KernelError::new(format!("mock {} failure", stage)))
        } else {
            Ok(())
        }
    }

    fn result(&self, index: usize, request: &OutputRequest<'_>) -> FrozenPhononResult {
        let value = Self::expected_value(index, request.defocus);
        FrozenPhononResult::new(
            ArrayD::from_elem(IxDyn(Self::OUTPUT_SHAPE), value),
            self.with_dpc
                .then(|| ArrayD::from_elem(IxDyn(Self::DPC_SHAPE), -value)),
        )
    }
}

impl SimulationKernels for MockKernels {
    type Potential = MockPotential;
    type ScatteringMatrix = MockMatrix;

    fn probe_frequencies(&self, _algorithm: Algorithm) -> &FrequencyGrid {
        &self.grid
    }

    fn compute_potential(
        &self,
        _structure: &Structure,
        _phonon_seed: u64,
    ) -> Result<MockPotential, KernelError> {
        self.check(Stage::Potential)?;
        let index = self.potential_calls.get();
        self.potential_calls.set(index + 1);
        Ok(MockPotential { index })
    }

    fn import_potential(&self, artifact: &Path) -> Result<MockPotential, KernelError> {
        self.check(Stage::Potential)?;
        self.imports
            .borrow_mut()
            .push(format!("potential:{}", artifact.display()));
        Ok(MockPotential { index: 0 })
    }

    fn compute_scattering_matrix(
        &self,
        potential: &MockPotential,
    ) -> Result<MockMatrix, KernelError> {
        self.check(Stage::Scattering)?;
        self.matrix_calls.set(self.matrix_calls.get() + 1);
        Ok(MockMatrix {
            index: potential.index,
            focal_plane: None,
        })
    }

    fn import_scattering_matrix(&self, artifact: &Path) -> Result<MockMatrix, KernelError> {
        self.check(Stage::Scattering)?;
        self.imports
            .borrow_mut()
            .push(format!("matrix:{}", artifact.display()));
        Ok(MockMatrix {
            index: 0,
            focal_plane: None,
        })
    }

    fn refocus(&self, matrix: &mut MockMatrix, defocus: f64) -> Result<(), KernelError> {
        self.check(Stage::Refocus)?;
        self.refocus_log.borrow_mut().push(defocus);
        matrix.focal_plane = Some(defocus);
        Ok(())
    }

    fn multislice_output(
        &self,
        potential: &MockPotential,
        request: &OutputRequest<'_>,
    ) -> Result<FrozenPhononResult, KernelError> {
        self.check(Stage::Output)?;
        self.multislice_calls.set(self.multislice_calls.get() + 1);
        Ok(self.result(potential.index, request))
    }

    fn prism_output(
        &self,
        matrix: &MockMatrix,
        request: &OutputRequest<'_>,
    ) -> Result<FrozenPhononResult, KernelError> {
        self.check(Stage::Output)?;
        Ok(self.result(matrix.index, request))
    }

    fn potential_dataset(&self, potential: &MockPotential) -> Option<ArrayD<f64>> {
        Some(ArrayD::from_elem(IxDyn(&[2, 2]), potential.index as f64))
    }

    fn matrix_dataset(&self, matrix: &MockMatrix) -> Option<ArrayD<f64>> {
        Some(ArrayD::from_elem(IxDyn(&[2, 2]), matrix.index as f64))
    }
}
