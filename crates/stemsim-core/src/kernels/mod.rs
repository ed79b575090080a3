//! Concrete implementations of [`SimulationKernels`](crate::engine::kernels::SimulationKernels).
//!
//! - **Incoherent** ([`incoherent`]) - A CPU reference model that images the projected
//!   potential with an aperture-limited, aberrated probe. It is meant for examples,
//!   tests and quick previews rather than quantitative dynamical scattering.

pub mod incoherent;
