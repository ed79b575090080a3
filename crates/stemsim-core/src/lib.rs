//! # STEMsim Core Library
//!
//! Orchestration engine for scanning transmission electron microscopy (STEM)
//! image simulation with the Multislice and PRISM algorithms.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict layered architecture so that numerics, control
//! flow and user-facing procedures stay separate.
//!
//! - **[`core`]: The Foundation.** Stateless data models (`Structure`), optics
//!   (electron wavelength, probe frequency grids, the aberration model) and I/O for
//!   specimens and the on-disk dataset store.
//!
//! - **[`engine`]: The Logic Core.** The stateful layer that drives a run: the
//!   pipeline stage machine, frozen-phonon averaging, defocus series with out-of-core
//!   accumulation, and the [`engine::kernels::SimulationKernels`] trait behind which
//!   all heavy numerics live.
//!
//! - **[`kernels`]: Numerical Backends.** Concrete kernel sets; the bundled
//!   incoherent reference model runs on the CPU and parallelizes with rayon.
//!
//! - **[`workflows`]: The Public API.** Complete procedures that tie `core`,
//!   `engine` and a kernel set together, from a validated configuration to a
//!   finished output artifact.

pub mod core;
pub mod engine;
pub mod kernels;
pub mod workflows;
