//! # Engine Module
//!
//! Orchestrates STEM simulations on top of a pluggable set of numerical kernels.
//!
//! ## Overview
//!
//! The engine owns the control flow of a run: which kernel is invoked at which
//! stage, with which thermal seed and aberration surface, and how the results of
//! many frozen-phonon realizations are combined. The numerics themselves live
//! behind the [`kernels::SimulationKernels`] trait.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Validated run settings and the builder that produces them
//! - **Kernels** ([`kernels`]) - The trait boundary to potential, scattering and output kernels
//! - **Pipeline** ([`pipeline`]) - One realization: potential, scattering matrix, refocus, output
//! - **Ensemble** ([`ensemble`]) - In-memory frozen-phonon averaging and seed generation
//! - **Series** ([`series`]) - Defocus sweeps with an out-of-core per-tag accumulator
//! - **State Tracking** ([`state`]) - Run parameters, per-iteration state and accumulation
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress reporting
//! - **Error Handling** ([`error`]) - Stage-attributed engine errors

pub mod config;
pub mod ensemble;
pub mod error;
pub mod kernels;
pub mod pipeline;
pub mod progress;
pub mod series;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
