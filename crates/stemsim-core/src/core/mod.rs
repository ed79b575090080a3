//! # Core Module
//!
//! This module provides the stateless building blocks of the STEM simulation library.
//!
//! ## Overview
//!
//! Everything in `core` is free of orchestration state: specimen models, file
//! formats, the persisted dataset store and the electron-optical model of the
//! probe. The [`engine`](crate::engine) layer combines these pieces into a
//! frozen-phonon pipeline.
//!
//! ## Architecture
//!
//! - **Specimen Representation** ([`models`]) - Atomic sites and simulation cells
//! - **File I/O** ([`io`]) - Specimen formats and the dataset store for outputs and scratch data
//! - **Probe Optics** ([`optics`]) - Electron wavelength, frequency grids and the aberration function
//!
//! ## Key Capabilities
//!
//! - **Aberration tables** parsed with line-accurate diagnostics
//! - **Canonical aberration lists** with deduplication and C1/C3/C5 overrides
//! - **Durable dataset storage** with atomic per-dataset writes

pub mod io;
pub mod models;
pub mod optics;
