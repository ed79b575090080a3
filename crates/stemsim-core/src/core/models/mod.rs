//! # Core Models Module
//!
//! This module contains the data structures used to describe the specimen that a
//! STEM simulation images.
//!
//! ## Overview
//!
//! The specimen is an orthorhombic cell of atomic sites. Each site records the
//! element, position, occupancy and thermal vibration amplitude, which is all the
//! potential kernels need to build a projected potential for one frozen-phonon
//! realization.
//!
//! ## Key Components
//!
//! - [`structure`] - Atomic sites and the simulation cell, including tiling
//!
//! ## Usage
//!
//! ```ignore
//! use stemsim::core::models::structure::{Atom, Structure};
//! use nalgebra::{Point3, Vector3};
//!
//! let cell = Structure::new(
//!     Vector3::new(5.43, 5.43, 5.43),
//!     vec![Atom::new(14, Point3::new(0.0, 0.0, 0.0))],
//! );
//! let supercell = cell.tiled([4, 4, 10]);
//! ```

pub mod structure;
