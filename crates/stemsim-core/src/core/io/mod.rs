//! Provides input/output functionality for specimens and simulation artifacts.
//!
//! This module contains the reader and writer for the XYZ-style specimen format,
//! a trait-based interface so other specimen formats can be plugged in, and the
//! directory-backed dataset store used for both the permanent output artifact and
//! the out-of-core scratch accumulator of a defocus series.

pub mod store;
pub mod traits;
pub mod xyz;
