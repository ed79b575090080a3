//! Electron-optical helpers shared by every algorithm's output stage.
//!
//! - [`probe`] - Electron wavelength and the spatial-frequency grid of a probe window
//! - [`aberration`] - Parsing, normalization and evaluation of the wavefront aberration function

pub mod aberration;
pub mod probe;
