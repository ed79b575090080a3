//! # Workflows Module
//!
//! High-level entry points that run a complete STEM simulation.
//!
//! ## Overview
//!
//! A workflow validates the configuration, creates the output artifact, chooses
//! between a single frozen-phonon ensemble and a defocus series, writes the
//! averaged datasets and the run metadata, and cleans up any scratch storage.
//!
//! - **Simulation Workflow** ([`simulate`]) - The full Multislice or PRISM run.

pub mod simulate;
