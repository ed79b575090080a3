use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "Tony Kan",
    version,
    about = "STEMsim CLI - Simulate scanning transmission electron microscopy images with the Multislice and PRISM algorithms.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a STEM simulation and write the averaged outputs to an artifact directory.
    Simulate(SimulateArgs),
    /// Parse an aberration table, normalize it and print the resulting terms.
    Aberrations(AberrationsArgs),
}

/// Arguments for the `simulate` subcommand.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    // --- Core Arguments ---
    /// Path to the specimen in XYZ format (comment, cell line, `Z x y z occ sigma` records).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub input: PathBuf,

    /// Path of the output artifact directory.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub output: PathBuf,

    /// Path to an optional configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Simulation algorithm: 'prism' or 'multislice'.
    #[arg(short, long, value_name = "NAME")]
    pub algorithm: Option<String>,

    // --- Optics Overrides ---
    /// Beam energy in keV.
    #[arg(short = 'E', long, value_name = "FLOAT")]
    pub energy: Option<f64>,

    /// Probe defocus (C1) in Angstroms.
    #[arg(long, value_name = "FLOAT", allow_hyphen_values = true)]
    pub probe_defocus: Option<f64>,

    /// Spherical aberration C3 in Angstroms.
    #[arg(long, value_name = "FLOAT", allow_hyphen_values = true)]
    pub c3: Option<f64>,

    /// Fifth-order spherical aberration C5 in Angstroms.
    #[arg(long, value_name = "FLOAT", allow_hyphen_values = true)]
    pub c5: Option<f64>,

    /// Aberration table (header line, then `m n magnitude angle` per line).
    #[arg(long, value_name = "PATH")]
    pub aberrations: Option<PathBuf>,

    // --- Phonon Overrides ---
    /// Number of frozen phonon configurations to average.
    #[arg(short = 'F', long, value_name = "INT")]
    pub num_fp: Option<usize>,

    /// Base random seed for the frozen phonon sequence.
    #[arg(short = 'r', long, value_name = "INT")]
    pub seed: Option<u64>,

    /// Disable thermal displacements of the atoms.
    #[arg(long)]
    pub no_thermal_effects: bool,

    // --- Pipeline Shortcuts ---
    #[command(flatten)]
    pub import: ImportSource,

    /// Refocus the PRISM scattering matrix to the working defocus.
    #[arg(long)]
    pub matrix_refocus: bool,

    /// Run a defocus series given as MIN:MAX:STEP in Angstroms.
    #[arg(long, value_name = "MIN:MAX:STEP", allow_hyphen_values = true)]
    pub defocus_series: Option<String>,

    // --- Output Overrides ---
    /// Also save the center-of-mass DPC signal.
    #[arg(long)]
    pub save_dpc_com: bool,

    /// Save the projected potential of the first frozen phonon.
    #[arg(long)]
    pub save_potential: bool,

    /// Save the scattering matrix of the first frozen phonon.
    #[arg(long)]
    pub save_smatrix: bool,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S phonons.num-fp=8
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Mutually exclusive shortcuts that skip the potential calculation.
#[derive(Args, Debug, Clone, Default)]
#[group(required = false, multiple = false)]
pub struct ImportSource {
    /// Import the projected potential from a previous output artifact.
    #[arg(long, value_name = "PATH")]
    pub import_potential: Option<PathBuf>,
    /// Import the scattering matrix from a previous output artifact (PRISM only).
    #[arg(long, value_name = "PATH")]
    pub import_smatrix: Option<PathBuf>,
}

/// Arguments for the `aberrations` subcommand.
#[derive(Args, Debug)]
pub struct AberrationsArgs {
    /// Path to the aberration table.
    #[arg(required = true, value_name = "PATH")]
    pub path: PathBuf,

    /// Beam energy in keV, used to convert the C1/C3/C5 overrides.
    #[arg(short = 'E', long, value_name = "FLOAT", default_value_t = 80.0)]
    pub energy: f64,

    /// Override for C1 (defocus) in Angstroms.
    #[arg(long, value_name = "FLOAT", default_value_t = 0.0, allow_hyphen_values = true)]
    pub c1: f64,

    /// Override for C3 in Angstroms.
    #[arg(long, value_name = "FLOAT", default_value_t = 0.0, allow_hyphen_values = true)]
    pub c3: f64,

    /// Override for C5 in Angstroms.
    #[arg(long, value_name = "FLOAT", default_value_t = 0.0, allow_hyphen_values = true)]
    pub c5: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_accepts_negative_defocus_and_series() {
        let cli = Cli::parse_from([
            "stemsim",
            "simulate",
            "-i",
            "si.xyz",
            "-o",
            "out",
            "--probe-defocus",
            "-50",
            "--defocus-series",
            "-100:100:50",
        ]);
        let Commands::Simulate(args) = cli.command else {
            panic!("expected 'simulate' subcommand");
        };
        assert_eq!(args.probe_defocus, Some(-50.0));
        assert_eq!(args.defocus_series.as_deref(), Some("-100:100:50"));
    }

    #[test]
    fn import_shortcuts_are_mutually_exclusive() {
        let result = Cli::try_parse_from([
            "stemsim",
            "simulate",
            "-i",
            "si.xyz",
            "-o",
            "out",
            "--import-potential",
            "a",
            "--import-smatrix",
            "b",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::parse_from(["stemsim", "aberrations", "table.txt", "-vv", "-j", "4"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.threads, Some(4));
        let Commands::Aberrations(args) = cli.command else {
            panic!("expected 'aberrations' subcommand");
        };
        assert_eq!(args.energy, 80.0);
    }
}
