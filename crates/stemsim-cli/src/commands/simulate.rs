use crate::cli::SimulateArgs;
use crate::config::PartialSimulationConfig;
use crate::error::{CliError, Result};
use crate::utils::progress::SimulationProgress;
use stemsim::{
    core::io::{traits::StructureFile, xyz::XyzFile},
    engine::progress::ProgressReporter,
    kernels::incoherent::IncoherentKernels,
    workflows,
};
use tracing::info;

pub fn run(args: SimulateArgs) -> Result<()> {
    let partial_config = match &args.config {
        Some(path) => PartialSimulationConfig::from_file(path)?,
        None => PartialSimulationConfig::default(),
    };
    info!("Merging configuration from file and CLI arguments...");
    let resolved = partial_config.merge_with_cli(&args)?;
    let config = resolved.config;

    info!("Loading specimen from {:?}", &args.input);
    let specimen = XyzFile::read_from_path(&args.input).map_err(|e| CliError::FileParsing {
        path: args.input.clone(),
        source: e.into(),
    })?;
    let structure = specimen.tiled(resolved.tile);
    info!(
        atoms = structure.len(),
        tile = ?resolved.tile,
        "Specimen prepared."
    );

    let kernels = IncoherentKernels::new(&config, &structure)
        .map_err(|e| CliError::Other(anyhow::Error::new(e).context("Failed to set up kernels")))?;

    let progress = SimulationProgress::new();
    let reporter = ProgressReporter::with_callback(progress.callback());

    println!(
        "Starting {} simulation ({} frozen phonon(s))...",
        config.algorithm, config.phonons.num_fp
    );
    info!("Invoking the core simulation workflow...");
    let outcome = workflows::simulate::run(&config, &structure, &kernels, &reporter);
    let phases = progress.finish();
    let result = outcome?;
    for phase in &phases {
        info!(
            phase = phase.name,
            seconds = phase.elapsed.as_secs_f64(),
            "Phase timing."
        );
    }

    println!(
        "✓ Wrote {} dataset(s) to {}",
        result.datasets.len(),
        result.output_path.display()
    );
    for name in &result.datasets {
        println!("  - {}", name);
    }
    Ok(())
}
