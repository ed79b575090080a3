use super::error::EngineError;
use super::kernels::SimulationKernels;
use super::pipeline::PipelineRunner;
use super::progress::{Progress, ProgressReporter};
use super::state::{EnsembleAccumulator, SimulationParameters};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, instrument};

/// Exclusive upper bound of a per-phonon seed.
pub const MAX_PHONON_SEED: u64 = 100_000;

/// Sequential source of per-phonon seeds, reproducible from the base seed.
#[derive(Debug, Clone)]
pub struct PhononSeeds {
    rng: StdRng,
}

impl PhononSeeds {
    pub fn new(base_seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(base_seed),
        }
    }

    pub fn next_seed(&mut self) -> u64 {
        self.rng.gen_range(0..MAX_PHONON_SEED)
    }
}

/// Runs `count` independent realizations and sums them.
#[instrument(skip_all, fields(count = count))]
pub fn run_ensemble<K: SimulationKernels>(
    runner: &PipelineRunner<'_, K>,
    params: &mut SimulationParameters<'_>,
    count: usize,
    seeds: &mut PhononSeeds,
    reporter: &ProgressReporter,
) -> Result<EnsembleAccumulator, EngineError> {
    let mut accumulator = EnsembleAccumulator::new();
    for index in 0..count {
        let seed = seeds.next_seed();
        params.begin_phonon(index, seed);
        info!(seed, "Frozen phonon #{}", index);
        reporter.status(format!("Frozen phonon {}/{}", index + 1, count));

        let result = runner.run(params)?;
        accumulator = accumulator.fold(result)?;
        reporter.report(Progress::TaskIncrement);
    }
    Ok(accumulator)
}
