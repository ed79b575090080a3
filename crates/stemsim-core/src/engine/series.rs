use super::config::SeriesPoint;
use super::ensemble::PhononSeeds;
use super::error::EngineError;
use super::kernels::{FrozenPhononResult, SimulationKernels};
use super::pipeline::{PipelineRunner, Stage};
use super::progress::{Progress, ProgressReporter};
use super::state::{PhononAverage, SimulationParameters, add_into};
use crate::core::io::store::DatasetStore;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, instrument};

const DPC_SUFFIX: &str = "_DPC";

/// Out-of-core running sums for a defocus series, keyed by series tag.
///
/// The backing store is only created on the first write, so a run that fails
/// before producing any output leaves nothing behind.
#[derive(Debug)]
pub struct ScratchAccumulator {
    path: PathBuf,
    store: Option<DatasetStore>,
    written: HashSet<String>,
}

impl ScratchAccumulator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: None,
            written: HashSet::new(),
        }
    }

    pub fn is_created(&self) -> bool {
        self.store.is_some()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.written.contains(tag)
    }

    /// Adds `result` to the running sum of `tag`; the first write assigns.
    pub fn accumulate(&mut self, tag: &str, result: FrozenPhononResult) -> Result<(), EngineError> {
        let store = match self.store.take() {
            Some(store) => store,
            None => {
                debug!(path = %self.path.display(), "Creating series scratch store.");
                DatasetStore::create(&self.path).map_err(EngineError::store(Stage::Accumulate))?
            }
        };
        let store = self.store.insert(store);
        let dpc_name = format!("{}{}", tag, DPC_SUFFIX);

        if !self.written.contains(tag) {
            store
                .write(tag, &result.output)
                .map_err(EngineError::store(Stage::Accumulate))?;
            if let Some(dpc) = &result.dpc_com {
                store
                    .write(&dpc_name, dpc)
                    .map_err(EngineError::store(Stage::Accumulate))?;
            }
            self.written.insert(tag.to_string());
            return Ok(());
        }

        let mut sum = store
            .read(tag)
            .map_err(EngineError::store(Stage::Accumulate))?;
        add_into(&mut sum, &result.output)?;
        store
            .write(tag, &sum)
            .map_err(EngineError::store(Stage::Accumulate))?;

        if let Some(dpc) = &result.dpc_com {
            let mut sum = store
                .read(&dpc_name)
                .map_err(EngineError::store(Stage::Accumulate))?;
            add_into(&mut sum, dpc)?;
            store
                .write(&dpc_name, &sum)
                .map_err(EngineError::store(Stage::Accumulate))?;
        }
        Ok(())
    }

    /// Reads back the running sums of `tag`.
    pub fn load(&self, tag: &str) -> Result<FrozenPhononResult, EngineError> {
        let store = match (&self.store, self.written.contains(tag)) {
            (Some(store), true) => store,
            _ => {
                return Err(EngineError::ScratchConsistency {
                    tag: tag.to_string(),
                });
            }
        };
        let output = store
            .read(tag)
            .map_err(EngineError::store(Stage::SeriesFinalize))?;
        let dpc_name = format!("{}{}", tag, DPC_SUFFIX);
        let dpc_com = if store.contains(&dpc_name) {
            Some(
                store
                    .read(&dpc_name)
                    .map_err(EngineError::store(Stage::SeriesFinalize))?,
            )
        } else {
            None
        };
        Ok(FrozenPhononResult::new(output, dpc_com))
    }

    /// Deletes the backing store, if one was created.
    pub fn discard(self) -> Result<(), EngineError> {
        match self.store {
            Some(store) => {
                debug!(path = %store.path().display(), "Removing series scratch store.");
                store
                    .remove()
                    .map_err(EngineError::store(Stage::SeriesFinalize))
            }
            None => Ok(()),
        }
    }
}

/// Scans every series point for every frozen phonon.
///
/// The potential (and scattering matrix) is prepared once per phonon and
/// reused for all points; only the aberrations, refocus and output change.
#[instrument(skip_all, fields(phonons = phonon_count, points = points.len()))]
pub fn run_series<K: SimulationKernels>(
    runner: &PipelineRunner<'_, K>,
    params: &mut SimulationParameters<'_>,
    phonon_count: usize,
    points: &[SeriesPoint],
    scratch: &mut ScratchAccumulator,
    seeds: &mut PhononSeeds,
    reporter: &ProgressReporter,
) -> Result<(), EngineError> {
    for index in 0..phonon_count {
        let seed = seeds.next_seed();
        params.begin_phonon(index, seed);
        info!(seed, "Frozen phonon #{}", index);

        let mut stage = runner.prepare(params)?;
        for point in points {
            params.enter_series_point(point);
            reporter.status(format!(
                "Phonon {}/{}, {} ({:.2} A)",
                index + 1,
                phonon_count,
                point.tag,
                point.defocus
            ));
            stage = runner.refocus(stage, params)?;
            let result = runner.output(&stage, params)?;
            scratch.accumulate(&point.tag, result)?;
            reporter.report(Progress::TaskIncrement);
        }
    }
    Ok(())
}

/// Streams the phonon mean of each series point to `emit`, one tag at a time.
///
/// Does nothing when `phonon_count` is zero.
pub fn finalize_series<F>(
    scratch: &ScratchAccumulator,
    points: &[SeriesPoint],
    phonon_count: usize,
    mut emit: F,
) -> Result<(), EngineError>
where
    F: FnMut(&SeriesPoint, PhononAverage) -> Result<(), EngineError>,
{
    if phonon_count == 0 {
        return Ok(());
    }
    let count = phonon_count as f64;
    for point in points {
        let sum = scratch.load(&point.tag)?;
        debug!(tag = %point.tag, "Finalizing series point.");
        emit(
            point,
            PhononAverage {
                output: sum.output / count,
                dpc_com: sum.dpc_com.map(|dpc| dpc / count),
            },
        )?;
    }
    Ok(())
}
