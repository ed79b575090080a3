use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stemsim::engine::progress::{Progress, ProgressCallback};
use stemsim::workflows::simulate::{DEFOCUS_SERIES_PHASE, FROZEN_PHONON_PHASE};
use tracing::warn;

const SPINNER_TICK_MS: u64 = 100;

/// What one task step stands for in a workflow phase.
fn unit_for(phase: &str) -> &'static str {
    match phase {
        FROZEN_PHONON_PHASE => "phonons",
        DEFOCUS_SERIES_PHASE => "phonon x defocus realizations",
        _ => "steps",
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseTiming {
    pub name: &'static str,
    pub elapsed: Duration,
}

struct RunDisplay {
    bar: ProgressBar,
    current: Option<(&'static str, Instant)>,
    completed: Vec<PhaseTiming>,
}

impl RunDisplay {
    fn apply(&mut self, event: Progress) {
        match event {
            Progress::PhaseStart { name } => {
                self.bar.reset();
                self.bar.set_length(0);
                self.bar.set_style(spinner_style());
                self.bar.set_prefix(name);
                self.bar.set_message("");
                self.bar
                    .enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
                self.current = Some((name, Instant::now()));
            }
            Progress::TaskStart { total_steps } => {
                let unit = self.current.map_or("steps", |(name, _)| unit_for(name));
                self.bar.disable_steady_tick();
                self.bar.reset();
                self.bar.set_length(total_steps);
                self.bar.set_style(bar_style(unit));
            }
            Progress::TaskIncrement => self.bar.inc(1),
            Progress::TaskFinish => {
                if let Some(total) = self.bar.length() {
                    self.bar.set_position(total.max(self.bar.position()));
                }
            }
            // Phonon index and, in a series, the defocus tag being imaged.
            Progress::StatusUpdate { text } => self.bar.set_message(text),
            Progress::PhaseFinish => {
                self.bar.disable_steady_tick();
                if let Some((name, started)) = self.current.take() {
                    let elapsed = started.elapsed();
                    self.bar
                        .println(format!("✓ {} ({:.1}s)", name, elapsed.as_secs_f64()));
                    self.completed.push(PhaseTiming { name, elapsed });
                }
                self.bar.set_message("");
            }
            Progress::Message(text) => self.bar.println(format!("  {}", text)),
        }
    }
}

/// Terminal view of a simulation run: one line per finished phase with its
/// wall time, and a bar counting realizations while phonons are running.
#[derive(Clone)]
pub struct SimulationProgress {
    display: Arc<Mutex<RunDisplay>>,
}

impl SimulationProgress {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), target).with_style(spinner_style());
        Self {
            display: Arc::new(Mutex::new(RunDisplay {
                bar,
                current: None,
                completed: Vec::new(),
            })),
        }
    }

    pub fn callback(&self) -> ProgressCallback<'static> {
        let display = Arc::clone(&self.display);
        Box::new(move |event| match display.lock() {
            Ok(mut display) => display.apply(event),
            Err(_) => warn!("Progress display lock was poisoned; dropping event."),
        })
    }

    /// Clears the bar and returns the wall time of every finished phase.
    pub fn finish(&self) -> Vec<PhaseTiming> {
        match self.display.lock() {
            Ok(display) => {
                display.bar.finish_and_clear();
                display.completed.clone()
            }
            Err(_) => Vec::new(),
        }
    }
}

impl Default for SimulationProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style(unit: &str) -> ProgressStyle {
    let template = format!(
        "{{prefix:.bold}} [{{bar:32.cyan/blue}}] {{pos}}/{{len}} {} | {{msg}} (eta {{eta}})",
        unit
    );
    ProgressStyle::with_template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}
