/// Events emitted by a running simulation for display by a front end.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    PhaseStart { name: &'static str },
    PhaseFinish,

    /// A counted task begins, e.g. one step per frozen phonon or per
    /// `(phonon, series point)` pair.
    TaskStart { total_steps: u64 },
    TaskIncrement,
    TaskFinish,

    /// Short description of what the current task is doing.
    StatusUpdate { text: String },
    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

/// Forwards progress events to an optional callback; silent without one.
#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        if self.callback.is_some() {
            self.report(Progress::StatusUpdate { text: text.into() });
        }
    }
}
