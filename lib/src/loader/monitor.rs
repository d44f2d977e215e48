//! Progress reporting of the bulk load phases.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Callback receiving the progress events of a load.
pub type ProgressHook = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Granularity of the progress reports of one phase.
///
/// A batch report is emitted every `tick` items and an elapsed time report every
/// `tick * supertick` items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorOptions {
    pub enabled: bool,
    pub tick: u64,
    pub supertick: u64,
}

impl MonitorOptions {
    pub const DATA_TICK: u64 = 50_000;
    pub const DATA_SUPERTICK: u64 = 10;
    pub const INDEX_TICK: u64 = 100_000;
    pub const INDEX_SUPERTICK: u64 = 5;

    pub const fn data_phase() -> Self {
        Self {
            enabled: true,
            tick: Self::DATA_TICK,
            supertick: Self::DATA_SUPERTICK,
        }
    }

    pub const fn index_phase() -> Self {
        Self {
            enabled: true,
            tick: Self::INDEX_TICK,
            supertick: Self::INDEX_SUPERTICK,
        }
    }

    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::data_phase()
        }
    }

    pub fn with_tick(mut self, tick: u64, supertick: u64) -> Self {
        self.tick = tick;
        self.supertick = supertick;
        self
    }
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self::data_phase()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    PhaseStarted {
        label: Arc<str>,
        overall: Duration,
    },
    /// Emitted every `tick` items.
    Batch {
        label: Arc<str>,
        total: u64,
        /// Items per second over the last batch.
        batch_rate: f64,
        /// Items per second since the phase started.
        average_rate: f64,
    },
    /// Emitted every `tick * supertick` items.
    Elapsed {
        label: Arc<str>,
        total: u64,
        elapsed: Duration,
    },
    PhaseFinished {
        label: Arc<str>,
        total: u64,
        elapsed: Duration,
        overall: Duration,
    },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PhaseStarted { label, .. } => write!(f, "{label}: start"),
            Self::Batch {
                label,
                total,
                batch_rate,
                average_rate,
            } => write!(
                f,
                "{label}: {total} (batch: {batch_rate:.0}/s, avg: {average_rate:.0}/s)"
            ),
            Self::Elapsed {
                label,
                total,
                elapsed,
            } => write!(f, "{label}: {total} in {:.2}s", elapsed.as_secs_f64()),
            Self::PhaseFinished {
                label,
                total,
                elapsed,
                overall,
            } => write!(
                f,
                "{label}: finished {total} in {:.2}s (overall {:.2}s)",
                elapsed.as_secs_f64(),
                overall.as_secs_f64()
            ),
        }
    }
}

/// The settings and callbacks shared by every monitor of a load.
#[derive(Clone)]
pub struct ProgressReporter {
    options: MonitorOptions,
    hooks: Vec<ProgressHook>,
    overall_start: Instant,
}

impl ProgressReporter {
    pub fn new(options: MonitorOptions) -> Self {
        Self {
            options,
            hooks: Vec::new(),
            overall_start: Instant::now(),
        }
    }

    pub fn on_progress(mut self, hook: ProgressHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub(crate) fn with_hooks(mut self, hooks: Vec<ProgressHook>) -> Self {
        self.hooks = hooks;
        self
    }

    pub(crate) fn since(mut self, overall_start: Instant) -> Self {
        self.overall_start = overall_start;
        self
    }

    pub fn options(&self) -> MonitorOptions {
        self.options
    }

    /// A new monitor reporting under `label`.
    pub fn monitor(&self, label: impl Into<Arc<str>>) -> LoadMonitor {
        LoadMonitor::new(label, self.clone())
    }
}

/// Counts the items of a phase and reports the progress at tick boundaries.
pub struct LoadMonitor {
    label: Arc<str>,
    reporter: ProgressReporter,
    total: u64,
    batch_count: u64,
    phase_start: Instant,
    batch_start: Instant,
}

impl LoadMonitor {
    pub fn new(label: impl Into<Arc<str>>, reporter: ProgressReporter) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            reporter,
            total: 0,
            batch_count: 0,
            phase_start: now,
            batch_start: now,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of completed batches.
    pub fn batches(&self) -> u64 {
        self.batch_count
    }

    pub fn start(&mut self) {
        let now = Instant::now();
        self.phase_start = now;
        self.batch_start = now;
        self.total = 0;
        self.batch_count = 0;
        if self.reporter.options.enabled {
            info!(phase = %self.label, "phase started");
            self.emit(&ProgressEvent::PhaseStarted {
                label: self.label.clone(),
                overall: self.reporter.overall_start.elapsed(),
            });
        }
    }

    /// Counts one item. Boundaries are exact multiples of the tick, so items must be reported
    /// one at a time.
    pub fn tick(&mut self) {
        let options = self.reporter.options;
        if !options.enabled {
            return;
        }
        self.total += 1;
        let tick = options.tick.max(1);
        if self.total % tick != 0 {
            return;
        }
        self.batch_count += 1;
        let now = Instant::now();
        let batch_rate = rate(tick, now - self.batch_start);
        let average_rate = rate(self.total, now - self.phase_start);
        self.batch_start = now;
        info!(
            phase = %self.label,
            total = self.total,
            batch_rate = batch_rate as u64,
            average_rate = average_rate as u64,
            "progress"
        );
        self.emit(&ProgressEvent::Batch {
            label: self.label.clone(),
            total: self.total,
            batch_rate,
            average_rate,
        });
        if self.batch_count % options.supertick.max(1) == 0 {
            let elapsed = now - self.phase_start;
            info!(
                phase = %self.label,
                total = self.total,
                elapsed_secs = elapsed.as_secs_f64(),
                "elapsed"
            );
            self.emit(&ProgressEvent::Elapsed {
                label: self.label.clone(),
                total: self.total,
                elapsed,
            });
        }
    }

    /// Ends the phase and returns the number of counted items.
    pub fn finish(&mut self) -> u64 {
        if self.reporter.options.enabled {
            let elapsed = self.phase_start.elapsed();
            let overall = self.reporter.overall_start.elapsed();
            info!(
                phase = %self.label,
                total = self.total,
                elapsed_secs = elapsed.as_secs_f64(),
                overall_secs = overall.as_secs_f64(),
                average_rate = rate(self.total, elapsed) as u64,
                "phase finished"
            );
            self.emit(&ProgressEvent::PhaseFinished {
                label: self.label.clone(),
                total: self.total,
                elapsed,
                overall,
            });
        }
        self.total
    }

    fn emit(&self, event: &ProgressEvent) {
        for hook in &self.reporter.hooks {
            hook(event);
        }
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
