//! Bulk loading of statements into a [`Store`](crate::store::Store).
//!
//! A load goes through explicit phases:
//! * `Data`: statements are encoded and appended to the primary indexes. If the target tables
//!   were empty when the load started, their secondary indexes are detached for the whole phase.
//! * `Index`: the detached secondary indexes are rebuilt from the primary ones with the chosen
//!   [`IndexBuildStrategy`].
//! * `Idle`: everything is synced and, for loads that started empty, the statistics are written.
//!
//! [`BulkLoader::with_incremental`] keeps the secondary indexes attached during the data phase,
//! which skips the index phase. [`BulkLoader::with_statistics`] turns the statistics off.
//!
//! ```
//! use oxtdb::loader::LoadTarget;
//! use oxtdb::model::*;
//! use oxtdb::store::Store;
//!
//! let store = Store::new()?;
//! let ex = NamedNode::new("http://example.com")?;
//! let mut session = store
//!     .bulk_loader()
//!     .with_target(LoadTarget::DefaultGraph)
//!     .start()?;
//! session.add(&Quad::new(ex.clone(), ex.clone(), ex.clone(), GraphName::DefaultGraph))?;
//! let report = session.finish()?;
//! assert_eq!(report.tuples_added, 1);
//! assert!(report.started_empty);
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

pub use crate::loader::builder::{BuiltIndex, IndexBuildStrategy};
pub use crate::loader::error::LoaderError;
pub use crate::loader::monitor::{
    LoadMonitor, MonitorOptions, ProgressEvent, ProgressHook, ProgressReporter,
};
pub use crate::loader::stats::{
    GraphStatistics, LoadStatistics, StatisticsSummary, STATISTICS_FILE,
};

use crate::model::{GraphNameRef, NamedNode, Quad, QuadRef, TermRef, TripleRef};
use crate::storage::{Storage, StorageError, TupleTable};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

mod builder;
mod error;
mod monitor;
mod stats;

/// The phases of a load session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadPhase {
    Idle,
    Data,
    Index,
}

impl LoadPhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Data => "data",
            Self::Index => "index",
        }
    }

    /// Legal transitions: `Idle → Data`, `Data → Index`, `Data → Idle` and `Index → Idle`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Data)
                | (Self::Data, Self::Index)
                | (Self::Data, Self::Idle)
                | (Self::Index, Self::Idle)
        )
    }

    pub fn transition(self, next: Self) -> Result<Self, LoaderError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(LoaderError::InvalidPhase {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the loaded statements go.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum LoadTarget {
    /// Only triples are accepted. A quad in a named graph is rejected.
    DefaultGraph,
    /// Every statement goes to this graph. A quad in another named graph is rejected.
    NamedGraph(NamedNode),
    /// Triples go to the default graph and quads to their named graph.
    #[default]
    Dataset,
}

impl LoadTarget {
    fn tables<'a>(&self, storage: &'a Storage) -> Vec<&'a TupleTable> {
        match self {
            Self::DefaultGraph => vec![storage.triples()],
            Self::NamedGraph(_) => vec![storage.quads()],
            Self::Dataset => vec![storage.triples(), storage.quads()],
        }
    }
}

impl fmt::Display for LoadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefaultGraph => f.write_str("default graph"),
            Self::NamedGraph(graph) => write!(f, "graph {graph}"),
            Self::Dataset => f.write_str("dataset"),
        }
    }
}

/// What happened to the statistics of a load.
#[derive(Debug)]
pub enum StatisticsOutcome {
    /// Written to this file.
    Written(PathBuf),
    /// Kept in the report only, the store has no directory.
    Collected,
    /// The load did not start empty so the statistics are not trustworthy, or they were
    /// disabled with [`BulkLoader::with_statistics`].
    Discarded,
    /// The statistics could not be written. The loaded data is not affected.
    Failed(StorageError),
}

/// Summary of a finished load.
#[derive(Debug)]
pub struct LoadReport {
    pub target: LoadTarget,
    /// Number of statements given to the session.
    pub statements: u64,
    /// Number of tuples that were not already in the store.
    pub tuples_added: u64,
    pub started_empty: bool,
    pub strategy: IndexBuildStrategy,
    /// The secondary indexes rebuilt during the index phase.
    pub indexes: Vec<BuiltIndex>,
    pub data_phase: Duration,
    pub index_phase: Duration,
    pub statistics: Option<StatisticsSummary>,
    pub statistics_outcome: StatisticsOutcome,
}

/// A bulk loader configured from a [`Store`](crate::store::Store).
///
/// The store must not be read or written by anyone else while a load is running.
#[must_use]
#[derive(Clone)]
pub struct BulkLoader {
    storage: Storage,
    target: LoadTarget,
    strategy: IndexBuildStrategy,
    data_progress: MonitorOptions,
    index_progress: MonitorOptions,
    hooks: Vec<ProgressHook>,
    incremental: bool,
    statistics: bool,
}

impl BulkLoader {
    pub(crate) fn new(storage: Storage) -> Self {
        Self {
            storage,
            target: LoadTarget::default(),
            strategy: IndexBuildStrategy::default(),
            data_progress: MonitorOptions::data_phase(),
            index_progress: MonitorOptions::index_phase(),
            hooks: Vec::new(),
            incremental: false,
            statistics: true,
        }
    }

    pub fn with_target(mut self, target: LoadTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_strategy(mut self, strategy: IndexBuildStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the progress reporting of the data phase.
    pub fn with_progress(mut self, options: MonitorOptions) -> Self {
        self.data_progress = options;
        self
    }

    /// Sets the progress reporting of the index phase.
    pub fn with_index_progress(mut self, options: MonitorOptions) -> Self {
        self.index_progress = options;
        self
    }

    /// Disables progress reporting. The loaded data is not affected.
    pub fn without_progress(self) -> Self {
        self.with_progress(MonitorOptions::disabled())
            .with_index_progress(MonitorOptions::disabled())
    }

    /// Keeps the secondary indexes attached during the data phase even if the target tables
    /// are empty. Every statement is then written to every index and there is no index phase.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Enables or disables the collection of the load statistics. Enabled by default.
    pub fn with_statistics(mut self, statistics: bool) -> Self {
        self.statistics = statistics;
        self
    }

    /// Adds a callback receiving every progress event.
    pub fn on_progress(mut self, callback: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.hooks.push(Arc::new(callback));
        self
    }

    /// Starts a session in the data phase.
    pub fn start(&self) -> Result<LoadSession, LoaderError> {
        let started = Instant::now();
        let phase = LoadPhase::Idle.transition(LoadPhase::Data)?;
        let mut started_empty = true;
        for table in self.target.tables(&self.storage) {
            started_empty &= table.is_empty()?;
        }
        let detached = started_empty && !self.incremental;
        if detached {
            for table in self.target.tables(&self.storage) {
                self.storage.detach_secondaries(table)?;
            }
        }
        info!(
            target = %self.target,
            started_empty,
            incremental = self.incremental,
            strategy = %self.strategy,
            "bulk load started"
        );
        let mut monitor = ProgressReporter::new(self.data_progress)
            .with_hooks(self.hooks.clone())
            .since(started)
            .monitor(LoadPhase::Data.name());
        monitor.start();
        Ok(LoadSession {
            storage: self.storage.clone(),
            target: self.target.clone(),
            strategy: self.strategy,
            index_reporter: ProgressReporter::new(self.index_progress)
                .with_hooks(self.hooks.clone())
                .since(started),
            phase,
            failed: false,
            started_empty,
            detached,
            collect_statistics: started_empty && self.statistics,
            statements: 0,
            tuples_added: 0,
            statistics: LoadStatistics::default(),
            monitor,
            data_started: started,
        })
    }

    /// Loads a whole stream of quads in one session.
    ///
    /// The first error of the stream aborts the load, leaving the store partially loaded.
    pub fn load<EI, EO: From<LoaderError> + From<EI>, I: IntoIterator<Item = Result<Quad, EI>>>(
        &self,
        quads: I,
    ) -> Result<LoadReport, EO> {
        let mut session = self.start()?;
        for quad in quads {
            session.add(&quad?)?;
        }
        Ok(session.finish()?)
    }
}

/// A running load. Dropping it before [`LoadSession::finish`] leaves the store partially loaded.
pub struct LoadSession {
    storage: Storage,
    target: LoadTarget,
    strategy: IndexBuildStrategy,
    index_reporter: ProgressReporter,
    phase: LoadPhase,
    failed: bool,
    started_empty: bool,
    /// The secondary indexes of the target tables are detached until the index phase.
    detached: bool,
    collect_statistics: bool,
    statements: u64,
    tuples_added: u64,
    statistics: LoadStatistics,
    monitor: LoadMonitor,
    data_started: Instant,
}

impl LoadSession {
    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// If the target tables were empty when the session started.
    pub fn started_empty(&self) -> bool {
        self.started_empty
    }

    pub fn statements(&self) -> u64 {
        self.statements
    }

    /// Loads one statement.
    ///
    /// A statement that does not fit the target is rejected before anything is written and the
    /// session can't be used anymore.
    pub fn add<'a>(&mut self, quad: impl Into<QuadRef<'a>>) -> Result<(), LoaderError> {
        self.ensure_loading()?;
        self.statements += 1;
        let result = self.load_statement(quad.into());
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Loads a triple of the default graph.
    pub fn add_triple<'a>(&mut self, triple: impl Into<TripleRef<'a>>) -> Result<(), LoaderError> {
        let triple = triple.into();
        self.add(QuadRef::new(
            triple.subject,
            triple.predicate,
            triple.object,
            GraphNameRef::DefaultGraph,
        ))
    }

    pub fn add_all<'a>(
        &mut self,
        quads: impl IntoIterator<Item = impl Into<QuadRef<'a>>>,
    ) -> Result<(), LoaderError> {
        for quad in quads {
            self.add(quad)?;
        }
        Ok(())
    }

    fn load_statement(&mut self, quad: QuadRef<'_>) -> Result<(), LoaderError> {
        let statement = self.statements;
        let rejected = |message: String| LoaderError::InvalidStatement { statement, message };
        let graph: Option<TermRef<'_>> = match (&self.target, quad.graph_name) {
            (LoadTarget::DefaultGraph | LoadTarget::Dataset, GraphNameRef::DefaultGraph) => None,
            (LoadTarget::DefaultGraph, graph) => {
                return Err(rejected(format!(
                    "a quad in {graph} can't be loaded into the default graph"
                )))
            }
            (LoadTarget::NamedGraph(target), GraphNameRef::DefaultGraph) => {
                Some(target.as_ref().into())
            }
            (LoadTarget::NamedGraph(target), GraphNameRef::NamedNode(graph))
                if graph == target.as_ref() =>
            {
                Some(graph.into())
            }
            (LoadTarget::NamedGraph(target), graph) => {
                return Err(rejected(format!(
                    "a quad in {graph} can't be loaded into the graph {target}"
                )))
            }
            (LoadTarget::Dataset, GraphNameRef::NamedNode(graph)) => Some(graph.into()),
            (LoadTarget::Dataset, GraphNameRef::BlankNode(graph)) => Some(graph.into()),
        };
        let failed = |source| LoaderError::Statement { statement, source };

        let (table, tuple) = if let Some(graph) = graph {
            let table = self.storage.quads();
            let terms = [
                graph,
                quad.subject.into(),
                quad.predicate.into(),
                quad.object,
            ];
            (table, table.encode(&terms).map_err(failed)?)
        } else {
            let table = self.storage.triples();
            let terms = [quad.subject.into(), quad.predicate.into(), quad.object];
            (table, table.encode(&terms).map_err(failed)?)
        };
        if table.add_encoded(&tuple).map_err(failed)? {
            self.tuples_added += 1;
            if self.collect_statistics {
                match *tuple {
                    [graph, _, predicate, _] => self.statistics.record(Some(graph), predicate),
                    [_, predicate, _] => self.statistics.record(None, predicate),
                    _ => (),
                }
            }
        }
        self.monitor.tick();
        Ok(())
    }

    /// Ends the data phase, builds the detached secondary indexes and syncs the store.
    pub fn finish(mut self) -> Result<LoadReport, LoaderError> {
        self.ensure_loading()?;
        let data_phase = self.data_started.elapsed();
        self.monitor.finish();

        let index_started = Instant::now();
        let indexes = match self.index_phase() {
            Ok(indexes) => indexes,
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };
        let index_phase = index_started.elapsed();
        self.storage.flush()?;

        let (statistics, statistics_outcome) = self.statistics();
        info!(
            statements = self.statements,
            tuples_added = self.tuples_added,
            data_phase_secs = data_phase.as_secs_f64(),
            index_phase_secs = index_phase.as_secs_f64(),
            "bulk load finished"
        );
        Ok(LoadReport {
            target: self.target.clone(),
            statements: self.statements,
            tuples_added: self.tuples_added,
            started_empty: self.started_empty,
            strategy: self.strategy,
            indexes,
            data_phase,
            index_phase,
            statistics,
            statistics_outcome,
        })
    }

    fn index_phase(&mut self) -> Result<Vec<BuiltIndex>, LoaderError> {
        let mut indexes = Vec::new();
        if self.detached && self.statements > 0 {
            self.transition(LoadPhase::Index)?;
            let mut monitor = self.index_reporter.monitor(LoadPhase::Index.name());
            monitor.start();
            for table in self.target.tables(&self.storage) {
                let detached = table.detached_secondaries();
                indexes.extend(self.strategy.build(
                    table.primary(),
                    &detached,
                    &self.index_reporter,
                )?);
                self.storage.reattach(table, &detached)?;
            }
            monitor.finish();
        } else if self.detached {
            // nothing has been loaded, the detached indexes are as empty as the primary ones
            for table in self.target.tables(&self.storage) {
                self.storage.reattach(table, &table.detached_secondaries())?;
            }
        }
        self.transition(LoadPhase::Idle)?;
        Ok(indexes)
    }

    fn statistics(&self) -> (Option<StatisticsSummary>, StatisticsOutcome) {
        if !self.collect_statistics {
            return (None, StatisticsOutcome::Discarded);
        }
        let summary = match self.statistics.summarize(self.storage.dictionary()) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "the load statistics could not be computed");
                return (None, StatisticsOutcome::Failed(e));
            }
        };
        let outcome = match self.storage.path() {
            Some(directory) => {
                let path = directory.join(STATISTICS_FILE);
                match summary.write(&path) {
                    Ok(()) => {
                        info!(path = %path.display(), "load statistics written");
                        StatisticsOutcome::Written(path)
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "the load statistics could not be written");
                        StatisticsOutcome::Failed(e)
                    }
                }
            }
            None => StatisticsOutcome::Collected,
        };
        (Some(summary), outcome)
    }

    fn ensure_loading(&self) -> Result<(), LoaderError> {
        if self.failed {
            Err(LoaderError::Aborted)
        } else if self.phase == LoadPhase::Data {
            Ok(())
        } else {
            Err(LoaderError::InvalidPhase {
                from: self.phase,
                to: LoadPhase::Data,
            })
        }
    }

    fn transition(&mut self, next: LoadPhase) -> Result<(), LoaderError> {
        self.phase = self.phase.transition(next)?;
        debug!(phase = %self.phase, "load phase changed");
        Ok(())
    }
}

impl Drop for LoadSession {
    fn drop(&mut self) {
        if self.phase != LoadPhase::Idle {
            warn!(
                phase = %self.phase,
                statements = self.statements,
                failed = self.failed,
                "load session abandoned, the store is partially loaded"
            );
        }
    }
}
