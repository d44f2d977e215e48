//! Strategies filling detached secondary indexes from a primary index.

use crate::loader::error::LoaderError;
use crate::loader::monitor::ProgressReporter;
use crate::storage::{EncodedTuple, StorageError, TupleIndex};
use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::thread;
use sysinfo::{System, SystemExt};
use tracing::{error, info, info_span, warn, Span};

const BUILD_BATCH_SIZE: usize = 4096;

/// How the secondary indexes are filled once the data phase is over.
///
/// All the strategies produce the same tuple sets. They only differ by their resource use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexBuildStrategy {
    /// One scan of the primary index per secondary index. Lowest peak resource use.
    #[default]
    Sequential,
    /// A single scan of the primary index feeding every secondary index at once.
    ///
    /// All the secondary indexes are written simultaneously, which may be very resource heavy.
    Interleaved,
    /// One worker thread per secondary index, each scanning the primary index on its own.
    Parallel,
}

impl IndexBuildStrategy {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Interleaved => "interleaved",
            Self::Parallel => "parallel",
        }
    }

    /// Empties `secondaries` and fills them with the tuples of `primary`.
    ///
    /// Each rebuilt index is synced. Returns the size of each rebuilt index, in the order of
    /// `secondaries`.
    pub fn build(
        self,
        primary: &TupleIndex,
        secondaries: &[TupleIndex],
        progress: &ProgressReporter,
    ) -> Result<Vec<BuiltIndex>, LoaderError> {
        if secondaries.is_empty() {
            return Ok(Vec::new());
        }
        for index in secondaries {
            if index.width() != primary.width() {
                return Err(LoaderError::IndexBuild {
                    index: index.name().into(),
                    source: StorageError::Config(format!(
                        "the index can't be built from {} that has another width",
                        primary.name()
                    )),
                });
            }
        }
        let span = info_span!(
            "index_build",
            strategy = self.name(),
            primary = primary.name(),
            indexes = secondaries.len()
        );
        let _enter = span.enter();
        let built = match self {
            Self::Sequential => build_sequential(primary, secondaries, progress),
            Self::Interleaved => build_interleaved(primary, secondaries, progress),
            Self::Parallel => build_parallel(primary, secondaries, progress),
        }?;
        info!(
            indexes = %built.iter().map(|b| b.name.as_str()).collect::<Vec<_>>().join(","),
            "secondary indexes built"
        );
        Ok(built)
    }
}

impl fmt::Display for IndexBuildStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IndexBuildStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "interleaved" => Ok(Self::Interleaved),
            "parallel" => Ok(Self::Parallel),
            _ => Err(format!(
                "unknown index build strategy {s}, expected sequential, interleaved or parallel"
            )),
        }
    }
}

/// A secondary index filled by a build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltIndex {
    pub name: String,
    pub tuples: usize,
}

fn build_sequential(
    primary: &TupleIndex,
    secondaries: &[TupleIndex],
    progress: &ProgressReporter,
) -> Result<Vec<BuiltIndex>, LoaderError> {
    secondaries
        .iter()
        .map(|index| {
            copy_index(primary, index, progress).map_err(|source| LoaderError::IndexBuild {
                index: index.name().into(),
                source,
            })
        })
        .collect()
}

fn copy_index(
    primary: &TupleIndex,
    index: &TupleIndex,
    progress: &ProgressReporter,
) -> Result<BuiltIndex, StorageError> {
    index.clear()?;
    let mut monitor = progress.monitor(index.name());
    monitor.start();
    let mut batch = Vec::with_capacity(BUILD_BATCH_SIZE);
    for tuple in primary.all() {
        batch.push(tuple?);
        monitor.tick();
        if batch.len() == BUILD_BATCH_SIZE {
            index.add_batch(&batch)?;
            batch.clear();
        }
    }
    index.add_batch(&batch)?;
    monitor.finish();
    index.sync()?;
    Ok(BuiltIndex {
        name: index.name().into(),
        tuples: index.len()?,
    })
}

fn build_interleaved(
    primary: &TupleIndex,
    secondaries: &[TupleIndex],
    progress: &ProgressReporter,
) -> Result<Vec<BuiltIndex>, LoaderError> {
    let failed = |index: &TupleIndex| {
        let index = index.name().to_owned();
        move |source: StorageError| LoaderError::IndexBuild { index, source }
    };
    for index in secondaries {
        index.clear().map_err(failed(index))?;
    }
    let label = secondaries
        .iter()
        .map(TupleIndex::name)
        .collect::<Vec<_>>()
        .join("+");
    let mut monitor = progress.monitor(label);
    monitor.start();
    let mut batch: Vec<EncodedTuple> = Vec::with_capacity(BUILD_BATCH_SIZE);
    let mut primary_scan = primary.all();
    loop {
        let tuple = primary_scan.next().transpose().map_err(failed(primary))?;
        let done = tuple.is_none();
        if let Some(tuple) = tuple {
            batch.push(tuple);
            monitor.tick();
        }
        // every secondary index receives the batch before the scan moves on
        if batch.len() == BUILD_BATCH_SIZE || done {
            for index in secondaries {
                index.add_batch(&batch).map_err(failed(index))?;
            }
            batch.clear();
        }
        if done {
            break;
        }
    }
    monitor.finish();
    secondaries
        .iter()
        .map(|index| {
            index.sync().map_err(failed(index))?;
            Ok(BuiltIndex {
                name: index.name().into(),
                tuples: index.len().map_err(failed(index))?,
            })
        })
        .collect()
}

fn build_parallel(
    primary: &TupleIndex,
    secondaries: &[TupleIndex],
    progress: &ProgressReporter,
) -> Result<Vec<BuiltIndex>, LoaderError> {
    let system = System::new_all();
    if let Some(cores) = system.physical_core_count() {
        if secondaries.len() > cores {
            warn!(
                workers = secondaries.len(),
                cores, "more index build workers than physical cores"
            );
        }
    }
    let span = Span::current();
    thread::scope(|scope| {
        let workers = secondaries
            .iter()
            .map(|index| {
                let span = span.clone();
                let worker = thread::Builder::new()
                    .name(format!("build-{}", index.name()))
                    .spawn_scoped(scope, move || {
                        let _enter = span.enter();
                        copy_index(primary, index, progress)
                    });
                (index, worker)
            })
            .collect::<Vec<_>>();

        // Every worker is joined, whatever the outcome of the others
        let mut built = Vec::with_capacity(workers.len());
        let mut failure = None;
        for (index, worker) in workers {
            let result = match worker {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|panic| Err(panic_error(panic))),
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(index) => built.push(index),
                Err(source) => {
                    error!(index = index.name(), error = %source, "index build worker failed");
                    failure.get_or_insert(LoaderError::IndexBuild {
                        index: index.name().into(),
                        source,
                    });
                }
            }
        }
        match failure {
            Some(failure) => Err(failure),
            None => Ok(built),
        }
    })
}

fn panic_error(panic: Box<dyn Any + Send>) -> StorageError {
    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    };
    StorageError::Other(format!("the index build worker panicked: {message}").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::monitor::MonitorOptions;
    use crate::model::{NamedNode, TermRef};
    use crate::store::Store;
    use std::collections::BTreeSet;

    fn filled_store(size: usize) -> Store {
        let store = Store::new().unwrap();
        let node = |i: usize| NamedNode::new_unchecked(format!("http://example.com/{i}"));
        for i in 0..size {
            let (s, p, o) = (node(i % 97), node(i % 7), node(i));
            store
                .triples()
                .add(&[
                    TermRef::from(s.as_ref()),
                    TermRef::from(p.as_ref()),
                    TermRef::from(o.as_ref()),
                ])
                .unwrap();
        }
        store
    }

    fn content(index: &TupleIndex) -> BTreeSet<EncodedTuple> {
        index.all().collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn test_strategies_build_identical_indexes() {
        let progress = ProgressReporter::new(MonitorOptions::disabled());
        let mut results = Vec::new();
        for strategy in [
            IndexBuildStrategy::Sequential,
            IndexBuildStrategy::Interleaved,
            IndexBuildStrategy::Parallel,
        ] {
            let store = filled_store(BUILD_BATCH_SIZE + 123);
            let table = store.triples();
            let expected = content(table.primary());
            for index in table.secondaries() {
                index.clear().unwrap();
            }
            let built = strategy
                .build(table.primary(), table.secondaries(), &progress)
                .unwrap();
            assert_eq!(built.len(), 2);
            assert!(built.iter().all(|b| b.tuples == expected.len()));
            for index in table.secondaries() {
                assert_eq!(content(index), expected, "{strategy} {}", index.name());
            }
            results.push(
                table
                    .secondaries()
                    .iter()
                    .map(content)
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[test]
    fn test_build_replaces_stale_content() {
        let store = filled_store(10);
        let table = store.triples();
        let stale = EncodedTuple::new(vec![
            crate::storage::TermId::new(1),
            crate::storage::TermId::new(2),
            crate::storage::TermId::new(3),
        ]);
        table.secondaries()[0].add(&stale).unwrap();
        IndexBuildStrategy::Sequential
            .build(
                table.primary(),
                table.secondaries(),
                &ProgressReporter::new(MonitorOptions::disabled()),
            )
            .unwrap();
        assert!(!table.secondaries()[0].contains(&stale).unwrap());
        assert_eq!(table.secondaries()[0].len().unwrap(), 10);
    }

    #[test]
    fn test_width_mismatch_names_the_index() {
        let store = filled_store(1);
        let result = IndexBuildStrategy::Parallel.build(
            store.triples().primary(),
            store.quads().secondaries(),
            &ProgressReporter::new(MonitorOptions::disabled()),
        );
        match result {
            Err(LoaderError::IndexBuild { index, .. }) => assert_eq!(index, "quads_gpos"),
            _ => panic!("the build should fail"),
        }
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("Parallel".parse(), Ok(IndexBuildStrategy::Parallel));
        assert_eq!(
            IndexBuildStrategy::Interleaved
                .to_string()
                .parse::<IndexBuildStrategy>(),
            Ok(IndexBuildStrategy::Interleaved)
        );
        assert!("random".parse::<IndexBuildStrategy>().is_err());
        assert_eq!(IndexBuildStrategy::default(), IndexBuildStrategy::Sequential);
    }

    #[test]
    fn test_panic_message_is_kept() {
        let error = panic_error(Box::new("boom"));
        assert!(error.to_string().contains("boom"));
    }
}
