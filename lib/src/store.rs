//! API to access an on-disk or in-memory [RDF dataset](https://www.w3.org/TR/rdf11-concepts/#dfn-rdf-dataset).
//!
//! The entry point of the module is the [`Store`] struct.
//!
//! Usage example:
//! ```
//! use oxtdb::model::*;
//! use oxtdb::store::Store;
//!
//! let store = Store::new()?;
//!
//! // insertion
//! let ex = NamedNode::new("http://example.com")?;
//! let quad = Quad::new(ex.clone(), ex.clone(), ex.clone(), GraphName::DefaultGraph);
//! store.insert(&quad)?;
//!
//! // quad filter
//! let results: Result<Vec<Quad>, _> = store.quads_for_pattern(None, None, None, None).collect();
//! assert_eq!(vec![quad], results?);
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

use crate::loader::{
    BulkLoader, BuiltIndex, IndexBuildStrategy, LoaderError, MonitorOptions, ProgressReporter,
    STATISTICS_FILE,
};
use crate::model::{GraphName, GraphNameRef, NamedNodeRef, Quad, QuadRef, SubjectRef, TermRef};
pub use crate::storage::{CorruptionError, StorageError, StoreOptions};
use crate::storage::{
    Decoder, EncodedTuple, Storage, TermDictionary, TermId, TupleIter, TupleTable,
};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// An on-disk or in-memory [RDF dataset](https://www.w3.org/TR/rdf11-concepts/#dfn-rdf-dataset).
///
/// Triples of the default graph and quads of named graphs are kept in two tables, each with a
/// primary index and a configurable set of secondary indexes. Pattern queries use the index whose
/// order has the longest bound prefix.
///
/// The fast path to fill a store is the [`BulkLoader`] on an empty store.
#[derive(Clone)]
pub struct Store {
    storage: Storage,
}

impl Store {
    /// Creates a temporary [`Store`] that will be deleted after drop.
    pub fn new() -> Result<Self, StorageError> {
        Self::new_with_options(&StoreOptions::default())
    }

    pub fn new_with_options(options: &StoreOptions) -> Result<Self, StorageError> {
        Ok(Self {
            storage: Storage::new(options)?,
        })
    }

    /// Opens a [`Store`] and creates it if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_options(path, &StoreOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: &StoreOptions,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            storage: Storage::open(path.as_ref(), options)?,
        })
    }

    /// Retrieves quads with a filter on each quad component.
    ///
    /// A `None` graph name matches every graph, `Some(GraphNameRef::DefaultGraph)` only the
    /// default graph.
    pub fn quads_for_pattern(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        graph_name: Option<GraphNameRef<'_>>,
    ) -> QuadIter {
        match self.encode_pattern(subject, predicate, object, graph_name) {
            Ok(Some(pattern)) => QuadIter::new(&self.storage, pattern),
            Ok(None) => QuadIter::empty(&self.storage),
            Err(e) => QuadIter::error(&self.storage, e),
        }
    }

    fn encode_pattern(
        &self,
        subject: Option<SubjectRef<'_>>,
        predicate: Option<NamedNodeRef<'_>>,
        object: Option<TermRef<'_>>,
        graph_name: Option<GraphNameRef<'_>>,
    ) -> Result<Option<QuadPattern>, StorageError> {
        let dictionary = self.storage.dictionary();
        let mut ids = [None; 3];
        for (id, term) in ids
            .iter_mut()
            .zip([subject.map(TermRef::from), predicate.map(TermRef::from), object])
        {
            if let Some(term) = term {
                match dictionary.lookup(term)? {
                    Some(found) => *id = Some(found),
                    // An unknown term can't match anything
                    None => return Ok(None),
                }
            }
        }
        let [subject, predicate, object] = ids;
        let graph = match graph_name {
            None => GraphPattern::Any,
            Some(GraphNameRef::DefaultGraph) => GraphPattern::Default,
            Some(GraphNameRef::NamedNode(graph)) => match dictionary.lookup(graph.into())? {
                Some(id) => GraphPattern::Named(id),
                None => return Ok(None),
            },
            Some(GraphNameRef::BlankNode(graph)) => match dictionary.lookup(graph.into())? {
                Some(id) => GraphPattern::Named(id),
                None => return Ok(None),
            },
        };
        Ok(Some(QuadPattern {
            subject,
            predicate,
            object,
            graph,
        }))
    }

    /// Returns all the quads contained in the store.
    pub fn iter(&self) -> QuadIter {
        self.quads_for_pattern(None, None, None, None)
    }

    /// Checks if this store contains a given quad.
    pub fn contains<'a>(&self, quad: impl Into<QuadRef<'a>>) -> Result<bool, StorageError> {
        let (table, terms) = route(&self.storage, quad.into());
        table.contains(&terms)
    }

    /// Returns the number of quads in the store.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.storage.triples().len()? + self.storage.quads().len()?)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.storage.triples().is_empty()? && self.storage.quads().is_empty()?)
    }

    /// Adds a quad to this store. Returns `true` if the quad was not already in the store.
    ///
    /// Every attached index is updated. This is not the fast path to load a lot of data, see
    /// [`Store::bulk_loader`].
    pub fn insert<'a>(&self, quad: impl Into<QuadRef<'a>>) -> Result<bool, StorageError> {
        let (table, terms) = route(&self.storage, quad.into());
        table.add(&terms)
    }

    /// Removes a quad from this store. Returns `true` if the quad was in the store.
    pub fn remove<'a>(&self, quad: impl Into<QuadRef<'a>>) -> Result<bool, StorageError> {
        let (table, terms) = route(&self.storage, quad.into());
        table.remove(&terms)
    }

    /// Creates a bulk loader allowing to load a lot of data quickly into the store.
    ///
    /// Nothing else may read or write the store while a load is running.
    ///
    /// ```
    /// use oxtdb::loader::IndexBuildStrategy;
    /// use oxtdb::model::*;
    /// use oxtdb::store::Store;
    ///
    /// let store = Store::new()?;
    /// let ex = NamedNodeRef::new("http://example.com")?;
    /// let report = store
    ///     .bulk_loader()
    ///     .with_strategy(IndexBuildStrategy::Parallel)
    ///     .load::<std::convert::Infallible, Box<dyn std::error::Error>, _>([Ok(
    ///         QuadRef::new(ex, ex, ex, GraphNameRef::DefaultGraph).into_owned(),
    ///     )])?;
    /// assert_eq!(report.statements, 1);
    /// assert!(store.contains(QuadRef::new(ex, ex, ex, GraphNameRef::DefaultGraph))?);
    /// # Result::<_, Box<dyn std::error::Error>>::Ok(())
    /// ```
    pub fn bulk_loader(&self) -> BulkLoader {
        BulkLoader::new(self.storage.clone())
    }

    /// Rebuilds the secondary indexes left detached by an interrupted load.
    pub fn rebuild_indexes(
        &self,
        strategy: IndexBuildStrategy,
    ) -> Result<Vec<BuiltIndex>, LoaderError> {
        let progress = ProgressReporter::new(MonitorOptions::index_phase());
        let mut built = Vec::new();
        for table in self.storage.tables() {
            let detached = table.detached_secondaries();
            if detached.is_empty() {
                continue;
            }
            info!(table = table.name(), indexes = detached.len(), "rebuilding detached indexes");
            built.extend(strategy.build(table.primary(), &detached, &progress)?);
            self.storage.reattach(table, &detached)?;
        }
        Ok(built)
    }

    /// Names of the secondary indexes that are currently detached.
    pub fn detached_indexes(&self) -> Vec<String> {
        self.storage
            .tables()
            .iter()
            .flat_map(|table| table.detached_secondaries())
            .map(|index| index.name().to_owned())
            .collect()
    }

    /// Flushes all buffers and ensures that all writes are saved on disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.storage.flush()
    }

    /// Validates that all the store invariants held in the data.
    pub fn validate(&self) -> Result<(), StorageError> {
        self.storage.validate()
    }

    /// Path of the statistics written by the last load that started empty, if the store is on
    /// disk.
    pub fn statistics_path(&self) -> Option<PathBuf> {
        self.storage
            .path()
            .map(|directory| directory.join(STATISTICS_FILE))
    }

    pub fn dictionary(&self) -> &TermDictionary {
        self.storage.dictionary()
    }

    /// The table of the default graph.
    pub fn triples(&self) -> &TupleTable {
        self.storage.triples()
    }

    /// The table of the named graphs.
    pub fn quads(&self) -> &TupleTable {
        self.storage.quads()
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in self.iter() {
            writeln!(f, "{} .", t.map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

/// The table of a quad and its terms in the natural order of that table.
fn route<'a, 'b>(storage: &'b Storage, quad: QuadRef<'a>) -> (&'b TupleTable, Vec<TermRef<'a>>) {
    let graph: TermRef<'a> = match quad.graph_name {
        GraphNameRef::DefaultGraph => {
            return (
                storage.triples(),
                vec![quad.subject.into(), quad.predicate.into(), quad.object],
            )
        }
        GraphNameRef::NamedNode(graph) => graph.into(),
        GraphNameRef::BlankNode(graph) => graph.into(),
    };
    (
        storage.quads(),
        vec![graph, quad.subject.into(), quad.predicate.into(), quad.object],
    )
}

enum GraphPattern {
    Any,
    Default,
    Named(TermId),
}

struct QuadPattern {
    subject: Option<TermId>,
    predicate: Option<TermId>,
    object: Option<TermId>,
    graph: GraphPattern,
}

/// An iterator returning the quads contained in a [`Store`].
pub struct QuadIter {
    dictionary: TermDictionary,
    triples: Option<TupleIter>,
    quads: Option<TupleIter>,
    error: Option<StorageError>,
}

impl QuadIter {
    fn new(storage: &Storage, pattern: QuadPattern) -> Self {
        let QuadPattern {
            subject,
            predicate,
            object,
            graph,
        } = pattern;
        let triples = || storage.triples().find(&[subject, predicate, object]);
        let quads = |graph: Option<TermId>| storage.quads().find(&[graph, subject, predicate, object]);
        let (triples, quads) = match graph {
            GraphPattern::Any => (Some(triples()), Some(quads(None))),
            GraphPattern::Default => (Some(triples()), None),
            GraphPattern::Named(graph) => (None, Some(quads(Some(graph)))),
        };
        Self {
            dictionary: storage.dictionary().clone(),
            triples,
            quads,
            error: None,
        }
    }

    fn empty(storage: &Storage) -> Self {
        Self {
            dictionary: storage.dictionary().clone(),
            triples: None,
            quads: None,
            error: None,
        }
    }

    fn error(storage: &Storage, error: StorageError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(storage)
        }
    }

    fn decode_triple(&self, tuple: &EncodedTuple) -> Result<Quad, StorageError> {
        Ok(Quad::new(
            self.dictionary.decode_subject(tuple[0])?,
            self.dictionary.decode_named_node(tuple[1])?,
            self.dictionary.decode_term(tuple[2])?,
            GraphName::DefaultGraph,
        ))
    }

    fn decode_quad(&self, tuple: &EncodedTuple) -> Result<Quad, StorageError> {
        Ok(Quad::new(
            self.dictionary.decode_subject(tuple[1])?,
            self.dictionary.decode_named_node(tuple[2])?,
            self.dictionary.decode_term(tuple[3])?,
            self.dictionary.decode_graph_name(tuple[0])?,
        ))
    }
}

impl Iterator for QuadIter {
    type Item = Result<Quad, StorageError>;

    fn next(&mut self) -> Option<Result<Quad, StorageError>> {
        if let Some(error) = self.error.take() {
            return Some(Err(error));
        }
        if let Some(triples) = &mut self.triples {
            match triples.next() {
                Some(tuple) => return Some(tuple.and_then(|tuple| self.decode_triple(&tuple))),
                None => self.triples = None,
            }
        }
        let tuple = self.quads.as_mut()?.next()?;
        Some(tuple.and_then(|tuple| self.decode_quad(&tuple)))
    }
}
