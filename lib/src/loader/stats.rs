//! Per graph and per predicate usage counts collected during a load.
//!
//! They are only trustworthy when the load started from empty tables, so they are only written
//! for such loads. The artifact is consumed by query planners.

use crate::storage::{Decoder, StorageError, TermDictionary, TermId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// File name of the statistics artifact in the store directory.
pub const STATISTICS_FILE: &str = "stats.json";

/// Key of a counter: the graph (`None` for the default graph) and the predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct GraphPredicateKey {
    graph: Option<TermId>,
    predicate: TermId,
}

/// Accumulates the counts of a load session, on identifiers.
#[derive(Default, Debug)]
pub struct LoadStatistics {
    counts: HashMap<GraphPredicateKey, u64>,
    total: u64,
}

impl LoadStatistics {
    pub fn record(&mut self, graph: Option<TermId>, predicate: TermId) {
        *self
            .counts
            .entry(GraphPredicateKey { graph, predicate })
            .or_default() += 1;
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Resolves the identifiers and builds the persisted form of the counts.
    pub fn summarize(&self, dictionary: &TermDictionary) -> Result<StatisticsSummary, StorageError> {
        let mut graphs = BTreeMap::<Option<String>, GraphStatistics>::new();
        for (key, count) in &self.counts {
            let graph = key
                .graph
                .map(|graph| dictionary.decode_graph_name(graph))
                .transpose()?
                .map(|graph| graph.to_string());
            let predicate = dictionary.decode_named_node(key.predicate)?.to_string();
            let entry = graphs.entry(graph.clone()).or_insert_with(|| GraphStatistics {
                graph,
                total: 0,
                predicates: BTreeMap::new(),
            });
            entry.total += count;
            *entry.predicates.entry(predicate).or_default() += count;
        }
        Ok(StatisticsSummary {
            generated: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .map_err(|e| StorageError::Other(Box::new(e)))?,
            total: self.total,
            graphs: graphs.into_values().collect(),
        })
    }
}

/// The persisted statistics of a load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSummary {
    /// UTC timestamp, RFC 3339.
    pub generated: String,
    pub total: u64,
    pub graphs: Vec<GraphStatistics>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatistics {
    /// N-Triples form of the graph name, `None` for the default graph.
    pub graph: Option<String>,
    pub total: u64,
    /// Counts keyed by the N-Triples form of the predicate.
    pub predicates: BTreeMap<String, u64>,
}

impl StatisticsSummary {
    /// Count of a predicate, given in N-Triples syntax, over every graph.
    pub fn predicate_count(&self, predicate: &str) -> u64 {
        self.graphs
            .iter()
            .filter_map(|graph| graph.predicates.get(predicate))
            .sum()
    }

    /// Writes the summary to `path`, replacing any previous file.
    pub fn write(&self, path: &Path) -> Result<(), StorageError> {
        let tmp = path.with_extension("json.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| StorageError::Other(Box::new(e)))?;
        writer.write_all(b"\n")?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| StorageError::Other(Box::new(e)))
    }
}
