//! Seeded synthetic datasets used to exercise the bulk loader.

use oxtdb::model::{BlankNode, GraphName, Literal, NamedNode, Quad, Term};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};

const EX: &str = "http://example.com/";

/// Generates reproducible datasets from a seed.
pub struct DatasetGenerator {
    rng: StdRng,
    subjects: usize,
    predicates: usize,
    graphs: usize,
}

impl DatasetGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            subjects: 1000,
            predicates: 20,
            graphs: 0,
        }
    }

    pub fn with_subjects(mut self, subjects: usize) -> Self {
        self.subjects = subjects.max(1);
        self
    }

    pub fn with_predicates(mut self, predicates: usize) -> Self {
        self.predicates = predicates.max(1);
        self
    }

    /// Number of named graphs. With `0`, everything goes to the default graph.
    pub fn with_graphs(mut self, graphs: usize) -> Self {
        self.graphs = graphs;
        self
    }

    pub fn quads(&mut self, count: usize) -> Vec<Quad> {
        (0..count).map(|i| self.quad(i)).collect()
    }

    fn quad(&mut self, i: usize) -> Quad {
        let subject = NamedNode::new_unchecked(format!(
            "{EX}s{}",
            self.rng.gen_range(0..self.subjects)
        ));
        let predicate = NamedNode::new_unchecked(format!(
            "{EX}p{}",
            self.rng.gen_range(0..self.predicates)
        ));
        let object: Term = match self.rng.gen_range(0..4) {
            0 => NamedNode::new_unchecked(format!("{EX}o{}", self.rng.gen_range(0..self.subjects)))
                .into(),
            1 => Literal::new_language_tagged_literal_unchecked(format!("label {i}"), "en").into(),
            2 => BlankNode::new_unchecked(format!("b{}", self.rng.gen_range(0..100))).into(),
            _ => Literal::from(i as i64).into(),
        };
        let graph = if self.graphs == 0 || self.rng.gen_bool(0.5) {
            GraphName::DefaultGraph
        } else {
            NamedNode::new_unchecked(format!("{EX}g{}", self.rng.gen_range(0..self.graphs))).into()
        };
        Quad::new(subject, predicate, object, graph)
    }
}

/// Number of distinct quads per predicate, keyed by the N-Triples form of the predicate.
pub fn predicate_counts(quads: &[Quad]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for quad in quads.iter().collect::<HashSet<_>>() {
        *counts.entry(quad.predicate.to_string()).or_default() += 1;
    }
    counts
}

/// Number of distinct quads.
pub fn distinct_count(quads: &[Quad]) -> usize {
    quads.iter().collect::<HashSet<_>>().len()
}
