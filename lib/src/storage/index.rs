//! Sorted tuple indexes and the tables grouping them.

use crate::model::{Term, TermRef};
use crate::storage::backend::{ColumnFamily, Db, Iter};
use crate::storage::binary_encoder::IndexOrder;
use crate::storage::dictionary::TermDictionary;
use crate::storage::error::{CorruptionError, StorageError};
use crate::storage::numeric_encoder::{EncodedTuple, TermId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A duplicate-free set of tuples sorted by one column permutation.
///
/// A secondary index may be detached: it is then left out of incremental maintenance and of
/// query planning until it is rebuilt from the primary index.
#[derive(Clone)]
pub struct TupleIndex {
    db: Db,
    cf: ColumnFamily,
    order: IndexOrder,
    attached: Arc<AtomicBool>,
}

impl TupleIndex {
    pub(crate) fn new(db: Db, cf: ColumnFamily, order: IndexOrder) -> Self {
        Self {
            db,
            cf,
            order,
            attached: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn order(&self) -> &IndexOrder {
        &self.order
    }

    /// Name of the backing column family, e.g. `triples_pos`.
    pub fn name(&self) -> &str {
        self.cf.name()
    }

    pub fn width(&self) -> usize {
        self.order.width()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::Release);
    }

    /// Adds a tuple given in natural order. Returns `true` if it was not already there.
    pub fn add(&self, tuple: &[TermId]) -> Result<bool, StorageError> {
        self.check_width(tuple)?;
        self.db.insert_empty(&self.cf, &self.order.encode_key(tuple))
    }

    /// Adds a set of tuples under a single write. Returns the number of new tuples.
    pub fn add_batch<'a>(
        &self,
        tuples: impl IntoIterator<Item = &'a EncodedTuple>,
    ) -> Result<usize, StorageError> {
        let mut keys = Vec::new();
        for tuple in tuples {
            self.check_width(tuple)?;
            keys.push(self.order.encode_key(tuple));
        }
        self.db.insert_empty_batch(&self.cf, keys)
    }

    pub fn remove(&self, tuple: &[TermId]) -> Result<bool, StorageError> {
        self.check_width(tuple)?;
        self.db.remove(&self.cf, &self.order.encode_key(tuple))
    }

    pub fn contains(&self, tuple: &[TermId]) -> Result<bool, StorageError> {
        self.check_width(tuple)?;
        self.db.contains_key(&self.cf, &self.order.encode_key(tuple))
    }

    /// All the tuples, in the order of this index.
    pub fn all(&self) -> TupleIter {
        self.find(&vec![None; self.width()])
    }

    /// The tuples matching `pattern` (in natural order, `None` for a wildcard).
    ///
    /// Only the bound prefix of the pattern in this index order narrows the scan. The other
    /// bound columns are filtered out of the scanned range.
    pub fn find(&self, pattern: &[Option<TermId>]) -> TupleIter {
        let mut prefix = Vec::with_capacity(self.order.key_size());
        self.order.write_prefix(&mut prefix, pattern);
        let filter = if self.order.prefix_len(pattern) < pattern.iter().flatten().count() {
            Some(pattern.into())
        } else {
            None
        };
        TupleIter {
            iter: self.db.scan_prefix(&self.cf, &prefix),
            order: self.order.clone(),
            filter,
        }
    }

    /// Number of leading columns of this index order that `pattern` binds.
    pub fn prefix_len(&self, pattern: &[Option<TermId>]) -> usize {
        self.order.prefix_len(pattern)
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        self.db.len(&self.cf)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.db.is_empty(&self.cf)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.clear(&self.cf)
    }

    /// Durability checkpoint.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush(&self.cf)?;
        debug!(index = self.name(), "index synced");
        Ok(())
    }

    fn check_width(&self, tuple: &[TermId]) -> Result<(), StorageError> {
        if tuple.len() == self.width() {
            Ok(())
        } else {
            Err(StorageError::config(format!(
                "a tuple of width {} can't be written to the {} index of width {}",
                tuple.len(),
                self.name(),
                self.width()
            )))
        }
    }
}

/// Lazy iterator over the tuples of an index, in natural order.
pub struct TupleIter {
    iter: Iter,
    order: IndexOrder,
    filter: Option<Box<[Option<TermId>]>>,
}

impl Iterator for TupleIter {
    type Item = Result<EncodedTuple, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tuple = match self.iter.next()? {
                Ok(key) => self.order.decode_key(&key),
                Err(e) => Err(e),
            };
            match (&self.filter, tuple) {
                (Some(filter), Ok(tuple)) if !tuple.matches(filter) => continue,
                (_, tuple) => return Some(tuple),
            }
        }
    }
}

/// A dictionary with one primary and several secondary indexes over the same tuple set.
#[derive(Clone)]
pub struct TupleTable {
    name: Arc<str>,
    dictionary: TermDictionary,
    primary: TupleIndex,
    secondaries: Vec<TupleIndex>,
}

impl TupleTable {
    pub(crate) fn new(
        name: &str,
        dictionary: TermDictionary,
        primary: TupleIndex,
        secondaries: Vec<TupleIndex>,
    ) -> Self {
        Self {
            name: name.into(),
            dictionary,
            primary,
            secondaries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.primary.width()
    }

    pub fn dictionary(&self) -> &TermDictionary {
        &self.dictionary
    }

    pub fn primary(&self) -> &TupleIndex {
        &self.primary
    }

    pub fn secondaries(&self) -> &[TupleIndex] {
        &self.secondaries
    }

    /// The primary index followed by the secondary ones.
    pub fn indexes(&self) -> impl Iterator<Item = &TupleIndex> {
        Some(&self.primary).into_iter().chain(&self.secondaries)
    }

    pub fn index(&self, name: &str) -> Option<&TupleIndex> {
        self.indexes()
            .find(|index| index.name() == name || index.order().name() == name)
    }

    pub fn detached_secondaries(&self) -> Vec<TupleIndex> {
        self.secondaries
            .iter()
            .filter(|index| !index.is_attached())
            .cloned()
            .collect()
    }

    /// Encodes the terms and adds the tuple to every attached index.
    pub fn add(&self, terms: &[TermRef<'_>]) -> Result<bool, StorageError> {
        let tuple = self.encode(terms)?;
        self.add_encoded(&tuple)
    }

    /// Adds an encoded tuple to the primary index and to every attached secondary index.
    pub fn add_encoded(&self, tuple: &[TermId]) -> Result<bool, StorageError> {
        let added = self.primary.add(tuple)?;
        if added {
            for index in self.attached_secondaries() {
                index.add(tuple)?;
            }
        }
        Ok(added)
    }

    pub fn remove(&self, terms: &[TermRef<'_>]) -> Result<bool, StorageError> {
        match self.lookup(terms)? {
            Some(tuple) => self.remove_encoded(&tuple),
            None => Ok(false),
        }
    }

    pub fn remove_encoded(&self, tuple: &[TermId]) -> Result<bool, StorageError> {
        let removed = self.primary.remove(tuple)?;
        if removed {
            for index in self.attached_secondaries() {
                index.remove(tuple)?;
            }
        }
        Ok(removed)
    }

    pub fn contains(&self, terms: &[TermRef<'_>]) -> Result<bool, StorageError> {
        match self.lookup(terms)? {
            Some(tuple) => self.primary.contains(&tuple),
            None => Ok(false),
        }
    }

    /// Encodes every term, allocating identifiers for new terms.
    pub fn encode(&self, terms: &[TermRef<'_>]) -> Result<EncodedTuple, StorageError> {
        self.check_width(terms.len())?;
        terms
            .iter()
            .map(|term| self.dictionary.encode(*term))
            .collect::<Result<Vec<_>, _>>()
            .map(EncodedTuple::new)
    }

    /// Resolves every term without allocating. `None` if one of them is unknown.
    pub fn lookup(&self, terms: &[TermRef<'_>]) -> Result<Option<EncodedTuple>, StorageError> {
        self.check_width(terms.len())?;
        let mut tuple = Vec::with_capacity(terms.len());
        for term in terms {
            match self.dictionary.lookup(*term)? {
                Some(id) => tuple.push(id),
                None => return Ok(None),
            }
        }
        Ok(Some(tuple.into()))
    }

    /// The attached index best suited to `pattern`: the one whose order has the longest bound
    /// prefix, the primary index winning ties.
    pub fn best_index(&self, pattern: &[Option<TermId>]) -> &TupleIndex {
        let mut best = &self.primary;
        let mut best_len = self.primary.prefix_len(pattern);
        for index in self.attached_secondaries() {
            let len = index.prefix_len(pattern);
            if len > best_len {
                best = index;
                best_len = len;
            }
        }
        best
    }

    pub fn find(&self, pattern: &[Option<TermId>]) -> TupleIter {
        self.best_index(pattern).find(pattern)
    }

    /// Finds the tuples matching a pattern of terms and decodes them.
    pub fn find_terms(
        &self,
        pattern: &[Option<TermRef<'_>>],
    ) -> Result<impl Iterator<Item = Result<Vec<Term>, StorageError>>, StorageError> {
        self.check_width(pattern.len())?;
        let mut encoded = Vec::with_capacity(pattern.len());
        let mut unknown = false;
        for term in pattern {
            encoded.push(match term {
                Some(term) => {
                    let id = self.dictionary.lookup(*term)?;
                    unknown |= id.is_none();
                    id
                }
                None => None,
            });
        }
        let iter = if unknown {
            None
        } else {
            Some(self.find(&encoded))
        };
        let dictionary = self.dictionary.clone();
        Ok(iter.into_iter().flatten().map(move |tuple| {
            tuple?
                .iter()
                .map(|id| dictionary.decode(*id))
                .collect::<Result<Vec<_>, _>>()
        }))
    }

    /// Number of tuples, as seen by the primary index.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.primary.len()
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.primary.is_empty()
    }

    /// Checks that every attached secondary index holds the tuple set of the primary index.
    pub fn validate(&self) -> Result<(), StorageError> {
        let expected = self.primary.len()?;
        for index in self.attached_secondaries() {
            if index.len()? != expected {
                return Err(CorruptionError::msg(format!(
                    "Not the same number of tuples in {} and {}",
                    self.primary.name(),
                    index.name()
                ))
                .into());
            }
        }
        for tuple in self.primary.all() {
            let tuple = tuple?;
            for id in tuple.iter() {
                if !self.dictionary.contains(*id)? {
                    return Err(CorruptionError::msg(format!(
                        "The term {id} of {} is not in the dictionary",
                        self.primary.name()
                    ))
                    .into());
                }
            }
            for index in self.attached_secondaries() {
                if !index.contains(&tuple)? {
                    return Err(CorruptionError::msg(format!(
                        "Tuple in {} and not in {}",
                        self.primary.name(),
                        index.name()
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Syncs the dictionary and every index, attached or not.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.dictionary.sync()?;
        for index in self.indexes() {
            index.sync()?;
        }
        Ok(())
    }

    fn attached_secondaries(&self) -> impl Iterator<Item = &TupleIndex> {
        self.secondaries.iter().filter(|index| index.is_attached())
    }

    fn check_width(&self, width: usize) -> Result<(), StorageError> {
        if width == self.width() {
            Ok(())
        } else {
            Err(StorageError::config(format!(
                "the {} table stores tuples of width {}, not {width}",
                self.name,
                self.width()
            )))
        }
    }
}
