use crate::model::{GraphName, NamedNode, Subject, Term};
use crate::storage::error::{CorruptionError, StorageError};
use std::fmt;
use std::ops::Deref;

/// The fixed-width identifier of a term inside a store.
///
/// It is derived from a digest of the term canonical form, see [`TermDictionary`](crate::storage::dictionary::TermDictionary).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId(u64);

impl TermId {
    pub const SIZE: usize = 8;

    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn from_be_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    #[inline]
    pub fn to_be_bytes(self) -> [u8; Self::SIZE] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The identifier tried after this one when the slot is taken by another term.
    #[inline]
    pub(crate) const fn successor(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TermId({self})")
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_be_bytes()))
    }
}

/// A tuple of identifiers in the natural order of its table (`SPO` or `GSPO`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EncodedTuple(Vec<TermId>);

impl EncodedTuple {
    pub fn new(ids: Vec<TermId>) -> Self {
        Self(ids)
    }

    /// Checks if every bound position of `pattern` holds the same identifier.
    pub fn matches(&self, pattern: &[Option<TermId>]) -> bool {
        self.0.len() == pattern.len()
            && self
                .0
                .iter()
                .zip(pattern)
                .all(|(id, bound)| bound.map_or(true, |bound| bound == *id))
    }
}

impl Deref for EncodedTuple {
    type Target = [TermId];

    fn deref(&self) -> &[TermId] {
        &self.0
    }
}

impl From<Vec<TermId>> for EncodedTuple {
    fn from(ids: Vec<TermId>) -> Self {
        Self(ids)
    }
}

pub trait Decoder {
    fn decode_term(&self, encoded: TermId) -> Result<Term, StorageError>;

    fn decode_subject(&self, encoded: TermId) -> Result<Subject, StorageError> {
        match self.decode_term(encoded)? {
            Term::NamedNode(named_node) => Ok(named_node.into()),
            Term::BlankNode(blank_node) => Ok(blank_node.into()),
            Term::Literal(_) => Err(CorruptionError::msg(
                "A literal has been found instead of a subject node",
            )
            .into()),
        }
    }

    fn decode_named_node(&self, encoded: TermId) -> Result<NamedNode, StorageError> {
        match self.decode_term(encoded)? {
            Term::NamedNode(named_node) => Ok(named_node),
            Term::BlankNode(_) => Err(CorruptionError::msg(
                "A blank node has been found instead of a named node",
            )
            .into()),
            Term::Literal(_) => {
                Err(CorruptionError::msg("A literal has been found instead of a named node").into())
            }
        }
    }

    fn decode_graph_name(&self, encoded: TermId) -> Result<GraphName, StorageError> {
        match self.decode_term(encoded)? {
            Term::NamedNode(named_node) => Ok(named_node.into()),
            Term::BlankNode(blank_node) => Ok(blank_node.into()),
            Term::Literal(_) => {
                Err(CorruptionError::msg("A literal is not a valid graph name").into())
            }
        }
    }
}
