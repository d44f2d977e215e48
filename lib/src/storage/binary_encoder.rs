use crate::model::vocab::xsd;
use crate::model::{BlankNode, Literal, NamedNode, Term, TermRef};
use crate::storage::error::{CorruptionError, EncodingError, StorageError};
use crate::storage::numeric_encoder::{EncodedTuple, TermId};
use std::fmt;

pub const LATEST_STORAGE_VERSION: u64 = 1;

// Canonical term kinds. The gaps keep the numbering of the former encoding blocks:
// 1-7 named nodes, 8-15 blank nodes, 16-47 literals.
const TYPE_NAMED_NODE_ID: u8 = 1;
const TYPE_BLANK_NODE_ID: u8 = 8;
const TYPE_STRING_LITERAL: u8 = 16;
const TYPE_LANG_STRING_LITERAL: u8 = 20;
const TYPE_TYPED_LITERAL: u8 = 24;

/// Writes the canonical form of a term.
///
/// The canonical form is the kind discriminator followed by the lexical form, the language tag
/// and the datatype IRI, each prefixed by its length. Absent parts are written empty, so a simple
/// literal and a typed literal sharing the same lexical form never share a canonical form.
pub fn write_term(sink: &mut Vec<u8>, term: TermRef<'_>) -> Result<(), EncodingError> {
    match term {
        TermRef::NamedNode(node) => {
            sink.push(TYPE_NAMED_NODE_ID);
            write_parts(sink, node.as_str(), "", "")
        }
        TermRef::BlankNode(node) => {
            sink.push(TYPE_BLANK_NODE_ID);
            write_parts(sink, node.as_str(), "", "")
        }
        TermRef::Literal(literal) => {
            if let Some(language) = literal.language() {
                sink.push(TYPE_LANG_STRING_LITERAL);
                write_parts(sink, literal.value(), language, "")
            } else if literal.datatype() == xsd::STRING {
                sink.push(TYPE_STRING_LITERAL);
                write_parts(sink, literal.value(), "", "")
            } else {
                sink.push(TYPE_TYPED_LITERAL);
                write_parts(sink, literal.value(), "", literal.datatype().as_str())
            }
        }
    }
}

fn write_parts(
    sink: &mut Vec<u8>,
    lexical: &str,
    language: &str,
    datatype: &str,
) -> Result<(), EncodingError> {
    for part in [lexical, language, datatype] {
        sink.extend_from_slice(&part_length(part.len())?.to_be_bytes());
        sink.extend_from_slice(part.as_bytes());
    }
    Ok(())
}

/// Parts are prefixed by a u32 length, like the persisted chunks.
fn part_length(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len).map_err(|_| EncodingError::TermTooLarge(len))
}

/// Reads back a term written by [`write_term`].
pub fn read_term(buffer: &[u8]) -> Result<Term, StorageError> {
    let (&kind, mut rest) = buffer
        .split_first()
        .ok_or_else(|| CorruptionError::msg("Empty term encoding"))?;
    let lexical = read_part(&mut rest)?;
    let language = read_part(&mut rest)?;
    let datatype = read_part(&mut rest)?;
    if !rest.is_empty() {
        return Err(CorruptionError::msg("Trailing bytes after an encoded term").into());
    }
    Ok(match kind {
        TYPE_NAMED_NODE_ID => NamedNode::new_unchecked(lexical).into(),
        TYPE_BLANK_NODE_ID => BlankNode::new_unchecked(lexical).into(),
        TYPE_STRING_LITERAL => Literal::new_simple_literal(lexical).into(),
        TYPE_LANG_STRING_LITERAL => {
            Literal::new_language_tagged_literal_unchecked(lexical, language).into()
        }
        TYPE_TYPED_LITERAL => {
            Literal::new_typed_literal(lexical, NamedNode::new_unchecked(datatype)).into()
        }
        _ => {
            return Err(
                CorruptionError::msg(format!("The term type {kind} is not supported")).into(),
            )
        }
    })
}

fn read_part(buffer: &mut &[u8]) -> Result<String, StorageError> {
    if buffer.len() < 4 {
        return Err(CorruptionError::msg("Truncated term encoding").into());
    }
    let (len, rest) = buffer.split_at(4);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return Err(CorruptionError::msg("Truncated term encoding").into());
    }
    let (value, rest) = rest.split_at(len);
    *buffer = rest;
    String::from_utf8(value.to_vec()).map_err(|e| CorruptionError::new(e).into())
}

/// A sort order of a tuple index, e.g. `POS` for a table whose natural order is `SPO`.
///
/// Keys are the big-endian identifiers concatenated in index order, so the byte order of the
/// keys is the order of the tuples and a bound prefix of a pattern is a byte prefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IndexOrder {
    name: Box<str>,
    /// For each key position, the position of the same column in the natural order.
    columns: Box<[usize]>,
}

impl IndexOrder {
    /// Parses an order given with one letter per column, against the `natural` order of the table.
    pub fn parse(name: &str, natural: &str) -> Result<Self, StorageError> {
        let name = name.to_ascii_uppercase();
        let natural = natural.to_ascii_uppercase();
        if name.len() != natural.len() {
            return Err(StorageError::config(format!(
                "the index order {name} does not have the {} columns of {natural}",
                natural.len()
            )));
        }
        let mut columns = Vec::with_capacity(name.len());
        for column in name.chars() {
            let position = natural.find(column).ok_or_else(|| {
                StorageError::config(format!(
                    "the index order {name} uses the column {column} that is not in {natural}"
                ))
            })?;
            if columns.contains(&position) {
                return Err(StorageError::config(format!(
                    "the index order {name} uses the column {column} twice"
                )));
            }
            columns.push(position);
        }
        Ok(Self {
            name: name.into(),
            columns: columns.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn key_size(&self) -> usize {
        self.width() * TermId::SIZE
    }

    /// Writes the key of a tuple given in natural order.
    pub fn write_key(&self, sink: &mut Vec<u8>, tuple: &[TermId]) {
        for &column in self.columns.iter() {
            sink.extend_from_slice(&tuple[column].to_be_bytes());
        }
    }

    pub fn encode_key(&self, tuple: &[TermId]) -> Box<[u8]> {
        let mut key = Vec::with_capacity(self.key_size());
        self.write_key(&mut key, tuple);
        key.into()
    }

    /// Decodes a key into a tuple in natural order.
    pub fn decode_key(&self, key: &[u8]) -> Result<EncodedTuple, StorageError> {
        if key.len() != self.key_size() {
            return Err(CorruptionError::msg(format!(
                "Invalid key of {} bytes in the {} index",
                key.len(),
                self.name
            ))
            .into());
        }
        let mut tuple = vec![TermId::new(0); self.width()];
        for (chunk, &column) in key.chunks_exact(TermId::SIZE).zip(self.columns.iter()) {
            let mut bytes = [0; TermId::SIZE];
            bytes.copy_from_slice(chunk);
            tuple[column] = TermId::from_be_bytes(bytes);
        }
        Ok(tuple.into())
    }

    /// The number of leading key columns bound by `pattern` (given in natural order).
    pub fn prefix_len(&self, pattern: &[Option<TermId>]) -> usize {
        self.columns
            .iter()
            .take_while(|&&column| pattern.get(column).map_or(false, Option::is_some))
            .count()
    }

    /// Writes the key prefix made of the leading bound columns of `pattern`.
    pub fn write_prefix(&self, sink: &mut Vec<u8>, pattern: &[Option<TermId>]) {
        for &column in self.columns.iter() {
            match pattern.get(column).copied().flatten() {
                Some(id) => sink.extend_from_slice(&id.to_be_bytes()),
                None => break,
            }
        }
    }

    /// Name of the backing column family.
    pub fn column_family_name(&self, table: &str) -> String {
        format!("{table}_{}", self.name.to_ascii_lowercase())
    }
}

impl fmt::Debug for IndexOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Display for IndexOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
