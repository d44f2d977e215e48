use crate::model::{Term, TermRef};
use crate::storage::backend::{ColumnFamily, Db};
use crate::storage::binary_encoder::{read_term, write_term};
use crate::storage::digest_pool::DigestPool;
use crate::storage::error::{CorruptionError, EncodingError, StorageError};
use crate::storage::numeric_encoder::{Decoder, TermId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Content-addressed mapping between terms and [`TermId`]s.
///
/// The identifier of a term is the 64 bits prefix of the digest of its canonical form. If that
/// slot already holds another term the following identifiers are tried in order until the term
/// itself or a free slot is found, so distinct terms always get distinct identifiers and encoding
/// the same term again always lands on the same slot.
#[derive(Clone)]
pub struct TermDictionary {
    db: Db,
    id2str: ColumnFamily,
    pool: Arc<DigestPool>,
    collisions: Arc<AtomicU64>,
}

impl TermDictionary {
    pub(crate) fn new(db: Db, id2str: ColumnFamily, pool: Arc<DigestPool>) -> Self {
        Self {
            db,
            id2str,
            pool,
            collisions: Arc::default(),
        }
    }

    /// Returns the identifier of `term`, allocating one if the term is new.
    pub fn encode(&self, term: TermRef<'_>) -> Result<TermId, StorageError> {
        let mut canonical = Vec::new();
        write_term(&mut canonical, term)?;
        let start = TermId::new(self.pool.digest_u64(&canonical)?);
        let mut id = start;
        loop {
            match self
                .db
                .get_or_insert(&self.id2str, &id.to_be_bytes(), &canonical)?
            {
                None => return Ok(id),
                Some(existing) if *existing == *canonical => return Ok(id),
                Some(_) => {
                    self.collisions.fetch_add(1, Ordering::Relaxed);
                    warn!(%id, term = %term, "term identifier collision, probing the next slot");
                    id = id.successor();
                    if id == start {
                        return Err(EncodingError::IdentifierSpaceExhausted.into());
                    }
                }
            }
        }
    }

    /// Returns the identifier of `term` if it has already been encoded.
    pub fn lookup(&self, term: TermRef<'_>) -> Result<Option<TermId>, StorageError> {
        let mut canonical = Vec::new();
        write_term(&mut canonical, term)?;
        let start = TermId::new(self.pool.digest_u64(&canonical)?);
        let mut id = start;
        while let Some(existing) = self.db.get(&self.id2str, &id.to_be_bytes())? {
            if *existing == *canonical {
                return Ok(Some(id));
            }
            id = id.successor();
            if id == start {
                break;
            }
        }
        Ok(None)
    }

    pub fn decode(&self, id: TermId) -> Result<Term, StorageError> {
        let canonical = self
            .db
            .get(&self.id2str, &id.to_be_bytes())?
            .ok_or_else(|| CorruptionError::msg(format!("Not able to find the term {id}")))?;
        read_term(&canonical)
    }

    pub fn contains(&self, id: TermId) -> Result<bool, StorageError> {
        self.db.contains_key(&self.id2str, &id.to_be_bytes())
    }

    /// Number of encoded terms.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.db.len(&self.id2str)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.db.is_empty(&self.id2str)
    }

    /// Number of hash collisions resolved by probing since the store was opened.
    pub fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    pub fn digest_pool(&self) -> &Arc<DigestPool> {
        &self.pool
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush(&self.id2str)
    }
}

impl Decoder for TermDictionary {
    fn decode_term(&self, encoded: TermId) -> Result<Term, StorageError> {
        self.decode(encoded)
    }
}
