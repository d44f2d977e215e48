//! Low level storage primitives: the term dictionary, the tuple indexes and their backing
//! column families.

pub use crate::storage::binary_encoder::IndexOrder;
pub use crate::storage::dictionary::TermDictionary;
pub use crate::storage::digest_pool::{DigestAlgorithm, DigestPool, PooledDigest};
pub use crate::storage::error::{CorruptionError, EncodingError, StorageError};
pub use crate::storage::index::{TupleIndex, TupleIter, TupleTable};
pub use crate::storage::numeric_encoder::{Decoder, EncodedTuple, TermId};
pub use crate::storage::options::StoreOptions;

use crate::storage::binary_encoder::LATEST_STORAGE_VERSION;
use backend::{ColumnFamily, ColumnFamilyDefinition, Db};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

mod backend;
mod binary_encoder;
mod dictionary;
mod digest_pool;
mod error;
mod index;
mod numeric_encoder;
mod options;

const META_CF: &str = "meta";
const ID2STR_CF: &str = "id2str";
const TRIPLES_TABLE: &str = "triples";
const QUADS_TABLE: &str = "quads";

const VERSION_KEY: &[u8] = b"oxversion";
const DIGEST_KEY: &[u8] = b"digest";
const INDEXES_KEY_PREFIX: &str = "indexes/";
const DETACHED_KEY_PREFIX: &str = "detached/";

/// The dictionary and the two tuple tables of a store.
///
/// Triples of the default graph live in the `triples` table (natural order `SPO`), quads of the
/// named graphs in the `quads` table (natural order `GSPO`). Both share one dictionary.
#[derive(Clone)]
pub struct Storage {
    db: Db,
    meta_cf: ColumnFamily,
    dictionary: TermDictionary,
    triples: TupleTable,
    quads: TupleTable,
}

impl Storage {
    /// Creates an in-memory storage.
    pub fn new(options: &StoreOptions) -> Result<Self, StorageError> {
        let layout = Layout::new(options)?;
        Self::setup(Db::new(layout.column_families()), options, layout)
    }

    /// Opens the storage persisted in the `path` directory, creating it if needed.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self, StorageError> {
        let layout = Layout::new(options)?;
        Self::setup(Db::open(path, layout.column_families())?, options, layout)
    }

    fn setup(db: Db, options: &StoreOptions, layout: Layout) -> Result<Self, StorageError> {
        let meta_cf = column_family(&db, META_CF)?;
        let pool = Arc::new(DigestPool::new(
            options.digest_algorithm(),
            options.digest_pool_capacity(),
        ));
        let dictionary = TermDictionary::new(db.clone(), column_family(&db, ID2STR_CF)?, pool);
        let table = |name: &str, primary: &IndexOrder, secondaries: &[IndexOrder]| {
            let index = |order: &IndexOrder| -> Result<TupleIndex, StorageError> {
                let cf = column_family(&db, &order.column_family_name(name))?;
                Ok(TupleIndex::new(db.clone(), cf, order.clone()))
            };
            Ok::<_, StorageError>(TupleTable::new(
                name,
                dictionary.clone(),
                index(primary)?,
                secondaries.iter().map(index).collect::<Result<_, _>>()?,
            ))
        };
        let triples = table(TRIPLES_TABLE, &layout.triples.0, &layout.triples.1)?;
        let quads = table(QUADS_TABLE, &layout.quads.0, &layout.quads.1)?;
        let this = Self {
            db,
            meta_cf,
            dictionary,
            triples,
            quads,
        };
        this.ensure_version()?;
        this.ensure_digest_algorithm(options.digest_algorithm())?;
        this.ensure_indexes(&this.triples)?;
        this.ensure_indexes(&this.quads)?;
        this.restore_detached()?;
        Ok(this)
    }

    fn ensure_version(&self) -> Result<(), StorageError> {
        let version = if let Some(version) = self.db.get(&self.meta_cf, VERSION_KEY)? {
            let mut buffer = [0; 8];
            if version.len() != buffer.len() {
                return Err(CorruptionError::msg("The storage version is not a valid u64").into());
            }
            buffer.copy_from_slice(&version);
            u64::from_be_bytes(buffer)
        } else {
            self.db.insert(
                &self.meta_cf,
                VERSION_KEY,
                &LATEST_STORAGE_VERSION.to_be_bytes(),
            )?;
            self.db.flush(&self.meta_cf)?;
            LATEST_STORAGE_VERSION
        };
        match version {
            LATEST_STORAGE_VERSION => Ok(()),
            _ if version < LATEST_STORAGE_VERSION => Err(CorruptionError::msg(format!(
                "The store is using the outdated encoding version {version}. Automated migration is not supported, please dump the store dataset and load it again"
            ))
            .into()),
            _ => Err(CorruptionError::msg(format!(
                "The store is using the too recent version {version}. Upgrade to load this store"
            ))
            .into()),
        }
    }

    fn ensure_digest_algorithm(&self, algorithm: DigestAlgorithm) -> Result<(), StorageError> {
        match self.db.get(&self.meta_cf, DIGEST_KEY)? {
            Some(stored) if *stored == *algorithm.name().as_bytes() => Ok(()),
            Some(stored) => Err(StorageError::config(format!(
                "the store identifiers have been computed with {}, not {algorithm}",
                String::from_utf8_lossy(&stored)
            ))),
            None => {
                self.db
                    .insert(&self.meta_cf, DIGEST_KEY, algorithm.name().as_bytes())?;
                self.db.flush(&self.meta_cf)
            }
        }
    }

    /// Index orders may only change while the table is empty.
    fn ensure_indexes(&self, table: &TupleTable) -> Result<(), StorageError> {
        let key = format!("{INDEXES_KEY_PREFIX}{}", table.name());
        let configured = table
            .indexes()
            .map(|index| index.order().name())
            .collect::<Vec<_>>()
            .join(",");
        if let Some(stored) = self.db.get(&self.meta_cf, key.as_bytes())? {
            if *stored == *configured.as_bytes() {
                return Ok(());
            }
            if !table.is_empty()? {
                return Err(StorageError::config(format!(
                    "the {} table is indexed by {} and can't be reopened with {configured}",
                    table.name(),
                    String::from_utf8_lossy(&stored)
                )));
            }
        }
        self.db
            .insert(&self.meta_cf, key.as_bytes(), configured.as_bytes())?;
        self.db.flush(&self.meta_cf)
    }

    fn restore_detached(&self) -> Result<(), StorageError> {
        for table in self.tables() {
            for index in table.secondaries() {
                if self
                    .db
                    .contains_key(&self.meta_cf, &detached_key(index))?
                {
                    index.set_attached(false);
                    info!(
                        index = index.name(),
                        "secondary index left detached by an interrupted load"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.db.path()
    }

    pub fn dictionary(&self) -> &TermDictionary {
        &self.dictionary
    }

    /// The table of the default graph.
    pub fn triples(&self) -> &TupleTable {
        &self.triples
    }

    /// The table of the named graphs.
    pub fn quads(&self) -> &TupleTable {
        &self.quads
    }

    pub fn tables(&self) -> [&TupleTable; 2] {
        [&self.triples, &self.quads]
    }

    /// Empties the secondary indexes of `table` and stops maintaining them.
    ///
    /// The detached state is persisted before anything is removed so that a store reopened after
    /// an interrupted load never uses a partially filled index.
    pub fn detach_secondaries(&self, table: &TupleTable) -> Result<(), StorageError> {
        for index in table.secondaries() {
            self.db.insert(&self.meta_cf, &detached_key(index), &[])?;
        }
        self.db.flush(&self.meta_cf)?;
        for index in table.secondaries() {
            index.set_attached(false);
            index.clear()?;
            debug!(index = index.name(), "secondary index detached");
        }
        Ok(())
    }

    /// Puts rebuilt secondary indexes of `table` back into service.
    ///
    /// The dictionary, the primary index and the rebuilt indexes are synced before the detached
    /// markers are removed.
    pub fn reattach(&self, table: &TupleTable, indexes: &[TupleIndex]) -> Result<(), StorageError> {
        if indexes.is_empty() {
            return Ok(());
        }
        table.dictionary().sync()?;
        table.primary().sync()?;
        for index in indexes {
            index.sync()?;
        }
        for index in indexes {
            self.db.remove(&self.meta_cf, &detached_key(index))?;
        }
        self.db.flush(&self.meta_cf)?;
        for index in indexes {
            index.set_attached(true);
            debug!(index = index.name(), "secondary index attached");
        }
        Ok(())
    }

    /// Syncs the metadata, the dictionary and every index.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush(&self.meta_cf)?;
        self.dictionary.sync()?;
        for table in self.tables() {
            for index in table.indexes() {
                index.sync()?;
            }
        }
        Ok(())
    }

    /// Validates that all the storage invariants held in the data.
    pub fn validate(&self) -> Result<(), StorageError> {
        self.ensure_version()?;
        for table in self.tables() {
            table.validate()?;
        }
        Ok(())
    }
}

fn detached_key(index: &TupleIndex) -> Vec<u8> {
    format!("{DETACHED_KEY_PREFIX}{}", index.name()).into_bytes()
}

fn column_family(db: &Db, name: &str) -> Result<ColumnFamily, StorageError> {
    db.column_family(name)
        .ok_or_else(|| StorageError::config(format!("the column family {name} does not exist")))
}

/// The validated index orders of both tables.
struct Layout {
    triples: (IndexOrder, Vec<IndexOrder>),
    quads: (IndexOrder, Vec<IndexOrder>),
}

impl Layout {
    fn new(options: &StoreOptions) -> Result<Self, StorageError> {
        Ok(Self {
            triples: options.triple_orders()?,
            quads: options.quad_orders()?,
        })
    }

    fn column_families(&self) -> Vec<ColumnFamilyDefinition> {
        let mut names = vec![META_CF.to_owned(), ID2STR_CF.to_owned()];
        for (table, (primary, secondaries)) in
            [(TRIPLES_TABLE, &self.triples), (QUADS_TABLE, &self.quads)]
        {
            names.push(primary.column_family_name(table));
            names.extend(
                secondaries
                    .iter()
                    .map(|order| order.column_family_name(table)),
            );
        }
        names
            .into_iter()
            .map(|name| ColumnFamilyDefinition { name })
            .collect()
    }
}
