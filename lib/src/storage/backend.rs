//! Ordered key-value storage split into column families.
//!
//! Every column family is an ordered map kept in memory. When the database is backed by a
//! directory, [`Db::flush`] is the durability primitive: the column family is written to
//! `<name>.cf.tmp`, synced and atomically renamed to `<name>.cf`.
//!
//! File layout: an 8 bytes magic, the entry count (u64, big endian), the entries as
//! `(u32 key length, key, u32 value length, value)` and a CRC-32 of everything before it.

use crate::storage::error::{CorruptionError, StorageError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

const FILE_MAGIC: &[u8; 8] = b"OXTDBCF\x01";
const FILE_EXTENSION: &str = "cf";
const SCAN_BATCH_SIZE: usize = 1024;

type Map = BTreeMap<Box<[u8]>, Box<[u8]>>;

pub struct ColumnFamilyDefinition {
    pub name: String,
}

#[derive(Clone)]
pub struct Db(Arc<DbHandler>);

struct DbHandler {
    path: Option<PathBuf>,
    column_families: HashMap<String, ColumnFamily>,
}

/// A handle to a column family. Cloning it is cheap and all clones share the same content.
#[derive(Clone)]
pub struct ColumnFamily {
    name: Arc<str>,
    data: Arc<RwLock<Map>>,
}

impl ColumnFamily {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Map>, StorageError> {
        self.data
            .read()
            .map_err(|_| StorageError::poisoned(&self.name))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Map>, StorageError> {
        self.data
            .write()
            .map_err(|_| StorageError::poisoned(&self.name))
    }
}

impl Db {
    /// Creates a purely in-memory database. Flushes are no-ops.
    pub fn new(column_families: Vec<ColumnFamilyDefinition>) -> Self {
        Self(Arc::new(DbHandler {
            path: None,
            column_families: column_families
                .into_iter()
                .map(|cf| {
                    let family = ColumnFamily {
                        name: cf.name.as_str().into(),
                        data: Arc::default(),
                    };
                    (cf.name, family)
                })
                .collect(),
        }))
    }

    /// Opens a database stored in the `path` directory, creating it if needed.
    pub fn open(
        path: &Path,
        column_families: Vec<ColumnFamilyDefinition>,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(path)?;
        let mut families = HashMap::with_capacity(column_families.len());
        for cf in column_families {
            let data = read_column_family_file(&cf_file_path(path, &cf.name))?;
            let family = ColumnFamily {
                name: cf.name.as_str().into(),
                data: Arc::new(RwLock::new(data)),
            };
            families.insert(cf.name, family);
        }
        Ok(Self(Arc::new(DbHandler {
            path: Some(path.to_owned()),
            column_families: families,
        })))
    }

    pub fn path(&self) -> Option<&Path> {
        self.0.path.as_deref()
    }

    pub fn column_family(&self, name: &str) -> Option<ColumnFamily> {
        self.0.column_families.get(name).cloned()
    }

    pub fn get(
        &self,
        column_family: &ColumnFamily,
        key: &[u8],
    ) -> Result<Option<Box<[u8]>>, StorageError> {
        Ok(column_family.read()?.get(key).cloned())
    }

    pub fn contains_key(
        &self,
        column_family: &ColumnFamily,
        key: &[u8],
    ) -> Result<bool, StorageError> {
        Ok(column_family.read()?.contains_key(key))
    }

    pub fn insert(
        &self,
        column_family: &ColumnFamily,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        column_family.write()?.insert(key.into(), value.into());
        Ok(())
    }

    /// Inserts a key without value. Returns `true` if the key was not already there.
    pub fn insert_empty(
        &self,
        column_family: &ColumnFamily,
        key: &[u8],
    ) -> Result<bool, StorageError> {
        Ok(column_family
            .write()?
            .insert(key.into(), Box::default())
            .is_none())
    }

    /// Inserts a set of keys without values under a single lock acquisition.
    ///
    /// Returns the number of keys that were not already present.
    pub fn insert_empty_batch(
        &self,
        column_family: &ColumnFamily,
        keys: impl IntoIterator<Item = Box<[u8]>>,
    ) -> Result<usize, StorageError> {
        let mut data = column_family.write()?;
        let mut inserted = 0;
        for key in keys {
            if data.insert(key, Box::default()).is_none() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Inserts `value` at `key` if the key is free.
    ///
    /// Returns the value already stored at `key` if there is one, in which case nothing is written.
    pub fn get_or_insert(
        &self,
        column_family: &ColumnFamily,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Box<[u8]>>, StorageError> {
        let mut data = column_family.write()?;
        if let Some(existing) = data.get(key) {
            return Ok(Some(existing.clone()));
        }
        data.insert(key.into(), value.into());
        Ok(None)
    }

    /// Removes a key. Returns `true` if it was present.
    pub fn remove(&self, column_family: &ColumnFamily, key: &[u8]) -> Result<bool, StorageError> {
        Ok(column_family.write()?.remove(key).is_some())
    }

    pub fn len(&self, column_family: &ColumnFamily) -> Result<usize, StorageError> {
        Ok(column_family.read()?.len())
    }

    pub fn is_empty(&self, column_family: &ColumnFamily) -> Result<bool, StorageError> {
        Ok(column_family.read()?.is_empty())
    }

    pub fn clear(&self, column_family: &ColumnFamily) -> Result<(), StorageError> {
        column_family.write()?.clear();
        Ok(())
    }

    /// Lazily iterates over the keys starting with `prefix`, in key order.
    pub fn scan_prefix(&self, column_family: &ColumnFamily, prefix: &[u8]) -> Iter {
        Iter {
            column_family: column_family.clone(),
            prefix: prefix.into(),
            buffer: VecDeque::with_capacity(SCAN_BATCH_SIZE),
            last: None,
            exhausted: false,
        }
    }

    /// Writes the column family content to the backing directory and syncs it.
    pub fn flush(&self, column_family: &ColumnFamily) -> Result<(), StorageError> {
        let Some(path) = &self.0.path else {
            return Ok(());
        };
        let data = column_family.read()?;
        let target = cf_file_path(path, column_family.name());
        let tmp = target.with_extension(format!("{FILE_EXTENSION}.tmp"));
        write_column_family_file(&tmp, &data)?;
        fs::rename(&tmp, &target)?;
        #[cfg(unix)]
        File::open(path)?.sync_all()?;
        debug!(
            column_family = column_family.name(),
            entries = data.len(),
            "column family synced"
        );
        Ok(())
    }
}

/// Iterator over the keys of a column family sharing a prefix.
///
/// Keys are fetched by batches so that no lock is held between two calls to `next`.
pub struct Iter {
    column_family: ColumnFamily,
    prefix: Box<[u8]>,
    buffer: VecDeque<Box<[u8]>>,
    last: Option<Box<[u8]>>,
    exhausted: bool,
}

impl Iter {
    fn fill(&mut self) -> Result<(), StorageError> {
        let data = self.column_family.read()?;
        let start = match &self.last {
            Some(last) => Bound::Excluded(last.as_ref()),
            None => Bound::Included(self.prefix.as_ref()),
        };
        let mut taken = 0;
        for (key, _) in data.range::<[u8], _>((start, Bound::Unbounded)) {
            if !key.starts_with(&self.prefix) {
                self.exhausted = true;
                break;
            }
            self.buffer.push_back(key.clone());
            taken += 1;
            if taken == SCAN_BATCH_SIZE {
                break;
            }
        }
        if taken < SCAN_BATCH_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = self.buffer.back() {
            self.last = Some(last.clone());
        }
        Ok(())
    }
}

impl Iterator for Iter {
    type Item = Result<Box<[u8]>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn cf_file_path(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{name}.{FILE_EXTENSION}"))
}

fn write_column_family_file(path: &Path, data: &Map) -> Result<(), StorageError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let mut writer = ChecksumWriter {
        inner: BufWriter::new(file),
        hasher: crc32fast::Hasher::new(),
    };
    writer.write_all(FILE_MAGIC)?;
    writer.write_all(&u64::try_from(data.len()).unwrap_or(u64::MAX).to_be_bytes())?;
    for (key, value) in data {
        write_chunk(&mut writer, key)?;
        write_chunk(&mut writer, value)?;
    }
    let checksum = writer.hasher.finalize();
    let mut inner = writer.inner;
    inner.write_all(&checksum.to_be_bytes())?;
    let file = inner.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn write_chunk(writer: &mut impl Write, chunk: &[u8]) -> Result<(), StorageError> {
    let len = u32::try_from(chunk.len())
        .map_err(|_| StorageError::config("a stored entry is larger than 4GiB"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(chunk)?;
    Ok(())
}

struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn read_column_family_file(path: &Path) -> Result<Map, StorageError> {
    let mut content = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut content)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e.into()),
    }
    let corrupted = |msg: &str| -> StorageError {
        CorruptionError::msg(format!("{}: {msg}", path.display())).into()
    };

    if content.len() < FILE_MAGIC.len() + 8 + 4 {
        return Err(corrupted("the file is truncated"));
    }
    let (body, checksum) = content.split_at(content.len() - 4);
    let mut expected = [0; 4];
    expected.copy_from_slice(checksum);
    if crc32fast::hash(body) != u32::from_be_bytes(expected) {
        return Err(corrupted("checksum mismatch"));
    }
    let (magic, body) = body.split_at(FILE_MAGIC.len());
    if magic != FILE_MAGIC {
        return Err(corrupted("unknown file format"));
    }
    let (count, mut body) = body.split_at(8);
    let mut count_bytes = [0; 8];
    count_bytes.copy_from_slice(count);
    let count = u64::from_be_bytes(count_bytes);

    let mut data = Map::new();
    for _ in 0..count {
        let key = read_chunk(&mut body).ok_or_else(|| corrupted("truncated key"))?;
        let value = read_chunk(&mut body).ok_or_else(|| corrupted("truncated value"))?;
        data.insert(key.into(), value.into());
    }
    if !body.is_empty() {
        return Err(corrupted("trailing bytes after the last entry"));
    }
    Ok(data)
}

fn read_chunk<'a>(body: &mut &'a [u8]) -> Option<&'a [u8]> {
    if body.len() < 4 {
        return None;
    }
    let (len, rest) = body.split_at(4);
    let len = usize::try_from(u32::from_be_bytes([len[0], len[1], len[2], len[3]])).ok()?;
    if rest.len() < len {
        return None;
    }
    let (chunk, rest) = rest.split_at(len);
    *body = rest;
    Some(chunk)
}
