use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path as FsPath, PathBuf};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointParticipant};
use crate::error::MptError;

const VALUES_FILE: &str = "values.dat";
const FREELIST_FILE: &str = "freelist.dat";
const META_FILE: &str = "meta.json";
const COMMITTED_MARKER: &str = "committed.json";
const PREPARE_MARKER: &str = "prepare.json";
const FREELIST_COMMITTED: &str = "freelist.committed.ckpt";
const FREELIST_PREPARE: &str = "freelist.prepare.ckpt";

/// Fixed-size binary codec for the records of one stock.
pub trait StockCodec: Send + Sync + 'static {
    type Item;

    fn encoded_size(&self) -> usize;
    fn encode(&self, item: &Self::Item, out: &mut [u8]);
    fn decode(&self, buf: &[u8]) -> Result<Self::Item, MptError>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct StockMeta {
    #[serde(rename = "EncodedSize")]
    encoded_size: u64,
    #[serde(rename = "ValueCount")]
    value_count: u64,
    #[serde(rename = "FreeListSize")]
    free_list_size: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
struct StockCheckpointMeta {
    #[serde(rename = "Checkpoint")]
    checkpoint: Checkpoint,
    #[serde(rename = "ValueCount")]
    value_count: u64,
    #[serde(rename = "FreeListSize")]
    free_list_size: u64,
}

/// The set of indices a stock currently considers live: a dense upper bound
/// minus the freed indices.
pub struct IndexSet {
    upper: u64,
    free: FxHashSet<u64>,
}

impl IndexSet {
    pub fn contains(&self, index: u64) -> bool {
        index < self.upper && !self.free.contains(&index)
    }

    pub fn upper_bound(&self) -> u64 {
        self.upper
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.upper).filter(move |i| !self.free.contains(i))
    }

    pub fn len(&self) -> usize {
        self.upper as usize - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A persistent map from dense indices to fixed-size records.
///
/// Backed by a single record file, a LIFO freelist and a json metadata
/// file. A single mutex serializes all file access; the stock is strictly
/// single-process (the directory lock above it guarantees that).
pub struct Stock<C: StockCodec> {
    codec: C,
    dir: PathBuf,
    inner: Mutex<StockInner>,
}

struct StockInner {
    values: File,
    free_list: Vec<u64>,
    value_count: u64,
}

impl<C: StockCodec> Stock<C> {
    pub fn open(dir: impl Into<PathBuf>, codec: C) -> Result<Self, MptError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let meta_path = dir.join(META_FILE);
        let values_path = dir.join(VALUES_FILE);
        let freelist_path = dir.join(FREELIST_FILE);

        let values = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&values_path)?;

        let (free_list, value_count) = if meta_path.exists() {
            let meta: StockMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
            if meta.encoded_size != codec.encoded_size() as u64 {
                return Err(MptError::FormatMismatch(format!(
                    "stock {} stores {}-byte records, expected {}",
                    dir.display(),
                    meta.encoded_size,
                    codec.encoded_size()
                )));
            }
            let free_list = read_free_list(&freelist_path)?;
            if free_list.len() as u64 != meta.free_list_size {
                return Err(MptError::corrupt(format!(
                    "stock {}: freelist holds {} entries, metadata says {}",
                    dir.display(),
                    free_list.len(),
                    meta.free_list_size
                )));
            }
            if let Some(&bad) = free_list.iter().find(|&&i| i >= meta.value_count) {
                return Err(MptError::corrupt(format!(
                    "stock {}: freed index {bad} beyond value count {}",
                    dir.display(),
                    meta.value_count
                )));
            }
            (free_list, meta.value_count)
        } else {
            (Vec::new(), 0)
        };

        let stock = Stock {
            codec,
            dir,
            inner: Mutex::new(StockInner {
                values,
                free_list,
                value_count,
            }),
        };
        if !meta_path.exists() {
            stock.flush()?;
        }
        Ok(stock)
    }

    pub fn entry_size(&self) -> usize {
        self.codec.encoded_size()
    }

    /// Hands out a fresh index, reusing freed ones first.
    pub fn reserve(&self) -> Result<u64, MptError> {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free_list.pop() {
            return Ok(index);
        }
        let index = inner.value_count;
        inner.value_count += 1;
        Ok(index)
    }

    pub fn get(&self, index: u64) -> Result<C::Item, MptError> {
        let size = self.codec.encoded_size();
        let mut buf = vec![0u8; size];
        {
            let mut inner = self.inner.lock();
            if index >= inner.value_count {
                return Err(MptError::corrupt(format!(
                    "stock {}: read of unallocated index {index}",
                    self.dir.display()
                )));
            }
            let offset = index * size as u64;
            let file_len = inner.values.metadata()?.len();
            if offset < file_len {
                let available = ((file_len - offset) as usize).min(size);
                inner.values.seek(SeekFrom::Start(offset))?;
                inner.values.read_exact(&mut buf[..available])?;
            }
            // reserved but never written slots read as zeros
        }
        self.codec.decode(&buf)
    }

    pub fn set(&self, index: u64, item: &C::Item) -> Result<(), MptError> {
        let size = self.codec.encoded_size();
        let mut buf = vec![0u8; size];
        self.codec.encode(item, &mut buf);
        let mut inner = self.inner.lock();
        if index >= inner.value_count {
            return Err(MptError::corrupt(format!(
                "stock {}: write to unallocated index {index}",
                self.dir.display()
            )));
        }
        inner.values.seek(SeekFrom::Start(index * size as u64))?;
        inner.values.write_all(&buf)?;
        Ok(())
    }

    /// Returns the index to the freelist for reuse.
    pub fn delete(&self, index: u64) -> Result<(), MptError> {
        let mut inner = self.inner.lock();
        if index >= inner.value_count {
            return Err(MptError::corrupt(format!(
                "stock {}: delete of unallocated index {index}",
                self.dir.display()
            )));
        }
        inner.free_list.push(index);
        Ok(())
    }

    pub fn get_ids(&self) -> IndexSet {
        let inner = self.inner.lock();
        IndexSet {
            upper: inner.value_count,
            free: inner.free_list.iter().copied().collect(),
        }
    }

    pub fn flush(&self) -> Result<(), MptError> {
        let mut inner = self.inner.lock();
        inner.values.sync_data()?;
        write_free_list(&self.dir.join(FREELIST_FILE), &inner.free_list)?;
        let meta = StockMeta {
            encoded_size: self.codec.encoded_size() as u64,
            value_count: inner.value_count,
            free_list_size: inner.free_list.len() as u64,
        };
        fs::write(self.dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?)?;
        debug!(dir = %self.dir.display(), values = meta.value_count, "stock flushed");
        Ok(())
    }

    fn read_marker(&self, name: &str) -> Result<Option<StockCheckpointMeta>, MptError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }
}

impl<C: StockCodec> CheckpointParticipant for Stock<C> {
    fn guarantee(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        if let Some(committed) = self.read_marker(COMMITTED_MARKER)? {
            if committed.checkpoint == checkpoint {
                return Ok(());
            }
        }
        if let Some(prepared) = self.read_marker(PREPARE_MARKER)? {
            if prepared.checkpoint == checkpoint {
                return self.commit(checkpoint);
            }
        }
        Err(MptError::corrupt(format!(
            "stock {} cannot guarantee checkpoint {checkpoint}",
            self.dir.display()
        )))
    }

    fn prepare(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        self.flush()?;
        let inner = self.inner.lock();
        let meta = StockCheckpointMeta {
            checkpoint,
            value_count: inner.value_count,
            free_list_size: inner.free_list.len() as u64,
        };
        drop(inner);
        // snapshot the freelist alongside the marker so restore can undo
        // later rewrites of freelist.dat
        fs::copy(
            self.dir.join(FREELIST_FILE),
            self.dir.join(FREELIST_PREPARE),
        )?;
        fs::write(
            self.dir.join(PREPARE_MARKER),
            serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(())
    }

    fn commit(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        let prepared = self.read_marker(PREPARE_MARKER)?.ok_or_else(|| {
            MptError::corrupt(format!(
                "stock {}: commit of checkpoint {checkpoint} without prepare",
                self.dir.display()
            ))
        })?;
        if prepared.checkpoint != checkpoint {
            return Err(MptError::corrupt(format!(
                "stock {}: prepared checkpoint {} does not match commit of {checkpoint}",
                self.dir.display(),
                prepared.checkpoint
            )));
        }
        fs::rename(
            self.dir.join(FREELIST_PREPARE),
            self.dir.join(FREELIST_COMMITTED),
        )?;
        fs::rename(
            self.dir.join(PREPARE_MARKER),
            self.dir.join(COMMITTED_MARKER),
        )?;
        Ok(())
    }

    fn abort(&self, _checkpoint: Checkpoint) -> Result<(), MptError> {
        let _ = fs::remove_file(self.dir.join(PREPARE_MARKER));
        let _ = fs::remove_file(self.dir.join(FREELIST_PREPARE));
        Ok(())
    }

    fn restore(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        self.guarantee(checkpoint)?;
        let meta = self.read_marker(COMMITTED_MARKER)?.ok_or_else(|| {
            MptError::corrupt(format!(
                "stock {}: no committed checkpoint to restore",
                self.dir.display()
            ))
        })?;
        if meta.checkpoint != checkpoint {
            return Err(MptError::corrupt(format!(
                "stock {}: committed checkpoint {} does not match restore of {checkpoint}",
                self.dir.display(),
                meta.checkpoint
            )));
        }

        let mut inner = self.inner.lock();
        inner
            .values
            .set_len(meta.value_count * self.codec.encoded_size() as u64)?;
        inner.values.sync_data()?;
        inner.value_count = meta.value_count;

        let committed_freelist = self.dir.join(FREELIST_COMMITTED);
        inner.free_list = if committed_freelist.exists() {
            let mut list = read_free_list(&committed_freelist)?;
            list.truncate(meta.free_list_size as usize);
            list
        } else if meta.free_list_size == 0 {
            Vec::new()
        } else {
            return Err(MptError::corrupt(format!(
                "stock {}: missing freelist snapshot for checkpoint {checkpoint}",
                self.dir.display()
            )));
        };
        drop(inner);
        self.flush()?;
        debug!(dir = %self.dir.display(), checkpoint, "stock restored");
        Ok(())
    }
}

fn read_free_list(path: &FsPath) -> Result<Vec<u64>, MptError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read(path)?;
    if data.len() % 8 != 0 {
        return Err(MptError::corrupt(format!(
            "freelist {} has a partial entry",
            path.display()
        )));
    }
    Ok(data
        .chunks_exact(8)
        .map(|chunk| u64::from_be_bytes(chunk.try_into().unwrap()))
        .collect())
}

fn write_free_list(path: &FsPath, list: &[u64]) -> Result<(), MptError> {
    let mut data = Vec::with_capacity(list.len() * 8);
    for index in list {
        data.extend_from_slice(&index.to_be_bytes());
    }
    fs::write(path, data)?;
    Ok(())
}

/// Structural audit of a stock directory without opening it for writing.
/// Returns the checked metadata for follow-up reference checks.
pub fn verify_stock_layout(
    dir: &FsPath,
    expected_entry_size: usize,
) -> Result<(u64, Vec<u64>), MptError> {
    let meta_path = dir.join(META_FILE);
    if !meta_path.exists() {
        return Err(MptError::corrupt(format!(
            "stock {}: missing {META_FILE}",
            dir.display()
        )));
    }
    let meta: StockMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
    if meta.encoded_size != expected_entry_size as u64 {
        return Err(MptError::FormatMismatch(format!(
            "stock {} stores {}-byte records, expected {expected_entry_size}",
            dir.display(),
            meta.encoded_size
        )));
    }

    let values_len = fs::metadata(dir.join(VALUES_FILE))?.len();
    if values_len > meta.value_count * meta.encoded_size {
        return Err(MptError::corrupt(format!(
            "stock {}: value file holds {values_len} bytes for {} records of {} bytes",
            dir.display(),
            meta.value_count,
            meta.encoded_size
        )));
    }

    let free_list = read_free_list(&dir.join(FREELIST_FILE))?;
    if free_list.len() as u64 != meta.free_list_size {
        return Err(MptError::corrupt(format!(
            "stock {}: freelist length {} does not match metadata {}",
            dir.display(),
            free_list.len(),
            meta.free_list_size
        )));
    }
    let mut seen = FxHashSet::default();
    for &index in &free_list {
        if index >= meta.value_count {
            return Err(MptError::corrupt(format!(
                "stock {}: freed index {index} beyond value count {}",
                dir.display(),
                meta.value_count
            )));
        }
        if !seen.insert(index) {
            return Err(MptError::corrupt(format!(
                "stock {}: index {index} freed twice",
                dir.display()
            )));
        }
    }
    Ok((meta.value_count, free_list))
}
