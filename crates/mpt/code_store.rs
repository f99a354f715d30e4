use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use ethereum_types::H256;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointParticipant};
use crate::error::MptError;
use crate::types::keccak256;

const CODES_FILE: &str = "codes.dat";
const MARKER_DIR: &str = "codes";
const COMMITTED_MARKER: &str = "committed.json";
const PREPARE_MARKER: &str = "prepare.json";

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
struct CodeCheckpointMeta {
    #[serde(rename = "Checkpoint")]
    checkpoint: Checkpoint,
    #[serde(rename = "FileSize")]
    file_size: u64,
}

/// Content-addressed store for contract byte code.
///
/// Backed by an append-only log of `hash | len | bytes` records mirrored in
/// memory; duplicates are detected against the mirror and never re-appended.
pub struct CodeStore {
    root: PathBuf,
    inner: Mutex<CodeInner>,
}

struct CodeInner {
    file: File,
    file_size: u64,
    codes: FxHashMap<H256, Vec<u8>>,
}

impl CodeStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, MptError> {
        let root = root.into();
        fs::create_dir_all(root.join(MARKER_DIR))?;
        let path = root.join(CODES_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let codes = parse_code_log(&data)
            .map_err(|err| MptError::corrupt(format!("{}: {err}", path.display())))?;
        let file_size = data.len() as u64;
        file.seek(SeekFrom::End(0))?;

        Ok(CodeStore {
            root,
            inner: Mutex::new(CodeInner {
                file,
                file_size,
                codes,
            }),
        })
    }

    /// Opens the store without parsing the log, for recovery flows where
    /// the log may end in a torn record. The mirror stays empty until
    /// [`CheckpointParticipant::restore`] truncates and reloads it.
    pub(crate) fn open_for_restore(root: impl Into<PathBuf>) -> Result<Self, MptError> {
        let root = root.into();
        fs::create_dir_all(root.join(MARKER_DIR))?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(CODES_FILE))?;
        let file_size = file.seek(SeekFrom::End(0))?;
        Ok(CodeStore {
            root,
            inner: Mutex::new(CodeInner {
                file,
                file_size,
                codes: FxHashMap::default(),
            }),
        })
    }

    /// Stores the code and returns its keccak hash; known code is not
    /// re-appended.
    pub fn add(&self, code: &[u8]) -> Result<H256, MptError> {
        let hash = keccak256(code);
        let mut inner = self.inner.lock();
        if inner.codes.contains_key(&hash) {
            return Ok(hash);
        }

        let mut record = Vec::with_capacity(36 + code.len());
        record.extend_from_slice(hash.as_bytes());
        record.extend_from_slice(&(code.len() as u32).to_be_bytes());
        record.extend_from_slice(code);
        inner.file.write_all(&record)?;
        inner.file_size += record.len() as u64;
        inner.codes.insert(hash, code.to_vec());
        Ok(hash)
    }

    pub fn get(&self, hash: &H256) -> Option<Vec<u8>> {
        self.inner.lock().codes.get(hash).cloned()
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.lock().codes.contains_key(hash)
    }

    /// Snapshot of all stored codes.
    pub fn codes(&self) -> Vec<(H256, Vec<u8>)> {
        self.inner
            .lock()
            .codes
            .iter()
            .map(|(hash, code)| (*hash, code.clone()))
            .collect()
    }

    pub fn flush(&self) -> Result<(), MptError> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.root.join(MARKER_DIR).join(name)
    }

    fn read_marker(&self, name: &str) -> Result<Option<CodeCheckpointMeta>, MptError> {
        let path = self.marker_path(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }
}

impl CheckpointParticipant for CodeStore {
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
            "code store cannot guarantee checkpoint {checkpoint}"
        )))
    }

    fn prepare(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        let file_size = {
            let inner = self.inner.lock();
            inner.file.sync_data()?;
            inner.file_size
        };
        let meta = CodeCheckpointMeta {
            checkpoint,
            file_size,
        };
        fs::write(
            self.marker_path(PREPARE_MARKER),
            serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(())
    }

    fn commit(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        let prepared = self.read_marker(PREPARE_MARKER)?.ok_or_else(|| {
            MptError::corrupt(format!(
                "code store: commit of checkpoint {checkpoint} without prepare"
            ))
        })?;
        if prepared.checkpoint != checkpoint {
            return Err(MptError::corrupt(format!(
                "code store: prepared checkpoint {} does not match commit of {checkpoint}",
                prepared.checkpoint
            )));
        }
        fs::rename(
            self.marker_path(PREPARE_MARKER),
            self.marker_path(COMMITTED_MARKER),
        )?;
        Ok(())
    }

    fn abort(&self, _checkpoint: Checkpoint) -> Result<(), MptError> {
        let _ = fs::remove_file(self.marker_path(PREPARE_MARKER));
        Ok(())
    }

    fn restore(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        self.guarantee(checkpoint)?;
        let meta = self.read_marker(COMMITTED_MARKER)?.ok_or_else(|| {
            MptError::corrupt("code store: no committed checkpoint to restore")
        })?;
        if meta.checkpoint != checkpoint {
            return Err(MptError::corrupt(format!(
                "code store: committed checkpoint {} does not match restore of {checkpoint}",
                meta.checkpoint
            )));
        }

        let mut inner = self.inner.lock();
        inner.file.set_len(meta.file_size)?;
        inner.file.sync_data()?;
        inner.file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        inner.file.read_to_end(&mut data)?;
        inner.codes = parse_code_log(&data)
            .map_err(|err| MptError::corrupt(format!("restored code log: {err}")))?;
        inner.file_size = meta.file_size;
        inner.file.seek(SeekFrom::End(0))?;
        debug!(checkpoint, codes = inner.codes.len(), "code store restored");
        Ok(())
    }
}

fn parse_code_log(data: &[u8]) -> Result<FxHashMap<H256, Vec<u8>>, String> {
    let mut codes = FxHashMap::default();
    let mut at = 0;
    while at < data.len() {
        if data.len() - at < 36 {
            return Err(format!("truncated record header at offset {at}"));
        }
        let hash = H256::from_slice(&data[at..at + 32]);
        let len = u32::from_be_bytes(data[at + 32..at + 36].try_into().unwrap()) as usize;
        at += 36;
        if data.len() - at < len {
            return Err(format!("truncated code body at offset {at}"));
        }
        codes.insert(hash, data[at..at + len].to_vec());
        at += len;
    }
    Ok(codes)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_is_content_addressed_and_deduplicated() {
        let dir = TempDir::new().unwrap();
        let store = CodeStore::open(dir.path()).unwrap();

        let code = b"some contract byte code".to_vec();
        let hash = store.add(&code).unwrap();
        assert_eq!(hash, keccak256(&code));
        assert_eq!(store.add(&code).unwrap(), hash);
        assert_eq!(store.get(&hash), Some(code));
        assert_eq!(store.codes().len(), 1);
    }

    #[test]
    fn codes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let hash = {
            let store = CodeStore::open(dir.path()).unwrap();
            let hash = store.add(b"abc").unwrap();
            store.flush().unwrap();
            hash
        };
        let store = CodeStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&hash), Some(b"abc".to_vec()));
    }

    #[test]
    fn truncated_log_is_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let store = CodeStore::open(dir.path()).unwrap();
            store.add(b"abcdef").unwrap();
            store.flush().unwrap();
        }
        let path = dir.path().join(CODES_FILE);
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 2]).unwrap();
        assert!(matches!(
            CodeStore::open(dir.path()),
            Err(MptError::Corrupt(_))
        ));
    }

    #[test]
    fn restore_truncates_to_the_checkpointed_size() {
        let dir = TempDir::new().unwrap();
        let store = CodeStore::open(dir.path()).unwrap();

        let kept = store.add(b"kept code").unwrap();
        store.prepare(1).unwrap();
        store.commit(1).unwrap();

        let dropped = store.add(b"code added after the checkpoint").unwrap();
        store.flush().unwrap();

        store.restore(1).unwrap();
        assert_eq!(store.get(&kept), Some(b"kept code".to_vec()));
        assert_eq!(store.get(&dropped), None);

        // the log can grow again after the restore
        let readded = store.add(b"fresh code").unwrap();
        assert!(store.contains(&readded));
    }

    #[test]
    fn guarantee_rolls_pending_prepare_forward() {
        let dir = TempDir::new().unwrap();
        let store = CodeStore::open(dir.path()).unwrap();
        store.prepare(1).unwrap();
        store.guarantee(1).unwrap();
        store.guarantee(1).unwrap();
        assert!(store.guarantee(2).is_err());
    }
}
