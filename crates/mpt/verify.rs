//! Off-line structural and cryptographic audit of a state directory.
//!
//! Verification never opens the live writer: it checks the stock file
//! layouts, the validity of every inter-node reference, recomputes all
//! hashes against the stored ones and the recorded roots, and cross-checks
//! the code log against the account code hashes.

use std::fs;
use std::path::Path as FsPath;

use ethereum_types::H256;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::debug;

use crate::code_store::CodeStore;
use crate::config::{MptConfig, NodeCacheConfig};
use crate::dirlock::{self, DirectoryLock};
use crate::error::MptError;
use crate::forest::Forest;
use crate::hasher;
use crate::node::encoding::{AccountCodec, BranchCodec, ExtensionCodec, ValueCodec};
use crate::node::{NodeId, NodeKind, NodeReference};
use crate::stock::{StockCodec, verify_stock_layout};
use crate::types::EMPTY_CODE_HASH;

/// Receiver for verification progress and non-fatal findings.
pub trait VerificationObserver {
    fn progress(&mut self, _message: &str) {}
    fn issue(&mut self, _message: &str) {}
}

impl VerificationObserver for () {}

const ROOTS_FILE: &str = "roots.dat";
const LIVE_META_FILE: &str = "live.json";
const ROOT_RECORD_SIZE: usize = 8 + 32;

/// Batch granularity for hash recomputation and reference scans.
const VERIFY_BATCH: usize = 1 << 20;

#[derive(Debug, Deserialize)]
struct LiveMeta {
    #[serde(rename = "Root")]
    root: u64,
    #[serde(rename = "Hash")]
    hash: String,
}

/// Audits the directory and returns the first fatal inconsistency found.
pub fn verify_directory(
    dir: &FsPath,
    config: &MptConfig,
    observer: &mut dyn VerificationObserver,
) -> Result<(), MptError> {
    let _guard = DirectoryLock::acquire(dir)?;
    if dirlock::is_dirty(dir) {
        return Err(MptError::DirtyDirectory(dir.to_path_buf()));
    }

    observer.progress("checking stock layouts");
    verify_stock_layout(
        &dir.join("branches"),
        BranchCodec::new(config).encoded_size(),
    )?;
    verify_stock_layout(
        &dir.join("extensions"),
        ExtensionCodec::new(config).encoded_size(),
    )?;
    verify_stock_layout(
        &dir.join("accounts"),
        AccountCodec::new(config).encoded_size(),
    )?;
    verify_stock_layout(&dir.join("values"), ValueCodec::new(config).encoded_size())?;

    let cache_config = NodeCacheConfig {
        background_flush_period: None,
        ..Default::default()
    };
    let forest = Forest::open(dir, config.clone(), &cache_config)?;
    let stocks = &forest.inner.stocks;

    observer.progress("checking node references");
    let branch_ids = stocks.branches.get_ids();
    let extension_ids = stocks.extensions.get_ids();
    let account_ids = stocks.accounts.get_ids();
    let value_ids = stocks.values.get_ids();
    let contains = |id: NodeId| -> bool {
        match id.kind() {
            None => true,
            Some(NodeKind::Branch) => branch_ids.contains(id.index()),
            Some(NodeKind::Extension) => extension_ids.contains(id.index()),
            Some(NodeKind::Account) => account_ids.contains(id.index()),
            Some(NodeKind::Value) => value_ids.contains(id.index()),
        }
    };

    let mut scanned = 0usize;
    for index in branch_ids.iter() {
        let branch = stocks.branches.get(index)?;
        for child in &branch.children {
            if !contains(child.id()) {
                return Err(MptError::corrupt(format!(
                    "branch {index} references missing node {:?}",
                    child.id()
                )));
            }
        }
        scanned += 1;
        if scanned % VERIFY_BATCH == 0 {
            observer.progress(&format!("scanned {scanned} nodes"));
        }
    }
    for index in extension_ids.iter() {
        let extension = stocks.extensions.get(index)?;
        let next = extension.next.id();
        if !contains(next) {
            return Err(MptError::corrupt(format!(
                "extension {index} references missing node {next:?}"
            )));
        }
        if next.kind() != Some(NodeKind::Branch) {
            return Err(MptError::corrupt(format!(
                "extension {index} is not followed by a branch"
            )));
        }
    }
    let mut referenced_codes = FxHashSet::default();
    for index in account_ids.iter() {
        let account = stocks.accounts.get(index)?;
        if !contains(account.storage.id()) {
            return Err(MptError::corrupt(format!(
                "account {index} references missing storage node {:?}",
                account.storage.id()
            )));
        }
        if !account.info.code_hash.is_zero() && account.info.code_hash != *EMPTY_CODE_HASH {
            referenced_codes.insert(account.info.code_hash);
        }
    }

    observer.progress("recomputing hashes");
    let roots = load_roots(dir)?;
    for batch in roots.chunks(VERIFY_BATCH) {
        hasher::verify_hashes(&forest.inner, batch)?;
        observer.progress(&format!("verified {} roots", batch.len()));
    }

    observer.progress("checking the code log");
    let codes = CodeStore::open(dir)?;
    for hash in &referenced_codes {
        match codes.get(hash) {
            None => return Err(MptError::MissingCode(*hash)),
            Some(bytes) => {
                if crate::types::keccak256(&bytes) != *hash {
                    return Err(MptError::BadCodeHash(*hash));
                }
            }
        }
    }
    for (hash, _) in codes.codes() {
        if !referenced_codes.contains(&hash) {
            observer.issue(&format!("unreferenced code {hash:#x} in the code log"));
        }
    }

    debug!(dir = %dir.display(), roots = roots.len(), "verification passed");
    Ok(())
}

/// Roots to verify: every journaled block root of an archive, or the single
/// live root of a plain state directory.
fn load_roots(dir: &FsPath) -> Result<Vec<(NodeReference, H256)>, MptError> {
    let roots_path = dir.join(ROOTS_FILE);
    if roots_path.exists() {
        let data = fs::read(&roots_path)?;
        if data.len() % ROOT_RECORD_SIZE != 0 {
            return Err(MptError::corrupt(format!(
                "{} holds a partial root record",
                roots_path.display()
            )));
        }
        return Ok(data
            .chunks_exact(ROOT_RECORD_SIZE)
            .map(|record| {
                let id = NodeId::from_bytes(record[..8].try_into().unwrap());
                (NodeReference::new(id), H256::from_slice(&record[8..]))
            })
            .collect());
    }

    let live_path = dir.join(LIVE_META_FILE);
    if live_path.exists() {
        let meta: LiveMeta = serde_json::from_slice(&fs::read(&live_path)?)?;
        let root = NodeReference::new(NodeId::from_bytes(meta.root.to_be_bytes()));
        let hash = decode_hash(&meta.hash)?;
        return Ok(vec![(root, hash)]);
    }

    Ok(Vec::new())
}

fn decode_hash(hex: &str) -> Result<H256, MptError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    if hex.len() != 64 {
        return Err(MptError::corrupt("recorded root hash has the wrong length"));
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
        let high = hex_nibble(chunk[0])?;
        let low = hex_nibble(chunk[1])?;
        out[i] = (high << 4) | low;
    }
    Ok(H256(out))
}

fn hex_nibble(c: u8) -> Result<u8, MptError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(MptError::corrupt("recorded root hash is not hex")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MptConfig;
    use crate::state::MptState;
    use crate::types::{Address, Key, U256, Value};
    use std::fs;
    use tempfile::TempDir;

    fn cache_config() -> NodeCacheConfig {
        NodeCacheConfig {
            background_flush_period: None,
            ..Default::default()
        }
    }

    fn addr(byte: u8) -> Address {
        let mut address = Address::zero();
        address.0[0] = byte;
        address
    }

    fn build_state(dir: &TempDir) {
        let state = MptState::open(dir.path(), MptConfig::S5_LIVE, &cache_config()).unwrap();
        for i in 1..6u8 {
            state.set_balance(&addr(i), U256::from(i as u64 * 100)).unwrap();
            state.set_nonce(&addr(i), i as u64).unwrap();
            state
                .set_storage(&addr(i), &Key::repeat_byte(i), Value::repeat_byte(0x40 + i))
                .unwrap();
        }
        state.set_code(&addr(1), b"some contract").unwrap();
        state.close().unwrap();
    }

    #[test]
    fn clean_directory_passes() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()).unwrap();
    }

    #[test]
    fn verification_is_repeatable() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()).unwrap();
        verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()).unwrap();
    }

    #[test]
    fn wrong_configuration_is_rejected() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        assert!(verify_directory(dir.path(), &MptConfig::S4_LIVE, &mut ()).is_err());
    }

    fn flip_byte(path: &std::path::Path, offset_from_start: u64) {
        let mut data = fs::read(path).unwrap();
        let at = offset_from_start as usize % data.len();
        data[at] ^= 0x01;
        fs::write(path, data).unwrap();
    }

    #[test]
    fn mutated_account_record_is_detected() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        flip_byte(&dir.path().join("accounts").join("values.dat"), 25);
        assert!(verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()).is_err());
    }

    #[test]
    fn mutated_value_record_is_detected() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        flip_byte(&dir.path().join("values").join("values.dat"), 40);
        assert!(verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()).is_err());
    }

    #[test]
    fn mutated_code_log_is_detected() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        // flip inside the code body, past the 36-byte record header
        flip_byte(&dir.path().join("codes.dat"), 40);
        assert!(verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()).is_err());
    }

    #[test]
    fn mutated_freelist_is_detected() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        let freelist = dir.path().join("values").join("freelist.dat");
        let mut data = fs::read(&freelist).unwrap();
        data.extend_from_slice(&999u64.to_be_bytes());
        fs::write(&freelist, data).unwrap();
        assert!(verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()).is_err());
    }

    #[test]
    fn dirty_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        build_state(&dir);
        fs::write(dir.path().join("~dirty"), []).unwrap();
        assert!(matches!(
            verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut ()),
            Err(MptError::DirtyDirectory(_))
        ));
    }

    #[test]
    fn archive_directory_verifies_every_root() {
        use crate::archive::ArchiveTrie;
        use crate::config::ArchiveConfig;
        use crate::update::Update;

        let dir = TempDir::new().unwrap();
        {
            let archive = ArchiveTrie::open(
                dir.path(),
                MptConfig::S5_ARCHIVE,
                &cache_config(),
                ArchiveConfig::default(),
            )
            .unwrap();
            for block in 0..3u64 {
                let mut update = Update::default();
                update.set_balance(addr(1), U256::from(block + 1));
                archive.add(block, &update, None).unwrap();
            }
            archive.close().unwrap();
        }
        verify_directory(dir.path(), &MptConfig::S5_ARCHIVE, &mut ()).unwrap();

        // a flipped bit in a journaled root hash must be caught
        flip_byte(&dir.path().join("roots.dat"), 20);
        assert!(verify_directory(dir.path(), &MptConfig::S5_ARCHIVE, &mut ()).is_err());
    }

    #[test]
    fn unreferenced_code_is_reported_not_fatal() {
        struct Collecting {
            issues: Vec<String>,
        }
        impl VerificationObserver for Collecting {
            fn issue(&mut self, message: &str) {
                self.issues.push(message.to_string());
            }
        }

        let dir = TempDir::new().unwrap();
        {
            let state = MptState::open(dir.path(), MptConfig::S5_LIVE, &cache_config()).unwrap();
            state.set_code(&addr(1), b"kept code").unwrap();
            state.set_code(&addr(1), b"replacement code").unwrap();
            state.close().unwrap();
        }
        let mut observer = Collecting { issues: Vec::new() };
        verify_directory(dir.path(), &MptConfig::S5_LIVE, &mut observer).unwrap();
        assert_eq!(observer.issues.len(), 1, "the orphaned code must be reported");
    }
}
