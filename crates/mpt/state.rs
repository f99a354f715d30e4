use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::code_store::CodeStore;
use crate::config::{MptConfig, NodeCacheConfig};
use crate::dirlock::{self, DirectoryLock};
use crate::error::MptError;
use crate::forest::Forest;
use crate::live::LiveTrie;
use crate::node::{NodeId, NodeReference};
use crate::types::{AccountInfo, Address, EMPTY_CODE_HASH, Key, U256, Value};
use crate::update::Update;

const LIVE_META_FILE: &str = "live.json";

#[derive(Debug, Serialize, Deserialize)]
struct LiveMeta {
    #[serde(rename = "Root")]
    root: u64,
    #[serde(rename = "Hash")]
    hash: String,
}

/// The mutable world-state interface over a live trie plus the code store.
pub struct MptState {
    dir: PathBuf,
    trie: LiveTrie,
    codes: CodeStore,
    /// Present when this state owns the directory lock and dirty sentinel;
    /// absent when an archive manages the directory.
    guard: Option<DirectoryLock>,
}

impl MptState {
    /// Opens (or creates) a state directory for exclusive use.
    pub fn open(
        dir: &FsPath,
        config: MptConfig,
        cache_config: &NodeCacheConfig,
    ) -> Result<Self, MptError> {
        let guard = DirectoryLock::acquire(dir)?;
        dirlock::claim_clean_directory(dir)?;
        let mut state = Self::open_unguarded(dir, config, cache_config)?;
        state.guard = Some(guard);
        Ok(state)
    }

    /// Opens the state without taking ownership of the directory lock and
    /// dirty sentinel; the caller is responsible for both.
    pub(crate) fn open_unguarded(
        dir: &FsPath,
        config: MptConfig,
        cache_config: &NodeCacheConfig,
    ) -> Result<Self, MptError> {
        let forest = Arc::new(Forest::open(dir, config, cache_config)?);
        let codes = CodeStore::open(dir)?;

        let root = match read_live_meta(dir)? {
            Some(meta) => NodeReference::new(NodeId::from_bytes(meta.root.to_be_bytes())),
            None => NodeReference::empty(),
        };
        let trie = LiveTrie::new(forest, root);

        debug!(dir = %dir.display(), "state opened");
        Ok(MptState {
            dir: dir.to_path_buf(),
            trie,
            codes,
            guard: None,
        })
    }

    pub fn trie(&self) -> &LiveTrie {
        &self.trie
    }

    pub fn forest(&self) -> &Arc<Forest> {
        self.trie.forest()
    }

    pub(crate) fn codes(&self) -> &CodeStore {
        &self.codes
    }

    // -----------------------------------------------------------------
    // account interface
    // -----------------------------------------------------------------

    pub fn exists(&self, address: &Address) -> Result<bool, MptError> {
        Ok(self.trie.get_account_info(address)?.1)
    }

    /// Creates the account, preserving nonce, balance and code of an
    /// existing account but dropping its storage. Creating an absent
    /// account is a no-op until its first non-empty write.
    pub fn create_account(&self, address: &Address) -> Result<(), MptError> {
        if self.exists(address)? {
            self.trie.clear_storage(address)?;
        }
        Ok(())
    }

    pub fn delete_account(&self, address: &Address) -> Result<(), MptError> {
        self.trie.set_account_info(address, AccountInfo::default())
    }

    pub fn get_balance(&self, address: &Address) -> Result<U256, MptError> {
        Ok(self.trie.get_account_info(address)?.0.balance)
    }

    pub fn set_balance(&self, address: &Address, balance: U256) -> Result<(), MptError> {
        let (mut info, _) = self.trie.get_account_info(address)?;
        if info.balance == balance {
            return Ok(());
        }
        info.balance = balance;
        self.trie.set_account_info(address, info)
    }

    pub fn get_nonce(&self, address: &Address) -> Result<u64, MptError> {
        Ok(self.trie.get_account_info(address)?.0.nonce)
    }

    pub fn set_nonce(&self, address: &Address, nonce: u64) -> Result<(), MptError> {
        let (mut info, _) = self.trie.get_account_info(address)?;
        if info.nonce == nonce {
            return Ok(());
        }
        info.nonce = nonce;
        self.trie.set_account_info(address, info)
    }

    pub fn get_code(&self, address: &Address) -> Result<Vec<u8>, MptError> {
        let (info, exists) = self.trie.get_account_info(address)?;
        if !exists || info.code_hash.is_zero() || info.code_hash == *EMPTY_CODE_HASH {
            return Ok(Vec::new());
        }
        self.codes
            .get(&info.code_hash)
            .ok_or(MptError::MissingCode(info.code_hash))
    }

    pub fn get_code_size(&self, address: &Address) -> Result<usize, MptError> {
        Ok(self.get_code(address)?.len())
    }

    pub fn get_code_hash(&self, address: &Address) -> Result<H256, MptError> {
        let (info, exists) = self.trie.get_account_info(address)?;
        if !exists {
            return Ok(H256::zero());
        }
        Ok(if info.code_hash.is_zero() {
            *EMPTY_CODE_HASH
        } else {
            info.code_hash
        })
    }

    pub fn set_code(&self, address: &Address, code: &[u8]) -> Result<(), MptError> {
        let (mut info, _) = self.trie.get_account_info(address)?;
        let code_hash = if code.is_empty() {
            H256::zero()
        } else {
            self.codes.add(code)?
        };
        if info.code_hash == code_hash {
            return Ok(());
        }
        info.code_hash = code_hash;
        self.trie.set_account_info(address, info)
    }

    pub fn get_storage(&self, address: &Address, key: &Key) -> Result<Value, MptError> {
        self.trie.get_value(address, key)
    }

    pub fn set_storage(&self, address: &Address, key: &Key, value: Value) -> Result<(), MptError> {
        self.trie.set_value(address, key, value)
    }

    pub fn clear_storage(&self, address: &Address) -> Result<(), MptError> {
        self.trie.clear_storage(address)
    }

    pub fn has_empty_storage(&self, address: &Address) -> Result<bool, MptError> {
        self.trie.has_empty_storage(address)
    }

    /// Applies a block's worth of changes in the canonical order: deletes,
    /// creates, balances, nonces, codes, slots.
    pub fn apply_update(&self, update: &Update) -> Result<(), MptError> {
        for address in &update.deleted_accounts {
            self.delete_account(address)?;
        }
        for address in &update.created_accounts {
            self.create_account(address)?;
        }
        for (address, balance) in &update.balances {
            self.set_balance(address, *balance)?;
        }
        for (address, nonce) in &update.nonces {
            self.set_nonce(address, *nonce)?;
        }
        for (address, code) in &update.codes {
            self.set_code(address, code)?;
        }
        for (address, key, value) in &update.slots {
            self.set_storage(address, key, *value)?;
        }
        Ok(())
    }

    /// Refreshes and returns the state root hash.
    pub fn get_hash(&self) -> Result<H256, MptError> {
        Ok(self.trie.update_hashes()?.0)
    }

    pub fn flush(&self) -> Result<(), MptError> {
        self.forest().flush()?;
        self.codes.flush()?;
        let hash = self.trie.get_hash()?;
        let meta = LiveMeta {
            root: u64::from_be_bytes(self.trie.root().id().to_bytes()),
            hash: encode_hash(&hash),
        };
        fs::write(
            self.dir.join(LIVE_META_FILE),
            serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), MptError> {
        self.trie.update_hashes()?;
        self.flush()?;
        self.forest().close()?;
        if self.guard.is_some() {
            dirlock::clear_dirty(&self.dir)?;
        }
        self.guard = None;
        debug!(dir = %self.dir.display(), "state closed");
        Ok(())
    }
}

fn read_live_meta(dir: &FsPath) -> Result<Option<LiveMeta>, MptError> {
    let path = dir.join(LIVE_META_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
}

fn encode_hash(hash: &H256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.as_bytes() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::keccak256;
    use hex_literal::hex;
    use proptest::collection::btree_map;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn cache_config() -> NodeCacheConfig {
        NodeCacheConfig {
            background_flush_period: None,
            ..Default::default()
        }
    }

    fn open_s5(dir: &TempDir) -> MptState {
        MptState::open(dir.path(), MptConfig::S5_LIVE, &cache_config()).unwrap()
    }

    fn addr(byte: u8) -> Address {
        let mut address = Address::zero();
        address.0[0] = byte;
        address
    }

    fn key(byte: u8) -> Key {
        let mut key = Key::zero();
        key.0[0] = byte;
        key
    }

    #[test]
    fn empty_state_has_the_ethereum_empty_root() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        assert_eq!(
            state.get_hash().unwrap().as_bytes(),
            hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
        );
        state.close().unwrap();
    }

    #[test]
    fn single_account_matches_the_reference_root() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_nonce(&addr(1), 10).unwrap();
        state.set_balance(&addr(1), U256::from(12)).unwrap();
        assert_eq!(
            state.get_hash().unwrap().as_bytes(),
            hex!("b2a1a4be2813ecd7b3e312d080e0f94b00a3247d361ddde75d926411660e042e")
        );
        state.close().unwrap();
    }

    #[test]
    fn account_with_storage_slot_matches_the_reference_root() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_nonce(&addr(1), 10).unwrap();
        state.set_balance(&addr(1), U256::from(12)).unwrap();
        state
            .set_storage(&addr(1), &key(1), Value::from(key(2).0))
            .unwrap();
        assert_eq!(
            state.get_hash().unwrap().as_bytes(),
            hex!("a175fd37774a9f29ce92f6ded173ed65340434c22af8d480a688f0dfd3980446")
        );
        state.close().unwrap();
    }

    #[test]
    fn two_accounts_match_the_reference_root() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_nonce(&addr(1), 10).unwrap();
        state.set_balance(&addr(2), U256::from(12)).unwrap();
        assert_eq!(
            state.get_hash().unwrap().as_bytes(),
            hex!("35cbb888517267cce1de8b870042f3777ecabf1b6f37ff9d9a68c1d2b74178c6")
        );
        state.close().unwrap();
    }

    #[test]
    fn values_round_trip() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);

        assert!(!state.exists(&addr(1)).unwrap());
        assert_eq!(state.get_balance(&addr(1)).unwrap(), U256::zero());

        state.set_balance(&addr(1), U256::from(1000)).unwrap();
        state.set_nonce(&addr(1), 7).unwrap();
        state.set_storage(&addr(1), &key(3), Value::repeat_byte(9)).unwrap();

        assert!(state.exists(&addr(1)).unwrap());
        assert_eq!(state.get_balance(&addr(1)).unwrap(), U256::from(1000));
        assert_eq!(state.get_nonce(&addr(1)).unwrap(), 7);
        assert_eq!(
            state.get_storage(&addr(1), &key(3)).unwrap(),
            Value::repeat_byte(9)
        );
        assert_eq!(state.get_storage(&addr(1), &key(4)).unwrap(), Value::zero());
        assert_eq!(state.get_storage(&addr(2), &key(3)).unwrap(), Value::zero());
        state.close().unwrap();
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let state = open_s5(&dir);
            state.set_balance(&addr(1), U256::from(55)).unwrap();
            state.set_storage(&addr(1), &key(1), Value::repeat_byte(1)).unwrap();
            state.set_code(&addr(1), b"code bytes").unwrap();
            state.close().unwrap();
        }
        let state = open_s5(&dir);
        assert_eq!(state.get_balance(&addr(1)).unwrap(), U256::from(55));
        assert_eq!(
            state.get_storage(&addr(1), &key(1)).unwrap(),
            Value::repeat_byte(1)
        );
        assert_eq!(state.get_code(&addr(1)).unwrap(), b"code bytes");
        state.close().unwrap();
    }

    #[test]
    fn deleting_an_account_restores_the_previous_root() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_balance(&addr(1), U256::from(1)).unwrap();
        let before = state.get_hash().unwrap();

        state.set_balance(&addr(2), U256::from(2)).unwrap();
        state.set_storage(&addr(2), &key(1), Value::repeat_byte(3)).unwrap();
        assert_ne!(state.get_hash().unwrap(), before);

        state.delete_account(&addr(2)).unwrap();
        assert_eq!(state.get_hash().unwrap(), before);
        state.close().unwrap();
    }

    #[test]
    fn deleting_a_slot_restores_the_previous_root() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_balance(&addr(1), U256::from(1)).unwrap();
        state.set_storage(&addr(1), &key(1), Value::repeat_byte(1)).unwrap();
        let before = state.get_hash().unwrap();

        state.set_storage(&addr(1), &key(2), Value::repeat_byte(2)).unwrap();
        assert_ne!(state.get_hash().unwrap(), before);

        state.set_storage(&addr(1), &key(2), Value::zero()).unwrap();
        assert_eq!(state.get_hash().unwrap(), before);
        state.close().unwrap();
    }

    #[test]
    fn idempotent_writes_change_nothing() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_balance(&addr(1), U256::from(5)).unwrap();
        state.set_storage(&addr(1), &key(1), Value::repeat_byte(4)).unwrap();
        let before = state.get_hash().unwrap();

        state.set_balance(&addr(1), U256::from(5)).unwrap();
        state.set_storage(&addr(1), &key(1), Value::repeat_byte(4)).unwrap();
        assert_eq!(state.get_hash().unwrap(), before);
        state.close().unwrap();
    }

    #[test]
    fn create_account_clears_storage_and_keeps_the_rest() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_balance(&addr(1), U256::from(9)).unwrap();
        state.set_nonce(&addr(1), 3).unwrap();
        state.set_storage(&addr(1), &key(1), Value::repeat_byte(1)).unwrap();

        state.create_account(&addr(1)).unwrap();
        assert_eq!(state.get_balance(&addr(1)).unwrap(), U256::from(9));
        assert_eq!(state.get_nonce(&addr(1)).unwrap(), 3);
        assert_eq!(state.get_storage(&addr(1), &key(1)).unwrap(), Value::zero());
        assert!(state.has_empty_storage(&addr(1)).unwrap());
        state.close().unwrap();
    }

    #[test]
    fn code_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        state.set_code(&addr(1), b"contract").unwrap();
        assert_eq!(state.get_code(&addr(1)).unwrap(), b"contract");
        assert_eq!(state.get_code_size(&addr(1)).unwrap(), 8);
        assert_eq!(state.get_code_hash(&addr(1)).unwrap(), keccak256(b"contract"));

        assert_eq!(state.get_code(&addr(2)).unwrap(), Vec::<u8>::new());
        assert_eq!(state.get_code_hash(&addr(2)).unwrap(), H256::zero());
        state.close().unwrap();
    }

    #[test]
    fn locked_directory_rejects_a_second_state() {
        let dir = TempDir::new().unwrap();
        let state = open_s5(&dir);
        assert!(matches!(
            MptState::open(dir.path(), MptConfig::S5_LIVE, &cache_config()),
            Err(MptError::LockHeld(_))
        ));
        state.close().unwrap();
    }

    #[test]
    fn config_mismatch_is_rejected_on_reopen() {
        let dir = TempDir::new().unwrap();
        open_s5(&dir).close().unwrap();
        assert!(matches!(
            MptState::open(dir.path(), MptConfig::S4_LIVE, &cache_config()),
            Err(MptError::FormatMismatch(_))
        ));
    }

    #[test]
    fn precomputed_hashes_can_be_applied_as_hints() {
        let dir_a = TempDir::new().unwrap();
        let state_a = open_s5(&dir_a);
        state_a.set_balance(&addr(1), U256::from(10)).unwrap();
        state_a.set_storage(&addr(1), &key(1), Value::repeat_byte(2)).unwrap();
        state_a.set_nonce(&addr(2), 4).unwrap();
        let (expected, hints) = state_a.trie().update_hashes().unwrap();
        state_a.close().unwrap();

        let dir_b = TempDir::new().unwrap();
        let state_b = open_s5(&dir_b);
        state_b.set_balance(&addr(1), U256::from(10)).unwrap();
        state_b.set_storage(&addr(1), &key(1), Value::repeat_byte(2)).unwrap();
        state_b.set_nonce(&addr(2), 4).unwrap();
        state_b.trie().set_hashes(&hints).unwrap();
        assert_eq!(state_b.trie().get_hash().unwrap(), expected);
        state_b.close().unwrap();
    }

    #[test]
    fn hash_encoding_is_full_width() {
        assert_eq!(encode_hash(&H256::zero()).len(), 64);
        assert_eq!(encode_hash(&H256::repeat_byte(0xab)), "ab".repeat(32));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn shadow_map_equivalence(
            accounts in btree_map(0u8..20, (any::<u64>(), 1u64..u64::MAX), 1..12),
            slots in btree_map((0u8..20, 0u8..6), 1u8..255, 0..24),
        ) {
            let dir = TempDir::new().unwrap();
            let state = open_s5(&dir);

            let mut expected_slots: BTreeMap<(u8, u8), Value> = BTreeMap::new();
            for (a, (nonce, balance)) in &accounts {
                state.set_nonce(&addr(*a), *nonce).unwrap();
                state.set_balance(&addr(*a), U256::from(*balance)).unwrap();
            }
            for ((a, k), v) in &slots {
                if accounts.contains_key(a) {
                    state.set_storage(&addr(*a), &key(*k), Value::repeat_byte(*v)).unwrap();
                    expected_slots.insert((*a, *k), Value::repeat_byte(*v));
                }
            }

            for (a, (nonce, balance)) in &accounts {
                prop_assert!(state.exists(&addr(*a)).unwrap());
                prop_assert_eq!(state.get_nonce(&addr(*a)).unwrap(), *nonce);
                prop_assert_eq!(state.get_balance(&addr(*a)).unwrap(), U256::from(*balance));
            }
            for ((a, k), v) in &expected_slots {
                prop_assert_eq!(&state.get_storage(&addr(*a), &key(*k)).unwrap(), v);
            }
            prop_assert!(!state.exists(&addr(99)).unwrap());
            state.forest().check(&state.trie().root()).unwrap();
            state.close().unwrap();
        }

        #[test]
        fn insertion_order_does_not_change_the_root(
            mut accounts in proptest::collection::vec((0u8..30, 1u64..1000), 2..10),
        ) {
            accounts.sort();
            accounts.dedup_by_key(|(a, _)| *a);

            let dir_a = TempDir::new().unwrap();
            let state_a = open_s5(&dir_a);
            for (a, balance) in &accounts {
                state_a.set_balance(&addr(*a), U256::from(*balance)).unwrap();
            }
            let hash_a = state_a.get_hash().unwrap();
            state_a.close().unwrap();

            let dir_b = TempDir::new().unwrap();
            let state_b = open_s5(&dir_b);
            for (a, balance) in accounts.iter().rev() {
                state_b.set_balance(&addr(*a), U256::from(*balance)).unwrap();
            }
            let hash_b = state_b.get_hash().unwrap();
            state_b.close().unwrap();

            prop_assert_eq!(hash_a, hash_b);
        }

        #[test]
        fn direct_scheme_round_trips_too(
            accounts in btree_map(0u8..20, 1u64..1000, 1..8),
        ) {
            let dir = TempDir::new().unwrap();
            let state =
                MptState::open(dir.path(), MptConfig::S4_LIVE, &cache_config()).unwrap();
            for (a, balance) in &accounts {
                state.set_balance(&addr(*a), U256::from(*balance)).unwrap();
            }
            for (a, balance) in &accounts {
                prop_assert_eq!(state.get_balance(&addr(*a)).unwrap(), U256::from(*balance));
            }
            let hash = state.get_hash().unwrap();
            prop_assert_ne!(hash, H256::zero());
            state.forest().check(&state.trie().root()).unwrap();
            state.close().unwrap();
        }
    }
}
