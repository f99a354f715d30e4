use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path as FsPath, PathBuf};
use std::time::{Duration, Instant};

use ethereum_types::H256;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointCoordinator, CheckpointParticipant};
use crate::code_store::CodeStore;
use crate::config::{ArchiveConfig, MptConfig, NodeCacheConfig};
use crate::dirlock::{self, DirectoryLock};
use crate::error::MptError;
use crate::forest::{ForestInner, NodeHashes, Stocks};
use crate::node::{Node, NodeReference};
use crate::path::Path;
use crate::state::MptState;
use crate::types::{AccountInfo, Address, Key, U256, Value};
use crate::update::Update;

const ROOTS_FILE: &str = "roots.dat";
const ROOT_RECORD_SIZE: usize = 8 + 32;
const MARKER_DIR: &str = "roots";
const COMMITTED_MARKER: &str = "committed.json";
const PREPARE_MARKER: &str = "prepare.json";
const CHECKPOINT_DIR: &str = "checkpoint";

/// One archived block: the frozen root and its hash.
#[derive(Clone, Debug)]
struct Root {
    reference: NodeReference,
    hash: H256,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
struct RootsCheckpointMeta {
    #[serde(rename = "Checkpoint")]
    checkpoint: Checkpoint,
    #[serde(rename = "NumRoots")]
    num_roots: u64,
}

/// Append-only journal of per-block roots; index equals block height.
struct RootJournal {
    dir: PathBuf,
    file: Mutex<File>,
    entries: RwLock<Vec<Root>>,
}

impl RootJournal {
    fn open(dir: &FsPath, lenient: bool) -> Result<Self, MptError> {
        fs::create_dir_all(dir.join(MARKER_DIR))?;
        let path = dir.join(ROOTS_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.len() % ROOT_RECORD_SIZE != 0 && !lenient {
            return Err(MptError::corrupt(format!(
                "{} holds a partial root record",
                path.display()
            )));
        }
        let entries: Vec<Root> = data
            .chunks_exact(ROOT_RECORD_SIZE)
            .map(|record| {
                let id = crate::node::NodeId::from_bytes(record[..8].try_into().unwrap());
                Root {
                    reference: NodeReference::new(id),
                    hash: H256::from_slice(&record[8..]),
                }
            })
            .collect();
        file.seek(SeekFrom::Start((entries.len() * ROOT_RECORD_SIZE) as u64))?;

        Ok(RootJournal {
            dir: dir.to_path_buf(),
            file: Mutex::new(file),
            entries: RwLock::new(entries),
        })
    }

    fn height(&self) -> u64 {
        self.entries.read().len() as u64
    }

    fn get(&self, block: u64) -> Option<Root> {
        self.entries.read().get(block as usize).cloned()
    }

    fn last(&self) -> Option<Root> {
        self.entries.read().last().cloned()
    }

    fn append(&self, root: Root) -> Result<(), MptError> {
        let mut file = self.file.lock();
        let mut entries = self.entries.write();
        let mut record = [0u8; ROOT_RECORD_SIZE];
        record[..8].copy_from_slice(&root.reference.id().to_bytes());
        record[8..].copy_from_slice(root.hash.as_bytes());
        file.write_all(&record)?;
        entries.push(root);
        Ok(())
    }

    fn truncate_to(&self, count: u64) -> Result<(), MptError> {
        let mut file = self.file.lock();
        let mut entries = self.entries.write();
        file.set_len(count * ROOT_RECORD_SIZE as u64)?;
        file.sync_data()?;
        file.seek(SeekFrom::Start(count * ROOT_RECORD_SIZE as u64))?;
        entries.truncate(count as usize);
        Ok(())
    }

    fn flush(&self) -> Result<(), MptError> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.dir.join(MARKER_DIR).join(name)
    }

    fn read_marker(&self, name: &str) -> Result<Option<RootsCheckpointMeta>, MptError> {
        let path = self.marker_path(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }
}

impl CheckpointParticipant for RootJournal {
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
            "root journal cannot guarantee checkpoint {checkpoint}"
        )))
    }

    fn prepare(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
        self.flush()?;
        let meta = RootsCheckpointMeta {
            checkpoint,
            num_roots: self.height(),
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
                "root journal: commit of checkpoint {checkpoint} without prepare"
            ))
        })?;
        if prepared.checkpoint != checkpoint {
            return Err(MptError::corrupt(format!(
                "root journal: prepared checkpoint {} does not match commit of {checkpoint}",
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
            MptError::corrupt("root journal: no committed checkpoint to restore")
        })?;
        if meta.checkpoint != checkpoint {
            return Err(MptError::corrupt(format!(
                "root journal: committed checkpoint {} does not match restore of {checkpoint}",
                meta.checkpoint
            )));
        }
        self.truncate_to(meta.num_roots)?;
        Ok(())
    }
}

/// Per-account entry of a [`Diff`]. `reset` marks deletion (or recreation)
/// of the account; field options carry the new values of changed fields;
/// `slots` holds changed storage slots, zero meaning removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountDiff {
    pub reset: bool,
    pub balance: Option<U256>,
    pub nonce: Option<u64>,
    pub code_hash: Option<H256>,
    pub slots: BTreeMap<Key, Value>,
}

impl AccountDiff {
    fn is_empty(&self) -> bool {
        !self.reset
            && self.balance.is_none()
            && self.nonce.is_none()
            && self.code_hash.is_none()
            && self.slots.is_empty()
    }
}

/// State difference between two blocks, keyed by account address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diff {
    pub accounts: BTreeMap<Address, AccountDiff>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

struct CheckpointSchedule {
    last_height: u64,
    deadline: Instant,
}

/// The archive: one frozen trie root per block over a shared forest, with
/// coordinated checkpoints for crash recovery.
///
/// `add` is the only mutation entry point and is self-serializing; readers
/// run concurrently against any archived block. The first internal error
/// poisons the archive: every subsequent call returns it.
pub struct ArchiveTrie {
    dir: PathBuf,
    state: MptState,
    roots: RootJournal,
    coordinator: CheckpointCoordinator,
    archive_config: ArchiveConfig,
    add_mutex: Mutex<()>,
    error: RwLock<Option<MptError>>,
    schedule: Mutex<CheckpointSchedule>,
    _guard: DirectoryLock,
}

impl ArchiveTrie {
    pub fn open(
        dir: &FsPath,
        config: MptConfig,
        cache_config: &NodeCacheConfig,
        archive_config: ArchiveConfig,
    ) -> Result<Self, MptError> {
        if !config.mode.is_immutable() {
            return Err(MptError::FormatMismatch(format!(
                "archive requires an immutable configuration, got {}",
                config.name
            )));
        }
        let guard = DirectoryLock::acquire(dir)?;
        dirlock::claim_clean_directory(dir)?;

        let state = MptState::open_unguarded(dir, config, cache_config)?;
        let roots = RootJournal::open(dir, false)?;
        let coordinator = CheckpointCoordinator::open(dir.join(CHECKPOINT_DIR))?;
        {
            let stocks = &state.forest().inner.stocks;
            let mut participants: Vec<&dyn CheckpointParticipant> =
                stocks.participants().to_vec();
            participants.push(state.codes());
            participants.push(&roots);
            coordinator.initialize(&participants)?;
        }

        if let Some(head) = roots.last() {
            state.trie().set_root(head.reference.clone());
        }

        // a random slack on the first deadline keeps fleets of archives from
        // checkpointing in lockstep
        let period = archive_config.checkpoint_period;
        let offset = Duration::from_millis(
            rand::thread_rng().gen_range(0..=period.as_millis().max(1) as u64 / 10),
        );
        let schedule = CheckpointSchedule {
            last_height: roots.height(),
            deadline: Instant::now() + period - offset,
        };

        info!(dir = %dir.display(), blocks = roots.height(), "archive opened");
        Ok(ArchiveTrie {
            dir: dir.to_path_buf(),
            state,
            roots,
            coordinator,
            archive_config,
            add_mutex: Mutex::new(()),
            error: RwLock::new(None),
            schedule: Mutex::new(schedule),
            _guard: guard,
        })
    }

    fn check_healthy(&self) -> Result<(), MptError> {
        match &*self.error.read() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn poison(&self, err: &MptError) {
        // usage errors don't poison, internal failures do
        if matches!(err, MptError::InvalidBlock { .. }) {
            return;
        }
        let mut slot = self.error.write();
        if slot.is_none() {
            *slot = Some(err.clone());
        }
    }

    /// Appends the state of `block`: applies the update to the head trie,
    /// freezes the new root, refreshes hashes (or applies the provided
    /// hint) and journals the root. Skipped blocks are padded with the
    /// previous head.
    pub fn add(
        &self,
        block: u64,
        update: &Update,
        hint: Option<&NodeHashes>,
    ) -> Result<(), MptError> {
        self.check_healthy()?;
        let _add = self.add_mutex.lock();
        let result = self.add_locked(block, update, hint);
        if let Err(err) = &result {
            self.poison(err);
        }
        result
    }

    fn add_locked(
        &self,
        block: u64,
        update: &Update,
        hint: Option<&NodeHashes>,
    ) -> Result<(), MptError> {
        let height = self.roots.height();
        if block < height {
            return Err(MptError::invalid_block(
                block,
                format!("the archive already holds {height} blocks"),
            ));
        }

        // empty blocks share the previous head, reference and hash alike
        while self.roots.height() < block {
            let pad = match self.roots.last() {
                Some(head) => head,
                None => Root {
                    reference: NodeReference::empty(),
                    hash: self
                        .state
                        .forest()
                        .get_hash_for(&NodeReference::empty())?,
                },
            };
            self.roots.append(pad)?;
        }

        let mut update = update.clone();
        update.normalize();
        self.state.apply_update(&update)?;

        let root = self.state.trie().root();
        self.state.forest().freeze(&root)?;
        let hash = match hint {
            Some(hashes) => {
                self.state.forest().set_hashes_for(&root, hashes)?;
                self.state.forest().get_hash_for(&root)?
            }
            None => self.state.forest().update_hashes_for(&root)?.0,
        };
        self.roots.append(Root {
            reference: root,
            hash,
        })?;
        debug!(block, %hash, "block archived");

        self.maybe_checkpoint()
    }

    /// Number of archived blocks; `None` for a fresh archive.
    pub fn block_height(&self) -> Result<Option<u64>, MptError> {
        self.check_healthy()?;
        Ok(self.roots.height().checked_sub(1))
    }

    fn root_of(&self, block: u64) -> Result<Root, MptError> {
        self.roots.get(block).ok_or_else(|| {
            MptError::invalid_block(
                block,
                format!("the archive holds {} blocks", self.roots.height()),
            )
        })
    }

    pub fn exists(&self, block: u64, address: &Address) -> Result<bool, MptError> {
        Ok(self.get_account_info(block, address)?.1)
    }

    pub fn get_account_info(
        &self,
        block: u64,
        address: &Address,
    ) -> Result<(AccountInfo, bool), MptError> {
        self.check_healthy()?;
        let root = self.root_of(block)?;
        self.state
            .forest()
            .get_account_info(&root.reference, address)
    }

    pub fn get_balance(&self, block: u64, address: &Address) -> Result<U256, MptError> {
        Ok(self.get_account_info(block, address)?.0.balance)
    }

    pub fn get_nonce(&self, block: u64, address: &Address) -> Result<u64, MptError> {
        Ok(self.get_account_info(block, address)?.0.nonce)
    }

    pub fn get_code(&self, block: u64, address: &Address) -> Result<Vec<u8>, MptError> {
        let (info, exists) = self.get_account_info(block, address)?;
        if !exists || info.code_hash.is_zero() {
            return Ok(Vec::new());
        }
        self.state
            .codes()
            .get(&info.code_hash)
            .ok_or(MptError::MissingCode(info.code_hash))
    }

    pub fn get_storage(
        &self,
        block: u64,
        address: &Address,
        key: &Key,
    ) -> Result<Value, MptError> {
        self.check_healthy()?;
        let root = self.root_of(block)?;
        self.state.forest().get_value(&root.reference, address, key)
    }

    pub fn get_hash(&self, block: u64) -> Result<H256, MptError> {
        self.check_healthy()?;
        Ok(self.root_of(block)?.hash)
    }

    /// Witness hash of a single account at a block; not supported by the
    /// archive's node layout.
    pub fn get_account_hash(&self, _block: u64, _address: &Address) -> Result<H256, MptError> {
        Err(MptError::NotImplemented("account hash in archive mode"))
    }

    /// Changes between two archived blocks, `from` excluded, `to` included.
    pub fn get_diff(&self, from: u64, to: u64) -> Result<Diff, MptError> {
        self.check_healthy()?;
        let from_root = self.root_of(from)?;
        let to_root = self.root_of(to)?;
        self.compute_diff(Some(&from_root.reference), Some(&to_root.reference))
    }

    /// Changes introduced by one block; block 0 is diffed against the empty
    /// state.
    pub fn get_diff_for_block(&self, block: u64) -> Result<Diff, MptError> {
        self.check_healthy()?;
        let to_root = self.root_of(block)?;
        if block == 0 {
            self.compute_diff(None, Some(&to_root.reference))
        } else {
            let from_root = self.root_of(block - 1)?;
            self.compute_diff(Some(&from_root.reference), Some(&to_root.reference))
        }
    }

    /// Forces a checkpoint covering everything archived so far.
    pub fn create_checkpoint(&self) -> Result<Checkpoint, MptError> {
        self.check_healthy()?;
        let result = self.create_checkpoint_locked();
        if let Err(err) = &result {
            self.poison(err);
        }
        result
    }

    fn create_checkpoint_locked(&self) -> Result<Checkpoint, MptError> {
        self.state.forest().flush()?;
        self.state.codes().flush()?;
        let stocks = &self.state.forest().inner.stocks;
        let mut participants: Vec<&dyn CheckpointParticipant> = stocks.participants().to_vec();
        participants.push(self.state.codes());
        participants.push(&self.roots);
        let checkpoint = self.coordinator.create_checkpoint(&participants)?;
        info!(checkpoint, blocks = self.roots.height(), "archive checkpoint");
        Ok(checkpoint)
    }

    fn maybe_checkpoint(&self) -> Result<(), MptError> {
        let height = self.roots.height();
        let interval = self.archive_config.checkpoint_interval.max(1);
        let mut schedule = self.schedule.lock();
        let crossed = height / interval > schedule.last_height / interval;
        let expired = Instant::now() >= schedule.deadline;
        if !crossed && !expired {
            return Ok(());
        }
        self.create_checkpoint_locked()?;
        schedule.last_height = height;
        schedule.deadline = Instant::now() + self.archive_config.checkpoint_period;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), MptError> {
        self.check_healthy()?;
        self.state.forest().flush()?;
        self.state.codes().flush()?;
        self.roots.flush()
    }

    pub fn close(self) -> Result<(), MptError> {
        let healthy = self.check_healthy();
        if healthy.is_ok() {
            self.flush()?;
            self.create_checkpoint_locked()?;
        }
        self.state.close()?;
        dirlock::clear_dirty(&self.dir)?;
        debug!(dir = %self.dir.display(), "archive closed");
        healthy
    }

    /// Restores a crashed archive directory to `block`, which must be
    /// covered by the last committed checkpoint. Clears the dirty mark on
    /// success; the directory can be reopened normally afterwards.
    pub fn restore_block_height(
        dir: &FsPath,
        config: MptConfig,
        block: u64,
    ) -> Result<(), MptError> {
        let _guard = DirectoryLock::acquire(dir)?;

        let stocks = Stocks::open(dir, &config)?;
        let codes = CodeStore::open_for_restore(dir)?;
        let roots = RootJournal::open(dir, true)?;
        let coordinator = CheckpointCoordinator::open(dir.join(CHECKPOINT_DIR))?;

        let mut participants: Vec<&dyn CheckpointParticipant> = stocks.participants().to_vec();
        participants.push(&codes);
        participants.push(&roots);
        let checkpoint = coordinator.restore(&participants)?;

        if block + 1 > roots.height() {
            return Err(MptError::invalid_block(
                block,
                format!(
                    "checkpoint {checkpoint} covers only {} blocks",
                    roots.height()
                ),
            ));
        }
        roots.truncate_to(block + 1)?;
        stocks.flush()?;

        dirlock::clear_dirty(dir)?;
        info!(dir = %dir.display(), block, checkpoint, "archive restored");
        Ok(())
    }

    // -----------------------------------------------------------------
    // diff computation
    // -----------------------------------------------------------------

    fn compute_diff(
        &self,
        from: Option<&NodeReference>,
        to: Option<&NodeReference>,
    ) -> Result<Diff, MptError> {
        let inner = &self.state.forest().inner;
        let full_len = if inner.config.use_hashed_paths {
            Path::MAX_NIBBLES
        } else {
            40
        };
        let mut diff = Diff::default();
        diff_accounts(
            inner,
            cursor_for(from),
            cursor_for(to),
            0,
            full_len,
            &mut diff,
        )?;
        Ok(diff)
    }
}

#[derive(Clone)]
struct DiffCursor {
    reference: NodeReference,
    /// Nibbles of the node's own path or suffix already consumed.
    skip: usize,
}

fn cursor_for(reference: Option<&NodeReference>) -> Option<DiffCursor> {
    match reference {
        Some(r) if !r.is_empty() => Some(DiffCursor {
            reference: r.clone(),
            skip: 0,
        }),
        _ => None,
    }
}

fn cursors_equal(a: &Option<DiffCursor>, b: &Option<DiffCursor>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.reference.id() == b.reference.id() && a.skip == b.skip,
        _ => false,
    }
}

/// Advances a cursor by one nibble through the virtual uniform-depth trie,
/// stepping through compressed extension paths and leaf suffixes.
fn step(
    inner: &ForestInner,
    cursor: &DiffCursor,
    nibble: u8,
    depth: usize,
    full_len: usize,
) -> Result<Option<DiffCursor>, MptError> {
    let cell = inner.get_shared_node(&cursor.reference)?;
    let node = cell.read();
    Ok(match &*node {
        Node::Empty => None,
        Node::Branch(branch) => {
            let child = branch.children[nibble as usize].clone();
            if child.is_empty() {
                None
            } else {
                Some(DiffCursor {
                    reference: child,
                    skip: 0,
                })
            }
        }
        Node::Extension(ext) => {
            if ext.path.get(cursor.skip) != nibble {
                None
            } else if cursor.skip + 1 == ext.path.len() {
                Some(DiffCursor {
                    reference: ext.next.clone(),
                    skip: 0,
                })
            } else {
                Some(DiffCursor {
                    reference: cursor.reference.clone(),
                    skip: cursor.skip + 1,
                })
            }
        }
        Node::Account(account) => {
            let entry_depth = depth - cursor.skip;
            let suffix = inner
                .address_to_path(&account.address)
                .suffix(full_len - entry_depth);
            if suffix.get(cursor.skip) == nibble {
                Some(DiffCursor {
                    reference: cursor.reference.clone(),
                    skip: cursor.skip + 1,
                })
            } else {
                None
            }
        }
        Node::Value(value) => {
            let entry_depth = depth - cursor.skip;
            let suffix = inner
                .key_to_path(&value.key)
                .suffix(full_len - entry_depth);
            if suffix.get(cursor.skip) == nibble {
                Some(DiffCursor {
                    reference: cursor.reference.clone(),
                    skip: cursor.skip + 1,
                })
            } else {
                None
            }
        }
    })
}

struct AccountLeaf {
    address: Address,
    info: AccountInfo,
    storage: NodeReference,
}

fn account_at(inner: &ForestInner, cursor: &DiffCursor) -> Result<AccountLeaf, MptError> {
    let cell = inner.get_shared_node(&cursor.reference)?;
    let node = cell.read();
    match &*node {
        Node::Account(account) => Ok(AccountLeaf {
            address: account.address,
            info: account.info,
            storage: account.storage.clone(),
        }),
        _ => Err(MptError::corrupt("diff walk ended on a non-account node")),
    }
}

fn value_at(inner: &ForestInner, cursor: &DiffCursor) -> Result<(Key, Value), MptError> {
    let cell = inner.get_shared_node(&cursor.reference)?;
    let node = cell.read();
    match &*node {
        Node::Value(value) => Ok((value.key, value.value)),
        _ => Err(MptError::corrupt("diff walk ended on a non-value node")),
    }
}

fn diff_accounts(
    inner: &ForestInner,
    a: Option<DiffCursor>,
    b: Option<DiffCursor>,
    depth: usize,
    full_len: usize,
    out: &mut Diff,
) -> Result<(), MptError> {
    if (a.is_none() && b.is_none()) || cursors_equal(&a, &b) {
        return Ok(());
    }

    if depth == full_len {
        let before = a.map(|cursor| account_at(inner, &cursor)).transpose()?;
        let after = b.map(|cursor| account_at(inner, &cursor)).transpose()?;
        let mut entry = AccountDiff::default();
        let address = match (&before, &after) {
            (Some(leaf), None) => {
                entry.reset = true;
                leaf.address
            }
            (None, Some(leaf)) => {
                if !leaf.info.balance.is_zero() {
                    entry.balance = Some(leaf.info.balance);
                }
                if leaf.info.nonce != 0 {
                    entry.nonce = Some(leaf.info.nonce);
                }
                if !leaf.info.code_hash.is_zero() {
                    entry.code_hash = Some(leaf.info.code_hash);
                }
                diff_slots(
                    inner,
                    None,
                    cursor_for(Some(&leaf.storage)),
                    0,
                    &mut entry,
                )?;
                leaf.address
            }
            (Some(before), Some(after)) => {
                if before.info.balance != after.info.balance {
                    entry.balance = Some(after.info.balance);
                }
                if before.info.nonce != after.info.nonce {
                    entry.nonce = Some(after.info.nonce);
                }
                if before.info.code_hash != after.info.code_hash {
                    entry.code_hash = Some(after.info.code_hash);
                }
                diff_slots(
                    inner,
                    cursor_for(Some(&before.storage)),
                    cursor_for(Some(&after.storage)),
                    0,
                    &mut entry,
                )?;
                after.address
            }
            (None, None) => return Ok(()),
        };
        if !entry.is_empty() {
            out.accounts.insert(address, entry);
        }
        return Ok(());
    }

    for nibble in 0..16u8 {
        let a_next = match &a {
            Some(cursor) => step(inner, cursor, nibble, depth, full_len)?,
            None => None,
        };
        let b_next = match &b {
            Some(cursor) => step(inner, cursor, nibble, depth, full_len)?,
            None => None,
        };
        diff_accounts(inner, a_next, b_next, depth + 1, full_len, out)?;
    }
    Ok(())
}

fn diff_slots(
    inner: &ForestInner,
    a: Option<DiffCursor>,
    b: Option<DiffCursor>,
    depth: usize,
    out: &mut AccountDiff,
) -> Result<(), MptError> {
    if (a.is_none() && b.is_none()) || cursors_equal(&a, &b) {
        return Ok(());
    }

    let full_len = Path::MAX_NIBBLES;
    if depth == full_len {
        let before = a.map(|cursor| value_at(inner, &cursor)).transpose()?;
        let after = b.map(|cursor| value_at(inner, &cursor)).transpose()?;
        match (before, after) {
            (Some((key, _)), None) => {
                out.slots.insert(key, Value::zero());
            }
            (None, Some((key, value))) => {
                out.slots.insert(key, value);
            }
            (Some((key, old)), Some((_, new))) => {
                if old != new {
                    out.slots.insert(key, new);
                }
            }
            (None, None) => {}
        }
        return Ok(());
    }

    for nibble in 0..16u8 {
        let a_next = match &a {
            Some(cursor) => step(inner, cursor, nibble, depth, full_len)?,
            None => None,
        };
        let b_next = match &b {
            Some(cursor) => step(inner, cursor, nibble, depth, full_len)?,
            None => None,
        };
        diff_slots(inner, a_next, b_next, depth + 1, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn cache_config() -> NodeCacheConfig {
        NodeCacheConfig {
            background_flush_period: None,
            ..Default::default()
        }
    }

    fn archive_config() -> ArchiveConfig {
        // generous limits keep the scheduler quiet during tests
        ArchiveConfig {
            checkpoint_interval: 1_000_000,
            checkpoint_period: Duration::from_secs(3600),
        }
    }

    fn open_archive(dir: &FsPath) -> ArchiveTrie {
        ArchiveTrie::open(
            dir,
            MptConfig::S5_ARCHIVE,
            &cache_config(),
            archive_config(),
        )
        .unwrap()
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

    fn balance_update(byte: u8, balance: u64) -> Update {
        let mut update = Update::default();
        update.set_balance(addr(byte), U256::from(balance));
        update
    }

    #[test]
    fn blocks_are_readable_at_their_height() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());

        let mut u0 = Update::default();
        u0.set_balance(addr(1), U256::from(100)).set_nonce(addr(1), 1);
        archive.add(0, &u0, None).unwrap();

        let mut u1 = Update::default();
        u1.set_balance(addr(1), U256::from(200))
            .set_storage(addr(1), key(1), Value::repeat_byte(7));
        archive.add(1, &u1, None).unwrap();

        assert_eq!(archive.block_height().unwrap(), Some(1));
        assert_eq!(archive.get_balance(0, &addr(1)).unwrap(), U256::from(100));
        assert_eq!(archive.get_balance(1, &addr(1)).unwrap(), U256::from(200));
        assert_eq!(archive.get_nonce(1, &addr(1)).unwrap(), 1);
        assert_eq!(
            archive.get_storage(0, &addr(1), &key(1)).unwrap(),
            Value::zero()
        );
        assert_eq!(
            archive.get_storage(1, &addr(1), &key(1)).unwrap(),
            Value::repeat_byte(7)
        );
        assert!(!archive.exists(0, &addr(2)).unwrap());
        assert!(archive.get_balance(2, &addr(1)).is_err());
        archive.close().unwrap();
    }

    #[test]
    fn adding_a_past_block_fails_without_poisoning() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());
        archive.add(0, &balance_update(1, 10), None).unwrap();
        assert!(matches!(
            archive.add(0, &balance_update(1, 20), None),
            Err(MptError::InvalidBlock { .. })
        ));
        archive.add(1, &balance_update(1, 20), None).unwrap();
        archive.close().unwrap();
    }

    #[test]
    fn skipped_blocks_share_the_previous_head() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());
        archive.add(0, &balance_update(1, 10), None).unwrap();
        archive.add(5, &balance_update(1, 20), None).unwrap();

        assert_eq!(archive.block_height().unwrap(), Some(5));
        let h0 = archive.get_hash(0).unwrap();
        for block in 1..5 {
            assert_eq!(archive.get_hash(block).unwrap(), h0);
            assert_eq!(
                archive.get_balance(block, &addr(1)).unwrap(),
                U256::from(10)
            );
        }
        assert_ne!(archive.get_hash(5).unwrap(), h0);
        archive.close().unwrap();
    }

    #[test]
    fn archived_roots_are_frozen_against_later_updates() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());

        let mut u0 = Update::default();
        u0.set_balance(addr(1), U256::from(100))
            .set_storage(addr(1), key(1), Value::repeat_byte(1));
        archive.add(0, &u0, None).unwrap();
        let h0 = archive.get_hash(0).unwrap();

        for block in 1..8u64 {
            let mut update = balance_update(1, 100 + block);
            update.set_storage(addr(1), key(1), Value::repeat_byte(block as u8));
            update.set_balance(addr(block as u8 + 1), U256::from(block));
            archive.add(block, &update, None).unwrap();
        }

        assert_eq!(archive.get_hash(0).unwrap(), h0);
        assert_eq!(archive.get_balance(0, &addr(1)).unwrap(), U256::from(100));
        assert_eq!(
            archive.get_storage(0, &addr(1), &key(1)).unwrap(),
            Value::repeat_byte(1)
        );
        assert!(!archive.exists(0, &addr(2)).unwrap());
        archive.close().unwrap();
    }

    #[test]
    fn diff_of_the_first_block_lists_its_update() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());

        let mut update = Update::default();
        update
            .set_balance(addr(1), U256::from(12))
            .set_nonce(addr(1), 10)
            .set_storage(addr(1), key(1), Value::repeat_byte(5))
            .set_balance(addr(2), U256::from(7));
        archive.add(0, &update, None).unwrap();

        let diff = archive.get_diff_for_block(0).unwrap();
        assert_eq!(diff.accounts.len(), 2);

        let one = &diff.accounts[&addr(1)];
        assert_eq!(one.balance, Some(U256::from(12)));
        assert_eq!(one.nonce, Some(10));
        assert_eq!(one.slots[&key(1)], Value::repeat_byte(5));
        assert!(!one.reset);

        let two = &diff.accounts[&addr(2)];
        assert_eq!(two.balance, Some(U256::from(7)));
        assert!(two.nonce.is_none());
        archive.close().unwrap();
    }

    #[test]
    fn diff_tracks_deletions_and_slot_clears() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());

        let mut u0 = Update::default();
        u0.set_balance(addr(1), U256::from(10))
            .set_balance(addr(2), U256::from(20))
            .set_storage(addr(1), key(1), Value::repeat_byte(1))
            .set_storage(addr(1), key(2), Value::repeat_byte(2));
        archive.add(0, &u0, None).unwrap();

        let mut u1 = Update::default();
        u1.delete_account(addr(2))
            .set_storage(addr(1), key(2), Value::zero());
        archive.add(1, &u1, None).unwrap();

        let diff = archive.get_diff(0, 1).unwrap();
        assert!(diff.accounts[&addr(2)].reset);
        assert_eq!(diff.accounts[&addr(1)].slots[&key(2)], Value::zero());
        assert!(!diff.accounts[&addr(1)].slots.contains_key(&key(1)));
        archive.close().unwrap();
    }

    #[test]
    fn empty_blocks_diff_to_nothing() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());
        archive.add(0, &balance_update(1, 10), None).unwrap();
        archive.add(1, &Update::default(), None).unwrap();
        assert!(archive.get_diff_for_block(1).unwrap().is_empty());
        assert!(archive.get_diff(1, 1).unwrap().is_empty());
        archive.close().unwrap();
    }

    #[test]
    fn account_hash_is_not_supported() {
        let dir = TempDir::new().unwrap();
        let archive = open_archive(dir.path());
        archive.add(0, &balance_update(1, 10), None).unwrap();
        assert!(matches!(
            archive.get_account_hash(0, &addr(1)),
            Err(MptError::NotImplemented(_))
        ));
        archive.close().unwrap();
    }

    #[test]
    fn archive_state_survives_clean_reopen() {
        let dir = TempDir::new().unwrap();
        let hashes: Vec<H256> = {
            let archive = open_archive(dir.path());
            for block in 0..4u64 {
                archive
                    .add(block, &balance_update(1, block + 1), None)
                    .unwrap();
            }
            let hashes = (0..4).map(|b| archive.get_hash(b).unwrap()).collect();
            archive.close().unwrap();
            hashes
        };

        let archive = open_archive(dir.path());
        assert_eq!(archive.block_height().unwrap(), Some(3));
        for (block, expected) in hashes.iter().enumerate() {
            assert_eq!(&archive.get_hash(block as u64).unwrap(), expected);
        }
        assert_eq!(archive.get_balance(3, &addr(1)).unwrap(), U256::from(4));
        archive.close().unwrap();
    }

    #[test]
    fn crash_recovery_restores_the_checkpointed_height() {
        let dir = TempDir::new().unwrap();

        let checkpoint_hashes: Vec<H256> = {
            let archive = open_archive(dir.path());
            for block in 0..3u64 {
                let mut update = balance_update(1, block + 1);
                update.set_storage(addr(1), key(1), Value::repeat_byte(block as u8 + 1));
                archive.add(block, &update, None).unwrap();
            }
            archive.create_checkpoint().unwrap();
            let hashes = (0..3).map(|b| archive.get_hash(b).unwrap()).collect();

            // more blocks after the checkpoint, then a simulated crash:
            // flushed to disk but never cleanly closed
            archive.add(3, &balance_update(1, 40), None).unwrap();
            archive.add(4, &balance_update(1, 50), None).unwrap();
            archive.flush().unwrap();
            drop(archive);
            hashes
        };

        assert!(matches!(
            ArchiveTrie::open(
                dir.path(),
                MptConfig::S5_ARCHIVE,
                &cache_config(),
                archive_config(),
            ),
            Err(MptError::DirtyDirectory(_))
        ));

        // the checkpoint covers 3 blocks, restoring beyond it must fail
        assert!(
            ArchiveTrie::restore_block_height(dir.path(), MptConfig::S5_ARCHIVE, 10).is_err()
        );
        ArchiveTrie::restore_block_height(dir.path(), MptConfig::S5_ARCHIVE, 2).unwrap();

        let archive = open_archive(dir.path());
        assert_eq!(archive.block_height().unwrap(), Some(2));
        for (block, expected) in checkpoint_hashes.iter().enumerate() {
            assert_eq!(&archive.get_hash(block as u64).unwrap(), expected);
        }
        assert_eq!(archive.get_balance(2, &addr(1)).unwrap(), U256::from(3));
        assert_eq!(
            archive.get_storage(2, &addr(1), &key(1)).unwrap(),
            Value::repeat_byte(3)
        );

        // the archive keeps growing after recovery
        archive.add(3, &balance_update(1, 99), None).unwrap();
        assert_eq!(archive.get_balance(3, &addr(1)).unwrap(), U256::from(99));
        archive.close().unwrap();
    }

    #[test]
    fn restore_to_an_earlier_block_drops_later_roots() {
        let dir = TempDir::new().unwrap();
        {
            let archive = open_archive(dir.path());
            for block in 0..5u64 {
                archive
                    .add(block, &balance_update(1, block + 1), None)
                    .unwrap();
            }
            archive.create_checkpoint().unwrap();
            drop(archive);
        }

        ArchiveTrie::restore_block_height(dir.path(), MptConfig::S5_ARCHIVE, 1).unwrap();
        let archive = open_archive(dir.path());
        assert_eq!(archive.block_height().unwrap(), Some(1));
        assert_eq!(archive.get_balance(1, &addr(1)).unwrap(), U256::from(2));
        archive.close().unwrap();
    }

    #[test]
    fn checkpoints_trigger_on_the_block_interval() {
        let dir = TempDir::new().unwrap();
        let archive = ArchiveTrie::open(
            dir.path(),
            MptConfig::S5_ARCHIVE,
            &cache_config(),
            ArchiveConfig {
                checkpoint_interval: 2,
                checkpoint_period: Duration::from_secs(3600),
            },
        )
        .unwrap();

        let before = archive.coordinator.committed();
        archive.add(0, &balance_update(1, 1), None).unwrap();
        archive.add(1, &balance_update(1, 2), None).unwrap();
        assert!(archive.coordinator.committed() > before);
        archive.close().unwrap();
    }
}
