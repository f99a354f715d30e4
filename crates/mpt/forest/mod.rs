mod ops;

use std::fs;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, bounded, select, tick, unbounded};
use ethereum_types::H256;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cache::NodeCache;
use crate::cell::NodeCell;
use crate::checkpoint::CheckpointParticipant;
use crate::config::{MptConfig, NodeCacheConfig, StorageMode};
use crate::error::MptError;
use crate::hasher;
use crate::node::encoding::{AccountCodec, BranchCodec, ExtensionCodec, ValueCodec};
use crate::node::{Node, NodeId, NodeKind, NodeReference};
use crate::path::Path;
use crate::stock::Stock;
use crate::types::{Address, Key, keccak256};
use crate::write_buffer::{WriteBuffer, WriteSink};

pub use crate::hasher::{NodeHashes, NodePath};

const FOREST_META_FILE: &str = "forest.json";

#[derive(Debug, Serialize, Deserialize)]
struct ForestMeta {
    #[serde(rename = "Configuration")]
    configuration: String,
    #[serde(rename = "Mutable")]
    mutable: bool,
}

/// Reaction of a [`NodeVisitor`] to a visited node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisitResponse {
    Continue,
    /// Skip the subtree below this node.
    Prune,
    Abort,
}

/// Depth-first observer over the nodes of a trie, storage subtries included.
pub trait NodeVisitor {
    fn visit(&mut self, node: &Node, id: NodeId, depth: u32) -> VisitResponse;
}

/// The four node stocks of a forest directory.
pub(crate) struct Stocks {
    pub branches: Stock<BranchCodec>,
    pub extensions: Stock<ExtensionCodec>,
    pub accounts: Stock<AccountCodec>,
    pub values: Stock<ValueCodec>,
}

impl Stocks {
    pub fn open(dir: &FsPath, config: &MptConfig) -> Result<Self, MptError> {
        Ok(Stocks {
            branches: Stock::open(dir.join("branches"), BranchCodec::new(config))?,
            extensions: Stock::open(dir.join("extensions"), ExtensionCodec::new(config))?,
            accounts: Stock::open(dir.join("accounts"), AccountCodec::new(config))?,
            values: Stock::open(dir.join("values"), ValueCodec::new(config))?,
        })
    }

    pub fn load_node(&self, id: NodeId) -> Result<Node, MptError> {
        match id.kind() {
            None => Ok(Node::Empty),
            Some(NodeKind::Branch) => Ok(Node::Branch(Box::new(self.branches.get(id.index())?))),
            Some(NodeKind::Extension) => Ok(Node::Extension(self.extensions.get(id.index())?)),
            Some(NodeKind::Account) => Ok(Node::Account(self.accounts.get(id.index())?)),
            Some(NodeKind::Value) => Ok(Node::Value(self.values.get(id.index())?)),
        }
    }

    pub fn write_node(&self, id: NodeId, node: &Node) -> Result<(), MptError> {
        match (id.kind(), node) {
            (Some(NodeKind::Branch), Node::Branch(n)) => self.branches.set(id.index(), n),
            (Some(NodeKind::Extension), Node::Extension(n)) => self.extensions.set(id.index(), n),
            (Some(NodeKind::Account), Node::Account(n)) => self.accounts.set(id.index(), n),
            (Some(NodeKind::Value), Node::Value(n)) => self.values.set(id.index(), n),
            _ => Err(MptError::corrupt(format!(
                "node kind does not match id {id:?}"
            ))),
        }
    }

    pub fn delete_node(&self, id: NodeId) -> Result<(), MptError> {
        match id.kind() {
            None => Ok(()),
            Some(NodeKind::Branch) => self.branches.delete(id.index()),
            Some(NodeKind::Extension) => self.extensions.delete(id.index()),
            Some(NodeKind::Account) => self.accounts.delete(id.index()),
            Some(NodeKind::Value) => self.values.delete(id.index()),
        }
    }

    pub fn reserve(&self, kind: NodeKind) -> Result<u64, MptError> {
        match kind {
            NodeKind::Branch => self.branches.reserve(),
            NodeKind::Extension => self.extensions.reserve(),
            NodeKind::Account => self.accounts.reserve(),
            NodeKind::Value => self.values.reserve(),
        }
    }

    pub fn flush(&self) -> Result<(), MptError> {
        self.branches.flush()?;
        self.extensions.flush()?;
        self.accounts.flush()?;
        self.values.flush()?;
        Ok(())
    }

    pub fn participants(&self) -> [&dyn CheckpointParticipant; 4] {
        [
            &self.accounts,
            &self.branches,
            &self.extensions,
            &self.values,
        ]
    }
}

impl WriteSink for Stocks {
    fn write(&self, id: NodeId, node: &Node) -> Result<(), MptError> {
        self.write_node(id, node)
    }
}

enum ReleaseCommand {
    Release(NodeReference),
    Barrier(Sender<()>),
}

pub(crate) struct ForestInner {
    pub config: MptConfig,
    pub mode: StorageMode,
    pub stocks: Arc<Stocks>,
    pub cache: NodeCache,
    pub buffer: WriteBuffer,
    /// Serializes the movement of a cell between cache, write buffer and
    /// stock so a concurrent miss can never materialize two cells for one
    /// id.
    transfer: Mutex<()>,
    errors: Mutex<Vec<MptError>>,
    empty_cell: Arc<NodeCell>,
    release_tx: Mutex<Option<Sender<ReleaseCommand>>>,
    address_paths: Mutex<FxHashMap<Address, Path>>,
    key_paths: Mutex<FxHashMap<Key, Path>>,
}

/// The forest multiplexes every trie version of a directory over the four
/// node stocks, one shared node cache and one write buffer.
pub struct Forest {
    pub(crate) inner: Arc<ForestInner>,
    release_worker: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl Forest {
    pub fn open(
        dir: &FsPath,
        config: MptConfig,
        cache_config: &NodeCacheConfig,
    ) -> Result<Self, MptError> {
        fs::create_dir_all(dir)?;
        check_forest_meta(dir, &config)?;

        let stocks = Arc::new(Stocks::open(dir, &config)?);
        let buffer = WriteBuffer::new(
            Arc::clone(&stocks) as Arc<dyn WriteSink>,
            cache_config.write_buffer_capacity,
        );

        let (release_tx, release_rx) = unbounded();
        let inner = Arc::new(ForestInner {
            mode: config.mode,
            config,
            stocks,
            cache: NodeCache::new(cache_config.capacity),
            buffer,
            transfer: Mutex::new(()),
            errors: Mutex::new(Vec::new()),
            empty_cell: Arc::new(NodeCell::new(Node::Empty)),
            release_tx: Mutex::new(Some(release_tx)),
            address_paths: Mutex::new(FxHashMap::default()),
            key_paths: Mutex::new(FxHashMap::default()),
        });

        let worker_inner = Arc::clone(&inner);
        let release_worker = std::thread::Builder::new()
            .name("mpt-release".into())
            .spawn(move || release_worker_loop(worker_inner, release_rx))
            .expect("failed to spawn release worker");

        let flusher = cache_config.background_flush_period.map(|period| {
            let (stop_tx, stop_rx) = bounded::<()>(0);
            let flusher_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("mpt-flusher".into())
                .spawn(move || {
                    let ticker = tick(period);
                    loop {
                        select! {
                            recv(ticker) -> _ => flusher_inner.buffer.request_drain(),
                            recv(stop_rx) -> _ => return,
                        }
                    }
                })
                .expect("failed to spawn background flusher");
            (stop_tx, handle)
        });

        debug!(dir = %dir.display(), config = inner.config.name, "forest opened");
        Ok(Forest {
            inner,
            release_worker: Mutex::new(Some(release_worker)),
            flusher: Mutex::new(flusher),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MptConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> StorageMode {
        self.inner.mode
    }

    /// Errors accumulated by background workers and poisoning failures.
    /// A forest with errors must be closed and discarded.
    pub fn check_errors(&self) -> Vec<MptError> {
        let mut errors = self.inner.errors.lock().clone();
        errors.extend(self.inner.buffer.take_errors());
        errors
    }

    /// Marks the whole subtree under `root` immutable.
    pub fn freeze(&self, root: &NodeReference) -> Result<(), MptError> {
        if !self.inner.mode.is_immutable() {
            return Err(MptError::NotImplemented(
                "freezing is limited to immutable forests",
            ));
        }
        self.inner.freeze(root)
    }

    pub fn visit_trie(
        &self,
        root: &NodeReference,
        visitor: &mut dyn NodeVisitor,
    ) -> Result<(), MptError> {
        self.inner.visit(root, visitor, 0)?;
        Ok(())
    }

    /// Schedules the subtree under `root` for background release.
    pub fn release_trie(&self, root: NodeReference) {
        if root.is_empty() {
            return;
        }
        if let Some(tx) = self.inner.release_tx.lock().as_ref() {
            let _ = tx.send(ReleaseCommand::Release(root));
        }
    }

    /// Blocks until previously scheduled releases are done.
    pub fn flush_releases(&self) {
        let Some(tx) = self.inner.release_tx.lock().as_ref().cloned() else {
            return;
        };
        let (ack_tx, ack_rx) = bounded(0);
        if tx.send(ReleaseCommand::Barrier(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub fn update_hashes_for(&self, root: &NodeReference) -> Result<(H256, NodeHashes), MptError> {
        hasher::update_hashes(&self.inner, root)
    }

    pub fn get_hash_for(&self, root: &NodeReference) -> Result<H256, MptError> {
        hasher::get_hash(&self.inner, root)
    }

    pub fn set_hashes_for(
        &self,
        root: &NodeReference,
        hashes: &NodeHashes,
    ) -> Result<(), MptError> {
        hasher::set_hashes(&self.inner, root, hashes)
    }

    /// Writes every dirty node through to the stocks.
    pub fn flush(&self) -> Result<(), MptError> {
        self.flush_releases();

        let mut dirty: Vec<(NodeId, Arc<NodeCell>)> = Vec::new();
        self.inner.cache.for_each(|id, cell| {
            dirty.push((id, Arc::clone(cell)));
        });
        dirty.sort_by_key(|(id, _)| *id);
        for (id, cell) in dirty {
            let mut node = cell.write();
            if node.is_dirty() {
                self.inner.stocks.write_node(id, &node)?;
                node.set_dirty(false);
            }
        }

        self.inner.buffer.flush()?;
        self.inner.stocks.flush()?;
        match self.check_errors().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn close(&self) -> Result<(), MptError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some((stop, handle)) = self.flusher.lock().take() {
            drop(stop);
            let _ = handle.join();
        }

        let flush_result = self.flush();

        *self.inner.release_tx.lock() = None;
        if let Some(handle) = self.release_worker.lock().take() {
            let _ = handle.join();
        }

        self.inner.buffer.close()?;
        self.inner.stocks.flush()?;
        debug!("forest closed");
        flush_result
    }
}

impl Drop for Forest {
    fn drop(&mut self) {
        // stop the workers; an explicit close() has already taken them
        if let Some((stop, handle)) = self.flusher.lock().take() {
            drop(stop);
            let _ = handle.join();
        }
        *self.inner.release_tx.lock() = None;
        if let Some(handle) = self.release_worker.lock().take() {
            let _ = handle.join();
        }
        let _ = self.inner.buffer.close();
    }
}

impl ForestInner {
    /// Resolves a reference to its shared cell: cache, then write buffer,
    /// then the stock. The transfer mutex makes the move between those
    /// places atomic with respect to concurrent misses.
    pub fn get_shared_node(&self, reference: &NodeReference) -> Result<Arc<NodeCell>, MptError> {
        let id = reference.id();
        if id.is_empty() {
            return Ok(Arc::clone(&self.empty_cell));
        }

        if let Some(cell) = reference.cached() {
            if cell.is_current() {
                self.cache.touch(id);
                return Ok(cell);
            }
        }
        if let Some(cell) = self.cache.get(id) {
            reference.set_cached(&cell);
            return Ok(cell);
        }

        let _transfer = self.transfer.lock();
        if let Some(cell) = self.cache.get(id) {
            reference.set_cached(&cell);
            return Ok(cell);
        }
        let cell = match self.buffer.cancel(id) {
            Some(cell) => cell,
            None => {
                let mut node = self.stocks.load_node(id)?;
                if self.mode.is_immutable() {
                    node.set_frozen();
                }
                Arc::new(NodeCell::new(node))
            }
        };
        let (current, _existed, evicted) = self.cache.get_or_set(id, cell);
        if let Some(evicted) = evicted {
            self.handle_eviction(evicted.id, evicted.cell);
        }
        reference.set_cached(&current);
        Ok(current)
    }

    /// Allocates a stock slot for the node and installs its cell.
    pub fn create_node(&self, node: Node) -> Result<(NodeReference, Arc<NodeCell>), MptError> {
        let kind = node
            .kind()
            .ok_or_else(|| MptError::corrupt("the empty node cannot be allocated"))?;
        let index = self.stocks.reserve(kind)?;
        let id = NodeId::new(kind, index);
        let cell = Arc::new(NodeCell::new(node));

        let _transfer = self.transfer.lock();
        let (current, existed, evicted) = self.cache.get_or_set(id, cell);
        if existed {
            return Err(MptError::corrupt(format!(
                "freshly reserved node id {id:?} already cached"
            )));
        }
        if let Some(evicted) = evicted {
            self.handle_eviction(evicted.id, evicted.cell);
        }
        let reference = NodeReference::new(id);
        reference.set_cached(&current);
        Ok((reference, current))
    }

    fn handle_eviction(&self, id: NodeId, cell: Arc<NodeCell>) {
        // a held write handle means the node may be mid-mutation, treat it
        // as dirty and let the drainer sort it out
        let dirty = match cell.try_read() {
            Some(node) => node.is_dirty(),
            None => true,
        };
        if dirty {
            self.buffer.add(id, cell);
        } else {
            cell.set_current(false);
        }
    }

    /// Deletes a single node from its stock, cache and buffer.
    pub fn release_node(&self, id: NodeId) -> Result<(), MptError> {
        if id.is_empty() {
            return Ok(());
        }
        let _transfer = self.transfer.lock();
        if let Some(cell) = self.cache.remove(id) {
            cell.set_current(false);
        }
        if let Some(cell) = self.buffer.cancel(id) {
            cell.set_current(false);
        }
        self.stocks.delete_node(id)
    }

    pub fn record_error(&self, err: MptError) {
        error!(%err, "forest poisoned");
        self.errors.lock().push(err);
    }

    pub fn address_to_path(&self, address: &Address) -> Path {
        if !self.config.use_hashed_paths {
            return Path::from_address(address);
        }
        let mut cache = self.address_paths.lock();
        if let Some(path) = cache.get(address) {
            return *path;
        }
        let path = Path::from_key(&keccak256(address.as_bytes()));
        if cache.len() >= 100_000 {
            cache.clear();
        }
        cache.insert(*address, path);
        path
    }

    pub fn key_to_path(&self, key: &Key) -> Path {
        if !self.config.use_hashed_paths {
            return Path::from_key(key);
        }
        let mut cache = self.key_paths.lock();
        if let Some(path) = cache.get(key) {
            return *path;
        }
        let path = Path::from_key(&keccak256(key.as_bytes()));
        if cache.len() >= 100_000 {
            cache.clear();
        }
        cache.insert(*key, path);
        path
    }

    fn freeze(&self, reference: &NodeReference) -> Result<(), MptError> {
        if reference.is_empty() {
            return Ok(());
        }
        let cell = self.get_shared_node(reference)?;
        if cell.read().is_frozen() {
            return Ok(());
        }
        for child in cell.read().child_refs() {
            self.freeze(&child)?;
        }
        cell.write().set_frozen();
        Ok(())
    }

    fn visit(
        &self,
        reference: &NodeReference,
        visitor: &mut dyn NodeVisitor,
        depth: u32,
    ) -> Result<bool, MptError> {
        if reference.is_empty() {
            return Ok(false);
        }
        let cell = self.get_shared_node(reference)?;
        let handle = cell.view();
        match visitor.visit(&handle, reference.id(), depth) {
            VisitResponse::Abort => return Ok(true),
            VisitResponse::Prune => return Ok(false),
            VisitResponse::Continue => {}
        }
        let children = handle.child_refs();
        drop(handle);
        for child in children {
            if self.visit(&child, visitor, depth + 1)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn check_forest_meta(dir: &FsPath, config: &MptConfig) -> Result<(), MptError> {
    let path = dir.join(FOREST_META_FILE);
    let mutable = !config.mode.is_immutable();
    if path.exists() {
        let meta: ForestMeta = serde_json::from_slice(&fs::read(&path)?)?;
        if meta.configuration != config.name || meta.mutable != mutable {
            return Err(MptError::FormatMismatch(format!(
                "directory holds a {} ({}) forest, requested {} ({})",
                meta.configuration,
                if meta.mutable { "mutable" } else { "immutable" },
                config.name,
                if mutable { "mutable" } else { "immutable" },
            )));
        }
    } else {
        let meta = ForestMeta {
            configuration: config.name.to_string(),
            mutable,
        };
        fs::write(path, serde_json::to_vec_pretty(&meta)?)?;
    }
    Ok(())
}

fn release_worker_loop(inner: Arc<ForestInner>, commands: Receiver<ReleaseCommand>) {
    while let Ok(command) = commands.recv() {
        match command {
            ReleaseCommand::Release(reference) => {
                if let Err(err) = release_subtree(&inner, &reference) {
                    inner.record_error(err);
                }
            }
            ReleaseCommand::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn release_subtree(inner: &ForestInner, reference: &NodeReference) -> Result<(), MptError> {
    if reference.is_empty() {
        return Ok(());
    }
    let cell = inner.get_shared_node(reference)?;
    let children = {
        let node = cell.read();
        if node.is_frozen() {
            return Ok(());
        }
        node.child_refs()
    };
    inner.release_node(reference.id())?;
    for child in children {
        release_subtree(inner, &child)?;
    }
    Ok(())
}


/// Writes an indented rendering of the trie under `root`, for debugging and
/// test output.
pub fn dump_trie(
    forest: &Forest,
    root: &NodeReference,
    out: &mut impl std::fmt::Write,
) -> Result<(), MptError> {
    struct Dumper<'a, W: std::fmt::Write> {
        out: &'a mut W,
    }

    impl<W: std::fmt::Write> NodeVisitor for Dumper<'_, W> {
        fn visit(&mut self, node: &Node, id: NodeId, depth: u32) -> VisitResponse {
            let indent = "  ".repeat(depth as usize);
            let rendered = match node {
                Node::Empty => "empty".to_string(),
                Node::Branch(n) => format!("branch ({} children)", n.child_count()),
                Node::Extension(n) => format!("extension [{}]", n.path),
                Node::Account(n) => format!(
                    "account {:#x} nonce={} balance={}",
                    n.address, n.info.nonce, n.info.balance
                ),
                Node::Value(n) => format!("value {:#x} = {:#x}", n.key, n.value),
            };
            let _ = writeln!(self.out, "{indent}{id:?}: {rendered}");
            VisitResponse::Continue
        }
    }

    forest.visit_trie(root, &mut Dumper { out })
}
