pub mod encoding;

use std::fmt;
use std::sync::{Arc, Weak};

use ethereum_types::H256;
use parking_lot::Mutex;

use crate::cell::NodeCell;
use crate::path::Path;
use crate::types::{Address, AccountInfo, Key, Value};

/// The four materialized node kinds; `Empty` has no stock of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Branch,
    Extension,
    Account,
    Value,
}

impl NodeKind {
    fn tag(self) -> u64 {
        match self {
            NodeKind::Branch => 0,
            NodeKind::Extension => 1,
            NodeKind::Account => 2,
            NodeKind::Value => 3,
        }
    }

    fn from_tag(tag: u64) -> NodeKind {
        match tag {
            0 => NodeKind::Branch,
            1 => NodeKind::Extension,
            2 => NodeKind::Account,
            _ => NodeKind::Value,
        }
    }
}

/// A 64-bit node identifier: 2 kind bits and a 62-bit stock index.
///
/// The all-ones value is reserved for the empty node; it never addresses a
/// stock slot and doubles as the release worker's barrier token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const EMPTY: NodeId = NodeId(u64::MAX);

    const INDEX_BITS: u32 = 62;
    const INDEX_MASK: u64 = (1 << Self::INDEX_BITS) - 1;

    pub fn new(kind: NodeKind, index: u64) -> NodeId {
        debug_assert!(index < Self::INDEX_MASK);
        NodeId((kind.tag() << Self::INDEX_BITS) | index)
    }

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    pub fn kind(self) -> Option<NodeKind> {
        if self.is_empty() {
            None
        } else {
            Some(NodeKind::from_tag(self.0 >> Self::INDEX_BITS))
        }
    }

    pub fn index(self) -> u64 {
        self.0 & Self::INDEX_MASK
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> NodeId {
        NodeId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            None => write!(f, "E"),
            Some(NodeKind::Branch) => write!(f, "B{}", self.index()),
            Some(NodeKind::Extension) => write!(f, "X{}", self.index()),
            Some(NodeKind::Account) => write!(f, "A{}", self.index()),
            Some(NodeKind::Value) => write!(f, "V{}", self.index()),
        }
    }
}

/// A node id plus a cached pointer to its in-memory cell.
///
/// The pointer is a resolution hint only: it may be dead or stale after an
/// eviction, in which case resolution falls back to the cache index.
/// Equality and hashing are over the id alone.
pub struct NodeReference {
    id: NodeId,
    hint: Mutex<Weak<NodeCell>>,
}

impl NodeReference {
    pub fn new(id: NodeId) -> Self {
        NodeReference {
            id,
            hint: Mutex::new(Weak::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(NodeId::EMPTY)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    pub(crate) fn cached(&self) -> Option<Arc<NodeCell>> {
        self.hint.lock().upgrade()
    }

    pub(crate) fn set_cached(&self, cell: &Arc<NodeCell>) {
        *self.hint.lock() = Arc::downgrade(cell);
    }
}

impl Clone for NodeReference {
    fn clone(&self) -> Self {
        NodeReference {
            id: self.id,
            hint: Mutex::new(self.hint.lock().clone()),
        }
    }
}

impl PartialEq for NodeReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeReference {}

impl fmt::Debug for NodeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.id)
    }
}

impl From<NodeId> for NodeReference {
    fn from(id: NodeId) -> Self {
        NodeReference::new(id)
    }
}

/// An inner node with 16 children selected by the next path nibble.
#[derive(Debug, Clone)]
pub struct BranchNode {
    pub children: [NodeReference; 16],
    /// Last known hash per child; only meaningful where the corresponding
    /// dirty bit is clear.
    pub child_hashes: [H256; 16],
    /// Children whose canonical encoding is stored inline by the parent.
    pub embedded_children: u16,
    pub dirty_child_hashes: u16,
    pub hash: H256,
    pub hash_dirty: bool,
    pub dirty: bool,
    pub frozen: bool,
}

impl BranchNode {
    pub fn empty() -> Self {
        BranchNode {
            children: std::array::from_fn(|_| NodeReference::empty()),
            child_hashes: [H256::zero(); 16],
            embedded_children: 0,
            dirty_child_hashes: 0,
            hash: H256::zero(),
            hash_dirty: true,
            dirty: true,
            frozen: false,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    /// Nibble of the single non-empty child, if there is exactly one.
    pub fn single_child_nibble(&self) -> Option<u8> {
        let mut found = None;
        for (nibble, child) in self.children.iter().enumerate() {
            if !child.is_empty() {
                if found.is_some() {
                    return None;
                }
                found = Some(nibble as u8);
            }
        }
        found
    }

    pub fn mark_child_dirty(&mut self, nibble: u8) {
        self.dirty_child_hashes |= 1 << nibble;
        self.hash_dirty = true;
        self.dirty = true;
    }

    pub fn is_embedded(&self, nibble: u8) -> bool {
        self.embedded_children & (1 << nibble) != 0
    }

    pub fn set_embedded(&mut self, nibble: u8, embedded: bool) {
        if embedded {
            self.embedded_children |= 1 << nibble;
        } else {
            self.embedded_children &= !(1 << nibble);
        }
    }
}

/// A compressed run of nibbles leading to a branch.
#[derive(Debug, Clone)]
pub struct ExtensionNode {
    pub path: Path,
    pub next: NodeReference,
    pub next_hash: H256,
    pub next_hash_dirty: bool,
    pub next_embedded: bool,
    pub hash: H256,
    pub hash_dirty: bool,
    pub dirty: bool,
    pub frozen: bool,
}

impl ExtensionNode {
    pub fn new(path: Path, next: NodeReference) -> Self {
        ExtensionNode {
            path,
            next,
            next_hash: H256::zero(),
            next_hash_dirty: true,
            next_embedded: false,
            hash: H256::zero(),
            hash_dirty: true,
            dirty: true,
            frozen: false,
        }
    }
}

/// The leaf of the account trie: full address, account payload and a
/// reference to the account's storage trie.
#[derive(Debug, Clone)]
pub struct AccountNode {
    pub address: Address,
    pub info: AccountInfo,
    pub storage: NodeReference,
    pub storage_hash: H256,
    pub storage_hash_dirty: bool,
    /// Residual nibbles below the parent; persisted only when the
    /// configuration tracks suffix lengths.
    pub path_length: u8,
    pub hash: H256,
    pub hash_dirty: bool,
    pub dirty: bool,
    pub frozen: bool,
}

impl AccountNode {
    pub fn new(address: Address, info: AccountInfo, path_length: u8) -> Self {
        AccountNode {
            address,
            info,
            storage: NodeReference::empty(),
            storage_hash: H256::zero(),
            storage_hash_dirty: true,
            path_length,
            hash: H256::zero(),
            hash_dirty: true,
            dirty: true,
            frozen: false,
        }
    }
}

/// The leaf of a storage trie: full key and 32-byte value.
#[derive(Debug, Clone)]
pub struct ValueNode {
    pub key: Key,
    pub value: Value,
    pub path_length: u8,
    pub hash: H256,
    pub hash_dirty: bool,
    pub dirty: bool,
    pub frozen: bool,
}

impl ValueNode {
    pub fn new(key: Key, value: Value, path_length: u8) -> Self {
        ValueNode {
            key,
            value,
            path_length,
            hash: H256::zero(),
            hash_dirty: true,
            dirty: true,
            frozen: false,
        }
    }
}

/// A node of the forest. `Empty` is the sentinel for absent subtrees and is
/// never allocated in a stock.
#[derive(Debug, Clone)]
pub enum Node {
    Empty,
    Branch(Box<BranchNode>),
    Extension(ExtensionNode),
    Account(AccountNode),
    Value(ValueNode),
}

impl Node {
    pub fn kind(&self) -> Option<NodeKind> {
        match self {
            Node::Empty => None,
            Node::Branch(_) => Some(NodeKind::Branch),
            Node::Extension(_) => Some(NodeKind::Extension),
            Node::Account(_) => Some(NodeKind::Account),
            Node::Value(_) => Some(NodeKind::Value),
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Node::Empty => false,
            Node::Branch(n) => n.dirty,
            Node::Extension(n) => n.dirty,
            Node::Account(n) => n.dirty,
            Node::Value(n) => n.dirty,
        }
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        match self {
            Node::Empty => {}
            Node::Branch(n) => n.dirty = dirty,
            Node::Extension(n) => n.dirty = dirty,
            Node::Account(n) => n.dirty = dirty,
            Node::Value(n) => n.dirty = dirty,
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            Node::Empty => true,
            Node::Branch(n) => n.frozen,
            Node::Extension(n) => n.frozen,
            Node::Account(n) => n.frozen,
            Node::Value(n) => n.frozen,
        }
    }

    pub fn set_frozen(&mut self) {
        match self {
            Node::Empty => {}
            Node::Branch(n) => n.frozen = true,
            Node::Extension(n) => n.frozen = true,
            Node::Account(n) => n.frozen = true,
            Node::Value(n) => n.frozen = true,
        }
    }

    pub fn is_hash_dirty(&self) -> bool {
        match self {
            Node::Empty => false,
            Node::Branch(n) => n.hash_dirty,
            Node::Extension(n) => n.hash_dirty,
            Node::Account(n) => n.hash_dirty,
            Node::Value(n) => n.hash_dirty,
        }
    }

    pub fn hash(&self) -> H256 {
        match self {
            Node::Empty => H256::zero(),
            Node::Branch(n) => n.hash,
            Node::Extension(n) => n.hash,
            Node::Account(n) => n.hash,
            Node::Value(n) => n.hash,
        }
    }

    pub fn set_hash(&mut self, hash: H256) {
        match self {
            Node::Empty => {}
            Node::Branch(n) => {
                n.hash = hash;
                n.hash_dirty = false;
            }
            Node::Extension(n) => {
                n.hash = hash;
                n.hash_dirty = false;
            }
            Node::Account(n) => {
                n.hash = hash;
                n.hash_dirty = false;
            }
            Node::Value(n) => {
                n.hash = hash;
                n.hash_dirty = false;
            }
        }
    }

    pub fn mark_hash_dirty(&mut self) {
        match self {
            Node::Empty => {}
            Node::Branch(n) => n.hash_dirty = true,
            Node::Extension(n) => n.hash_dirty = true,
            Node::Account(n) => n.hash_dirty = true,
            Node::Value(n) => n.hash_dirty = true,
        }
    }

    /// An unfrozen, dirty copy of this node for copy-on-write updates.
    /// The hash state is carried over; identical content keeps its hash.
    pub fn thawed_copy(&self) -> Node {
        let mut copy = self.clone();
        match &mut copy {
            Node::Empty => {}
            Node::Branch(n) => n.frozen = false,
            Node::Extension(n) => n.frozen = false,
            Node::Account(n) => n.frozen = false,
            Node::Value(n) => n.frozen = false,
        }
        copy.set_dirty(true);
        copy
    }

    /// References of all direct children, for traversal and release.
    pub fn child_refs(&self) -> Vec<NodeReference> {
        match self {
            Node::Empty | Node::Value(_) => Vec::new(),
            Node::Branch(n) => n
                .children
                .iter()
                .filter(|c| !c.is_empty())
                .cloned()
                .collect(),
            Node::Extension(n) => vec![n.next.clone()],
            Node::Account(n) => {
                if n.storage.is_empty() {
                    Vec::new()
                } else {
                    vec![n.storage.clone()]
                }
            }
        }
    }
}

impl From<BranchNode> for Node {
    fn from(node: BranchNode) -> Self {
        Node::Branch(Box::new(node))
    }
}

impl From<ExtensionNode> for Node {
    fn from(node: ExtensionNode) -> Self {
        Node::Extension(node)
    }
}

impl From<AccountNode> for Node {
    fn from(node: AccountNode) -> Self {
        Node::Account(node)
    }
}

impl From<ValueNode> for Node {
    fn from(node: ValueNode) -> Self {
        Node::Value(node)
    }
}
