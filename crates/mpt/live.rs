use std::sync::Arc;

use ethereum_types::H256;
use parking_lot::Mutex;

use crate::error::MptError;
use crate::forest::{Forest, NodeHashes};
use crate::node::NodeReference;
use crate::types::{AccountInfo, Address, Key, Value};

/// The currently-writable trie: a forest plus the cached reference to its
/// root. Updates swap the root reference; the root lock makes updates
/// mutually exclusive while readers proceed against the root they observe.
pub struct LiveTrie {
    forest: Arc<Forest>,
    root: Mutex<NodeReference>,
}

impl LiveTrie {
    pub fn new(forest: Arc<Forest>, root: NodeReference) -> Self {
        LiveTrie {
            forest,
            root: Mutex::new(root),
        }
    }

    pub fn forest(&self) -> &Arc<Forest> {
        &self.forest
    }

    pub fn root(&self) -> NodeReference {
        self.root.lock().clone()
    }

    pub(crate) fn set_root(&self, root: NodeReference) {
        *self.root.lock() = root;
    }

    pub fn get_account_info(&self, address: &Address) -> Result<(AccountInfo, bool), MptError> {
        self.forest.get_account_info(&self.root(), address)
    }

    pub fn set_account_info(&self, address: &Address, info: AccountInfo) -> Result<(), MptError> {
        let mut root = self.root.lock();
        let new_root = self.forest.set_account_info(&root, address, info)?;
        *root = new_root;
        Ok(())
    }

    pub fn get_value(&self, address: &Address, key: &Key) -> Result<Value, MptError> {
        self.forest.get_value(&self.root(), address, key)
    }

    pub fn set_value(&self, address: &Address, key: &Key, value: Value) -> Result<(), MptError> {
        let mut root = self.root.lock();
        let new_root = self.forest.set_value(&root, address, key, value)?;
        *root = new_root;
        Ok(())
    }

    pub fn clear_storage(&self, address: &Address) -> Result<(), MptError> {
        let mut root = self.root.lock();
        let new_root = self.forest.clear_storage(&root, address)?;
        *root = new_root;
        Ok(())
    }

    pub fn has_empty_storage(&self, address: &Address) -> Result<bool, MptError> {
        self.forest.has_empty_storage(&self.root(), address)
    }

    /// Refreshes and returns the root hash together with the refreshed
    /// per-node hashes.
    pub fn update_hashes(&self) -> Result<(H256, NodeHashes), MptError> {
        let root = self.root.lock();
        self.forest.update_hashes_for(&root)
    }

    pub fn set_hashes(&self, hashes: &NodeHashes) -> Result<(), MptError> {
        let root = self.root.lock();
        self.forest.set_hashes_for(&root, hashes)
    }

    pub fn get_hash(&self) -> Result<H256, MptError> {
        self.forest.get_hash_for(&self.root())
    }

    pub fn check(&self) -> Result<(), MptError> {
        self.forest.check(&self.root())
    }
}
