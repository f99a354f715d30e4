//! Node-level trie algorithms: lookups, upserts, deletions with branch
//! collapsing, storage clearing and structural invariant checks.
//!
//! Mutations are destructive on nodes owned by the current trie version and
//! copy-on-write on frozen nodes, so archived roots keep observing the
//! state they were frozen with.

use crate::error::MptError;
use crate::forest::{Forest, ForestInner};
use crate::node::{
    AccountNode, BranchNode, ExtensionNode, Node, NodeKind, NodeReference, ValueNode,
};
use crate::path::Path;
use crate::types::{AccountInfo, Address, Key, Value};

enum LeafPayload<'a> {
    Account {
        address: &'a Address,
        info: AccountInfo,
    },
    Slot {
        key: &'a Key,
        value: Value,
    },
}

impl LeafPayload<'_> {
    fn make_node(&self, suffix_len: u8) -> Node {
        match self {
            LeafPayload::Account { address, info } => {
                Node::Account(AccountNode::new(**address, *info, suffix_len))
            }
            LeafPayload::Slot { key, value } => {
                Node::Value(ValueNode::new(**key, *value, suffix_len))
            }
        }
    }
}

enum LeafKey<'a> {
    Account(&'a Address),
    Slot(&'a Key),
}

impl Forest {
    pub fn get_account_info(
        &self,
        root: &NodeReference,
        address: &Address,
    ) -> Result<(AccountInfo, bool), MptError> {
        match self.inner.find_account(root, address)? {
            Some((info, _)) => Ok((info, true)),
            None => Ok((AccountInfo::default(), false)),
        }
    }

    /// Writes the account payload, creating or restructuring leaves as
    /// needed; an empty payload deletes the account and its storage.
    /// Returns the new root of the trie.
    pub fn set_account_info(
        &self,
        root: &NodeReference,
        address: &Address,
        info: AccountInfo,
    ) -> Result<NodeReference, MptError> {
        let result = self.inner.set_account_info_impl(root, address, info);
        self.poison_on_error(result)
    }

    pub fn get_value(
        &self,
        root: &NodeReference,
        address: &Address,
        key: &Key,
    ) -> Result<Value, MptError> {
        match self.inner.find_account(root, address)? {
            Some((_, storage)) => self.inner.find_value(&storage, key),
            None => Ok(Value::zero()),
        }
    }

    /// Writes a storage slot of the given account; a zero value deletes the
    /// slot. Writes to absent accounts are ignored. Returns the new root.
    pub fn set_value(
        &self,
        root: &NodeReference,
        address: &Address,
        key: &Key,
        value: Value,
    ) -> Result<NodeReference, MptError> {
        let result = self.inner.set_value_impl(root, address, key, value);
        self.poison_on_error(result)
    }

    /// Drops the whole storage trie of the account. Returns the new root.
    pub fn clear_storage(
        &self,
        root: &NodeReference,
        address: &Address,
    ) -> Result<NodeReference, MptError> {
        let path = self.inner.address_to_path(address);
        let result = self
            .inner
            .with_account(root, path, address, &mut |inner, account| {
                if account.storage.is_empty() {
                    return Ok(false);
                }
                let detached = std::mem::replace(&mut account.storage, NodeReference::empty());
                account.storage_hash_dirty = true;
                account.hash_dirty = true;
                inner.release_async(detached);
                Ok(true)
            })
            .map(|(reference, _)| reference);
        self.poison_on_error(result)
    }

    pub fn has_empty_storage(
        &self,
        root: &NodeReference,
        address: &Address,
    ) -> Result<bool, MptError> {
        match self.inner.find_account(root, address)? {
            Some((_, storage)) => Ok(storage.is_empty()),
            None => Ok(true),
        }
    }

    /// Checks the structural invariants of every node reachable from `root`.
    pub fn check(&self, root: &NodeReference) -> Result<(), MptError> {
        let full_len = if self.inner.config.use_hashed_paths {
            Path::MAX_NIBBLES
        } else {
            40
        };
        self.inner.check_subtree(root, 0, false, full_len)
    }

    pub fn check_all(&self, roots: &[NodeReference]) -> Result<(), MptError> {
        for root in roots {
            self.check(root)?;
        }
        Ok(())
    }

    fn poison_on_error<T>(&self, result: Result<T, MptError>) -> Result<T, MptError> {
        if let Err(err) = &result {
            self.inner.record_error(err.clone());
        }
        result
    }
}

impl ForestInner {
    // ---------------------------------------------------------------------
    // read paths
    // ---------------------------------------------------------------------

    pub(crate) fn find_account(
        &self,
        root: &NodeReference,
        address: &Address,
    ) -> Result<Option<(AccountInfo, NodeReference)>, MptError> {
        let mut remaining = self.address_to_path(address);
        let mut current = root.clone();
        loop {
            if current.is_empty() {
                return Ok(None);
            }
            let cell = self.get_shared_node(&current)?;
            let node = cell.read();
            let next = match &*node {
                Node::Empty => return Ok(None),
                Node::Branch(branch) => {
                    if remaining.is_empty() {
                        return Err(MptError::corrupt("path exhausted inside a branch"));
                    }
                    let nibble = remaining.get(0) as usize;
                    remaining.shift_left(1);
                    branch.children[nibble].clone()
                }
                Node::Extension(ext) => {
                    if remaining.common_prefix_len(&ext.path) < ext.path.len() {
                        return Ok(None);
                    }
                    remaining.shift_left(ext.path.len());
                    ext.next.clone()
                }
                Node::Account(account) => {
                    return Ok((&account.address == address)
                        .then(|| (account.info, account.storage.clone())));
                }
                Node::Value(_) => {
                    return Err(MptError::corrupt("value node inside the account trie"));
                }
            };
            drop(node);
            current = next;
        }
    }

    pub(crate) fn find_value(
        &self,
        storage_root: &NodeReference,
        key: &Key,
    ) -> Result<Value, MptError> {
        let mut remaining = self.key_to_path(key);
        let mut current = storage_root.clone();
        loop {
            if current.is_empty() {
                return Ok(Value::zero());
            }
            let cell = self.get_shared_node(&current)?;
            let node = cell.read();
            let next = match &*node {
                Node::Empty => return Ok(Value::zero()),
                Node::Branch(branch) => {
                    if remaining.is_empty() {
                        return Err(MptError::corrupt("path exhausted inside a branch"));
                    }
                    let nibble = remaining.get(0) as usize;
                    remaining.shift_left(1);
                    branch.children[nibble].clone()
                }
                Node::Extension(ext) => {
                    if remaining.common_prefix_len(&ext.path) < ext.path.len() {
                        return Ok(Value::zero());
                    }
                    remaining.shift_left(ext.path.len());
                    ext.next.clone()
                }
                Node::Value(value) => {
                    return Ok(if &value.key == key {
                        value.value
                    } else {
                        Value::zero()
                    });
                }
                Node::Account(_) => {
                    return Err(MptError::corrupt("account node inside a storage trie"));
                }
            };
            drop(node);
            current = next;
        }
    }

    // ---------------------------------------------------------------------
    // write paths
    // ---------------------------------------------------------------------

    fn set_account_info_impl(
        &self,
        root: &NodeReference,
        address: &Address,
        info: AccountInfo,
    ) -> Result<NodeReference, MptError> {
        let path = self.address_to_path(address);
        let (new_root, _) = if info.is_empty() {
            self.delete(root, path, &LeafKey::Account(address))?
        } else {
            self.upsert(root, path, &LeafPayload::Account { address, info })?
        };
        Ok(new_root)
    }

    fn set_value_impl(
        &self,
        root: &NodeReference,
        address: &Address,
        key: &Key,
        value: Value,
    ) -> Result<NodeReference, MptError> {
        let path = self.address_to_path(address);
        let (new_root, _) = self.with_account(root, path, address, &mut |inner, account| {
            let key_path = inner.key_to_path(key);
            let storage = account.storage.clone();
            let (new_storage, changed) = if value.is_zero() {
                inner.delete(&storage, key_path, &LeafKey::Slot(key))?
            } else {
                inner.upsert(&storage, key_path, &LeafPayload::Slot { key, value })?
            };
            if changed {
                account.storage = new_storage;
                account.storage_hash_dirty = true;
                account.hash_dirty = true;
            }
            Ok(changed)
        })?;
        Ok(new_root)
    }

    /// Inserts or overwrites the leaf addressed by `remaining`, restoring
    /// the shape invariants on the way. Returns the new subtree root and
    /// whether the subtree content changed.
    fn upsert(
        &self,
        current: &NodeReference,
        remaining: Path,
        payload: &LeafPayload,
    ) -> Result<(NodeReference, bool), MptError> {
        if current.is_empty() {
            let (reference, _) = self.create_node(payload.make_node(remaining.len() as u8))?;
            return Ok((reference, true));
        }

        let cell = self.get_shared_node(current)?;
        let mut handle = cell.write();
        match &mut *handle {
            Node::Empty => {
                drop(handle);
                let (reference, _) = self.create_node(payload.make_node(remaining.len() as u8))?;
                Ok((reference, true))
            }

            Node::Branch(branch) => {
                if remaining.is_empty() {
                    return Err(MptError::corrupt("path exhausted inside a branch"));
                }
                let nibble = remaining.get(0);
                let child = branch.children[nibble as usize].clone();
                let (new_child, changed) = self.upsert(&child, remaining.shifted(1), payload)?;
                if !changed {
                    return Ok((current.clone(), false));
                }
                if branch.frozen {
                    let mut copy = branch.as_ref().clone();
                    copy.frozen = false;
                    copy.dirty = true;
                    copy.children[nibble as usize] = new_child;
                    copy.mark_child_dirty(nibble);
                    drop(handle);
                    let (reference, _) = self.create_node(Node::Branch(Box::new(copy)))?;
                    return Ok((reference, true));
                }
                branch.children[nibble as usize] = new_child;
                branch.mark_child_dirty(nibble);
                Ok((current.clone(), true))
            }

            Node::Extension(ext) => {
                let common = remaining.common_prefix_len(&ext.path);
                if common == ext.path.len() {
                    let next = ext.next.clone();
                    let (new_next, changed) =
                        self.upsert(&next, remaining.shifted(common), payload)?;
                    if !changed {
                        return Ok((current.clone(), false));
                    }
                    if ext.frozen {
                        let mut copy = ext.clone();
                        copy.frozen = false;
                        copy.dirty = true;
                        copy.next = new_next;
                        copy.next_hash_dirty = true;
                        copy.hash_dirty = true;
                        drop(handle);
                        let (reference, _) = self.create_node(Node::Extension(copy))?;
                        return Ok((reference, true));
                    }
                    ext.next = new_next;
                    ext.next_hash_dirty = true;
                    ext.hash_dirty = true;
                    ext.dirty = true;
                    return Ok((current.clone(), true));
                }

                // split the extension at the divergence point
                let ext_nibble = ext.path.get(common);
                let tail_len = ext.path.len() - common - 1;
                let old_subtree = if tail_len > 0 {
                    let mut tail = ExtensionNode::new(ext.path.shifted(common + 1), ext.next.clone());
                    tail.next_hash = ext.next_hash;
                    tail.next_hash_dirty = ext.next_hash_dirty;
                    tail.next_embedded = ext.next_embedded;
                    let (reference, _) = self.create_node(Node::Extension(tail))?;
                    reference
                } else {
                    ext.next.clone()
                };

                let leaf_nibble = remaining.get(common);
                let leaf_suffix = remaining.len() - common - 1;
                let (leaf_ref, _) = self.create_node(payload.make_node(leaf_suffix as u8))?;

                let mut branch = BranchNode::empty();
                branch.children[ext_nibble as usize] = old_subtree;
                branch.children[leaf_nibble as usize] = leaf_ref;
                branch.dirty_child_hashes = (1 << ext_nibble) | (1 << leaf_nibble);
                let (branch_ref, _) = self.create_node(branch.into())?;

                if common > 0 {
                    if ext.frozen {
                        let mut copy = ext.clone();
                        copy.frozen = false;
                        copy.dirty = true;
                        copy.path = copy.path.prefix(common);
                        copy.next = branch_ref;
                        copy.next_hash_dirty = true;
                        copy.hash_dirty = true;
                        drop(handle);
                        let (reference, _) = self.create_node(Node::Extension(copy))?;
                        return Ok((reference, true));
                    }
                    ext.path = ext.path.prefix(common);
                    ext.next = branch_ref;
                    ext.next_hash_dirty = true;
                    ext.hash_dirty = true;
                    ext.dirty = true;
                    Ok((current.clone(), true))
                } else {
                    let frozen = ext.frozen;
                    drop(handle);
                    if !frozen {
                        self.release_node(current.id())?;
                    }
                    Ok((branch_ref, true))
                }
            }

            Node::Account(account) => {
                let LeafPayload::Account { address, info } = payload else {
                    return Err(MptError::corrupt("account node inside a storage trie"));
                };
                if &account.address == *address {
                    if account.info == *info {
                        return Ok((current.clone(), false));
                    }
                    if account.frozen {
                        let mut copy = account.clone();
                        copy.frozen = false;
                        copy.dirty = true;
                        copy.info = *info;
                        copy.hash_dirty = true;
                        drop(handle);
                        let (reference, _) = self.create_node(Node::Account(copy))?;
                        return Ok((reference, true));
                    }
                    account.info = *info;
                    account.hash_dirty = true;
                    account.dirty = true;
                    return Ok((current.clone(), true));
                }

                let node_suffix = self
                    .address_to_path(&account.address)
                    .suffix(remaining.len());
                drop(handle);
                self.split_leaf(current, remaining, node_suffix, payload)
            }

            Node::Value(value) => {
                let LeafPayload::Slot { key, value: new_value } = payload else {
                    return Err(MptError::corrupt("value node inside the account trie"));
                };
                if &value.key == *key {
                    if value.value == *new_value {
                        return Ok((current.clone(), false));
                    }
                    if value.frozen {
                        let mut copy = value.clone();
                        copy.frozen = false;
                        copy.dirty = true;
                        copy.value = *new_value;
                        copy.hash_dirty = true;
                        drop(handle);
                        let (reference, _) = self.create_node(Node::Value(copy))?;
                        return Ok((reference, true));
                    }
                    value.value = *new_value;
                    value.hash_dirty = true;
                    value.dirty = true;
                    return Ok((current.clone(), true));
                }

                let node_suffix = self.key_to_path(&value.key).suffix(remaining.len());
                drop(handle);
                self.split_leaf(current, remaining, node_suffix, payload)
            }
        }
    }

    /// Factors the common prefix of a diverging leaf and the new path into
    /// a branch (plus an extension when the prefix is non-empty).
    fn split_leaf(
        &self,
        existing: &NodeReference,
        remaining: Path,
        node_suffix: Path,
        payload: &LeafPayload,
    ) -> Result<(NodeReference, bool), MptError> {
        debug_assert_eq!(remaining.len(), node_suffix.len());
        let common = remaining.common_prefix_len(&node_suffix);

        let old_nibble = node_suffix.get(common);
        let new_nibble = remaining.get(common);
        let new_suffix_len = remaining.len() - common - 1;

        let old_in_branch = self.resize_leaf_suffix(existing, new_suffix_len)?;
        let (leaf_ref, _) = self.create_node(payload.make_node(new_suffix_len as u8))?;

        let mut branch = BranchNode::empty();
        branch.children[old_nibble as usize] = old_in_branch;
        branch.children[new_nibble as usize] = leaf_ref;
        branch.dirty_child_hashes = (1 << old_nibble) | (1 << new_nibble);
        let (branch_ref, _) = self.create_node(branch.into())?;

        if common > 0 {
            let (ext_ref, _) = self.create_node(Node::Extension(ExtensionNode::new(
                remaining.prefix(common),
                branch_ref,
            )))?;
            Ok((ext_ref, true))
        } else {
            Ok((branch_ref, true))
        }
    }

    /// Sets a leaf's residual path length, copying frozen leaves. Without
    /// suffix tracking the leaf is position-independent and reused as is.
    fn resize_leaf_suffix(
        &self,
        leaf: &NodeReference,
        new_len: usize,
    ) -> Result<NodeReference, MptError> {
        if !self.config.track_suffix_lengths {
            return Ok(leaf.clone());
        }
        let cell = self.get_shared_node(leaf)?;
        let mut handle = cell.write();
        match &mut *handle {
            Node::Account(account) => {
                if account.path_length as usize == new_len {
                    return Ok(leaf.clone());
                }
                if account.frozen {
                    let mut copy = account.clone();
                    copy.frozen = false;
                    copy.dirty = true;
                    copy.path_length = new_len as u8;
                    copy.hash_dirty = true;
                    drop(handle);
                    let (reference, _) = self.create_node(Node::Account(copy))?;
                    return Ok(reference);
                }
                account.path_length = new_len as u8;
                account.hash_dirty = true;
                account.dirty = true;
                Ok(leaf.clone())
            }
            Node::Value(value) => {
                if value.path_length as usize == new_len {
                    return Ok(leaf.clone());
                }
                if value.frozen {
                    let mut copy = value.clone();
                    copy.frozen = false;
                    copy.dirty = true;
                    copy.path_length = new_len as u8;
                    copy.hash_dirty = true;
                    drop(handle);
                    let (reference, _) = self.create_node(Node::Value(copy))?;
                    return Ok(reference);
                }
                value.path_length = new_len as u8;
                value.hash_dirty = true;
                value.dirty = true;
                Ok(leaf.clone())
            }
            _ => Err(MptError::corrupt("suffix resize of a non-leaf node")),
        }
    }

    /// Removes the leaf addressed by `remaining` and collapses the trie
    /// shape around the removal. Returns the new subtree root (possibly the
    /// empty reference) and whether anything changed.
    fn delete(
        &self,
        current: &NodeReference,
        remaining: Path,
        key: &LeafKey,
    ) -> Result<(NodeReference, bool), MptError> {
        if current.is_empty() {
            return Ok((NodeReference::empty(), false));
        }

        let cell = self.get_shared_node(current)?;
        let mut handle = cell.write();
        match &mut *handle {
            Node::Empty => Ok((NodeReference::empty(), false)),

            Node::Branch(branch) => {
                if remaining.is_empty() {
                    return Err(MptError::corrupt("path exhausted inside a branch"));
                }
                let nibble = remaining.get(0);
                let child = branch.children[nibble as usize].clone();
                if child.is_empty() {
                    return Ok((current.clone(), false));
                }
                let (new_child, changed) = self.delete(&child, remaining.shifted(1), key)?;
                if !changed {
                    return Ok((current.clone(), false));
                }

                let mut updated = branch.as_ref().clone();
                updated.frozen = false;
                updated.dirty = true;
                updated.children[nibble as usize] = new_child;
                updated.mark_child_dirty(nibble);
                updated.set_embedded(nibble, false);

                // a branch with one remaining child collapses into it
                if let Some(survivor_nibble) = updated.single_child_nibble() {
                    let survivor = updated.children[survivor_nibble as usize].clone();
                    let frozen = branch.frozen;
                    drop(handle);
                    let merged = self.absorb_branch_nibble(&survivor, survivor_nibble)?;
                    if !frozen {
                        self.release_node(current.id())?;
                    }
                    return Ok((merged, true));
                }

                if branch.frozen {
                    drop(handle);
                    let (reference, _) = self.create_node(Node::Branch(Box::new(updated)))?;
                    return Ok((reference, true));
                }
                **branch = updated;
                Ok((current.clone(), true))
            }

            Node::Extension(ext) => {
                let common = remaining.common_prefix_len(&ext.path);
                if common < ext.path.len() {
                    return Ok((current.clone(), false));
                }
                let next = ext.next.clone();
                let (new_next, changed) = self.delete(&next, remaining.shifted(common), key)?;
                if !changed {
                    return Ok((current.clone(), false));
                }
                if new_next.is_empty() {
                    let frozen = ext.frozen;
                    drop(handle);
                    if !frozen {
                        self.release_node(current.id())?;
                    }
                    return Ok((NodeReference::empty(), true));
                }

                let next_cell = self.get_shared_node(&new_next)?;
                let next_kind = next_cell.read().kind();
                drop(next_cell);
                match next_kind {
                    Some(NodeKind::Branch) => {
                        if ext.frozen {
                            let mut copy = ext.clone();
                            copy.frozen = false;
                            copy.dirty = true;
                            copy.next = new_next;
                            copy.next_hash_dirty = true;
                            copy.hash_dirty = true;
                            drop(handle);
                            let (reference, _) = self.create_node(Node::Extension(copy))?;
                            return Ok((reference, true));
                        }
                        ext.next = new_next;
                        ext.next_hash_dirty = true;
                        ext.hash_dirty = true;
                        ext.dirty = true;
                        Ok((current.clone(), true))
                    }
                    Some(NodeKind::Extension) => {
                        // the collapsed child is an extension; merge paths
                        let prefix = ext.path;
                        let frozen = ext.frozen;
                        drop(handle);
                        let merged = self.prepend_extension_path(&new_next, &prefix)?;
                        if !frozen {
                            self.release_node(current.id())?;
                        }
                        Ok((merged, true))
                    }
                    Some(NodeKind::Account) | Some(NodeKind::Value) => {
                        // the leaf absorbs the extension's whole path
                        let extra = ext.path.len();
                        let frozen = ext.frozen;
                        drop(handle);
                        let merged = self.bump_leaf_suffix(&new_next, extra)?;
                        if !frozen {
                            self.release_node(current.id())?;
                        }
                        Ok((merged, true))
                    }
                    None => Err(MptError::corrupt("extension pointing at nothing")),
                }
            }

            Node::Account(account) => {
                let LeafKey::Account(address) = key else {
                    return Err(MptError::corrupt("account node inside a storage trie"));
                };
                if &account.address != *address {
                    return Ok((current.clone(), false));
                }
                let frozen = account.frozen;
                drop(handle);
                if !frozen {
                    // storage subtries can be large, reclaim in the background
                    self.release_async(current.clone());
                }
                Ok((NodeReference::empty(), true))
            }

            Node::Value(value) => {
                let LeafKey::Slot(slot_key) = key else {
                    return Err(MptError::corrupt("value node inside the account trie"));
                };
                if &value.key != *slot_key {
                    return Ok((current.clone(), false));
                }
                let frozen = value.frozen;
                drop(handle);
                if !frozen {
                    self.release_node(current.id())?;
                }
                Ok((NodeReference::empty(), true))
            }
        }
    }

    /// Folds the branch nibble of a collapse into the surviving child.
    fn absorb_branch_nibble(
        &self,
        survivor: &NodeReference,
        nibble: u8,
    ) -> Result<NodeReference, MptError> {
        let cell = self.get_shared_node(survivor)?;
        let kind = cell.read().kind();
        drop(cell);
        match kind {
            Some(NodeKind::Account) | Some(NodeKind::Value) => self.bump_leaf_suffix(survivor, 1),
            Some(NodeKind::Extension) => {
                self.prepend_extension_path(survivor, &Path::from_nibbles(&[nibble]))
            }
            Some(NodeKind::Branch) => {
                let (reference, _) = self.create_node(Node::Extension(ExtensionNode::new(
                    Path::from_nibbles(&[nibble]),
                    survivor.clone(),
                )))?;
                Ok(reference)
            }
            None => Err(MptError::corrupt("collapse into an empty child")),
        }
    }

    fn bump_leaf_suffix(
        &self,
        leaf: &NodeReference,
        extra: usize,
    ) -> Result<NodeReference, MptError> {
        if !self.config.track_suffix_lengths || extra == 0 {
            return Ok(leaf.clone());
        }
        let current_len = {
            let cell = self.get_shared_node(leaf)?;
            let node = cell.read();
            match &*node {
                Node::Account(account) => account.path_length as usize,
                Node::Value(value) => value.path_length as usize,
                _ => return Err(MptError::corrupt("suffix bump of a non-leaf node")),
            }
        };
        self.resize_leaf_suffix(leaf, current_len + extra)
    }

    fn prepend_extension_path(
        &self,
        ext: &NodeReference,
        prefix: &Path,
    ) -> Result<NodeReference, MptError> {
        let cell = self.get_shared_node(ext)?;
        let mut handle = cell.write();
        let Node::Extension(node) = &mut *handle else {
            return Err(MptError::corrupt("path prepend on a non-extension node"));
        };
        if node.frozen {
            let mut copy = node.clone();
            copy.frozen = false;
            copy.dirty = true;
            copy.path.prepend_path(prefix);
            copy.hash_dirty = true;
            drop(handle);
            let (reference, _) = self.create_node(Node::Extension(copy))?;
            return Ok(reference);
        }
        node.path.prepend_path(prefix);
        node.hash_dirty = true;
        node.dirty = true;
        Ok(ext.clone())
    }

    /// Descends to the account leaf of `address` and applies `action` to it
    /// with copy-on-write semantics. Absent accounts are a no-op.
    fn with_account(
        &self,
        current: &NodeReference,
        remaining: Path,
        address: &Address,
        action: &mut dyn FnMut(&ForestInner, &mut AccountNode) -> Result<bool, MptError>,
    ) -> Result<(NodeReference, bool), MptError> {
        if current.is_empty() {
            return Ok((NodeReference::empty(), false));
        }

        let cell = self.get_shared_node(current)?;
        let mut handle = cell.write();
        match &mut *handle {
            Node::Empty => Ok((NodeReference::empty(), false)),

            Node::Branch(branch) => {
                if remaining.is_empty() {
                    return Err(MptError::corrupt("path exhausted inside a branch"));
                }
                let nibble = remaining.get(0);
                let child = branch.children[nibble as usize].clone();
                let (new_child, changed) =
                    self.with_account(&child, remaining.shifted(1), address, action)?;
                if !changed {
                    return Ok((current.clone(), false));
                }
                if branch.frozen {
                    let mut copy = branch.as_ref().clone();
                    copy.frozen = false;
                    copy.dirty = true;
                    copy.children[nibble as usize] = new_child;
                    copy.mark_child_dirty(nibble);
                    drop(handle);
                    let (reference, _) = self.create_node(Node::Branch(Box::new(copy)))?;
                    return Ok((reference, true));
                }
                branch.children[nibble as usize] = new_child;
                branch.mark_child_dirty(nibble);
                Ok((current.clone(), true))
            }

            Node::Extension(ext) => {
                if remaining.common_prefix_len(&ext.path) < ext.path.len() {
                    return Ok((current.clone(), false));
                }
                let next = ext.next.clone();
                let (new_next, changed) =
                    self.with_account(&next, remaining.shifted(ext.path.len()), address, action)?;
                if !changed {
                    return Ok((current.clone(), false));
                }
                if ext.frozen {
                    let mut copy = ext.clone();
                    copy.frozen = false;
                    copy.dirty = true;
                    copy.next = new_next;
                    copy.next_hash_dirty = true;
                    copy.hash_dirty = true;
                    drop(handle);
                    let (reference, _) = self.create_node(Node::Extension(copy))?;
                    return Ok((reference, true));
                }
                ext.next = new_next;
                ext.next_hash_dirty = true;
                ext.hash_dirty = true;
                ext.dirty = true;
                Ok((current.clone(), true))
            }

            Node::Account(account) => {
                if &account.address != address {
                    return Ok((current.clone(), false));
                }
                // run the action on a scratch copy, then commit it in place
                // or into a fresh slot when the original is frozen
                let mut scratch = account.clone();
                scratch.dirty = true;
                let changed = action(self, &mut scratch)?;
                if !changed {
                    return Ok((current.clone(), false));
                }
                if account.frozen {
                    scratch.frozen = false;
                    drop(handle);
                    let (reference, _) = self.create_node(Node::Account(scratch))?;
                    return Ok((reference, true));
                }
                *account = scratch;
                Ok((current.clone(), true))
            }

            Node::Value(_) => Err(MptError::corrupt("value node inside the account trie")),
        }
    }

    pub(crate) fn release_async(&self, reference: NodeReference) {
        if reference.is_empty() {
            return;
        }
        if let Some(tx) = self.release_tx.lock().as_ref() {
            let _ = tx.send(super::ReleaseCommand::Release(reference));
        }
    }

    // ---------------------------------------------------------------------
    // invariant checks
    // ---------------------------------------------------------------------

    pub(crate) fn check_subtree(
        &self,
        current: &NodeReference,
        depth: usize,
        in_storage: bool,
        full_len: usize,
    ) -> Result<(), MptError> {
        if current.is_empty() {
            return Ok(());
        }
        let cell = self.get_shared_node(current)?;
        let node = cell.read();
        match &*node {
            Node::Empty => Ok(()),

            Node::Branch(branch) => {
                if branch.child_count() < 2 {
                    return Err(MptError::corrupt(format!(
                        "branch {:?} has {} children",
                        current.id(),
                        branch.child_count()
                    )));
                }
                let children: Vec<NodeReference> = branch
                    .children
                    .iter()
                    .filter(|c| !c.is_empty())
                    .cloned()
                    .collect();
                drop(node);
                for child in children {
                    self.check_subtree(&child, depth + 1, in_storage, full_len)?;
                }
                Ok(())
            }

            Node::Extension(ext) => {
                if ext.path.is_empty() {
                    return Err(MptError::corrupt(format!(
                        "extension {:?} with an empty path",
                        current.id()
                    )));
                }
                let next = ext.next.clone();
                let path_len = ext.path.len();
                drop(node);
                let next_cell = self.get_shared_node(&next)?;
                let next_is_branch = matches!(&*next_cell.read(), Node::Branch(_));
                drop(next_cell);
                if !next_is_branch {
                    return Err(MptError::corrupt(format!(
                        "extension {:?} not followed by a branch",
                        current.id()
                    )));
                }
                self.check_subtree(&next, depth + path_len, in_storage, full_len)
            }

            Node::Account(account) => {
                if in_storage {
                    return Err(MptError::corrupt(format!(
                        "account node {:?} inside a storage trie",
                        current.id()
                    )));
                }
                if self.config.track_suffix_lengths
                    && account.path_length as usize != full_len - depth
                {
                    return Err(MptError::corrupt(format!(
                        "account {:?} stores suffix length {}, position implies {}",
                        current.id(),
                        account.path_length,
                        full_len - depth
                    )));
                }
                let storage = account.storage.clone();
                drop(node);
                self.check_subtree(&storage, 0, true, Path::MAX_NIBBLES)
            }

            Node::Value(value) => {
                if !in_storage {
                    return Err(MptError::corrupt(format!(
                        "value node {:?} outside a storage trie",
                        current.id()
                    )));
                }
                if self.config.track_suffix_lengths
                    && value.path_length as usize != full_len - depth
                {
                    return Err(MptError::corrupt(format!(
                        "value {:?} stores suffix length {}, position implies {}",
                        current.id(),
                        value.path_length,
                        full_len - depth
                    )));
                }
                Ok(())
            }
        }
    }
}
