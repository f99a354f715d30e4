//! The hashing pipeline of the forest.
//!
//! Two schemes are supported: a tagged binary encoding hashed directly
//! (`Direct`), and Yellow-Paper RLP hashing bit-compatible with Ethereum
//! (`EthereumLike`), including the embedded-node rule: a child whose RLP
//! encoding is shorter than 32 bytes is stored verbatim inside its parent
//! instead of by hash. Embedded flags are recomputed whenever a node is
//! re-encoded; the persisted flags are only trusted for children whose
//! dirty bit is clear.

use ethereum_types::H256;
use lazy_static::lazy_static;
use rustc_hash::{FxHashMap, FxHashSet};
use sylva_rlp::constants::RLP_NULL;
use sylva_rlp::encode::RLPEncode;
use sylva_rlp::structs::Encoder;

use crate::config::{HashAlgorithm, HashStorageLocation};
use crate::error::MptError;
use crate::forest::ForestInner;
use crate::node::{Node, NodeId, NodeReference};
use crate::path::Path;
use crate::types::{EMPTY_CODE_HASH, keccak256};

lazy_static! {
    /// Hash of the empty trie under Ethereum rules: keccak of the RLP of
    /// the empty string.
    pub static ref EMPTY_TRIE_HASH: H256 = keccak256(&[RLP_NULL]);
}

/// Position of a node within a trie: the nibbles consumed from the root,
/// with `0x10` marking the descent from an account into its storage trie.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct NodePath(Vec<u8>);

impl NodePath {
    pub fn nibbles(&self) -> &[u8] {
        &self.0
    }
}

/// Hashes refreshed by an update pass, in child-before-parent order.
pub type NodeHashes = Vec<(NodePath, H256)>;

const STORAGE_MARKER: u8 = 0x10;

struct HashPass<'a> {
    inner: &'a ForestInner,
    persist: bool,
    /// Recompute every hash from scratch and fail on any stored hash that
    /// does not match; used by offline verification.
    verify: bool,
    hints: Option<&'a FxHashMap<Vec<u8>, H256>>,
    out: NodeHashes,
    verified: FxHashSet<NodeId>,
}

struct Digest {
    hash: H256,
    /// The node's encoding when it is shorter than 32 bytes and therefore
    /// embedded in its parent.
    embedded: Option<Vec<u8>>,
}

/// Refreshes every dirty hash under `root` bottom-up, storing clean hashes
/// in the nodes, and returns the root hash plus the refreshed entries.
pub(crate) fn update_hashes(
    inner: &ForestInner,
    root: &NodeReference,
) -> Result<(H256, NodeHashes), MptError> {
    let mut pass = HashPass {
        inner,
        persist: true,
        verify: false,
        hints: None,
        out: NodeHashes::new(),
        verified: FxHashSet::default(),
    };
    let hash = pass.root_hash(root)?;
    Ok((hash, pass.out))
}

/// Read-only root hash: stored hashes are returned as-is, dirty ones are
/// recomputed without being written back.
pub(crate) fn get_hash(inner: &ForestInner, root: &NodeReference) -> Result<H256, MptError> {
    let mut pass = HashPass {
        inner,
        persist: false,
        verify: false,
        hints: None,
        out: NodeHashes::new(),
        verified: FxHashSet::default(),
    };
    pass.root_hash(root)
}

/// Recomputes every hash reachable from the given roots, comparing against
/// the stored hashes and the expected root hashes. Subtrees shared between
/// roots are checked once.
pub(crate) fn verify_hashes(
    inner: &ForestInner,
    roots: &[(NodeReference, H256)],
) -> Result<(), MptError> {
    let mut pass = HashPass {
        inner,
        persist: false,
        verify: true,
        hints: None,
        out: NodeHashes::new(),
        verified: FxHashSet::default(),
    };
    for (index, (root, expected)) in roots.iter().enumerate() {
        let computed = pass.root_hash(root)?;
        if computed != *expected {
            return Err(MptError::corrupt(format!(
                "root {index} hashes to {computed:#x}, recorded {expected:#x}"
            )));
        }
    }
    Ok(())
}

/// Like [`update_hashes`], but hashes found in `hashes` are applied instead
/// of recomputed; the structural walk still refreshes embedded flags and
/// parent bookkeeping.
pub(crate) fn set_hashes(
    inner: &ForestInner,
    root: &NodeReference,
    hashes: &NodeHashes,
) -> Result<(), MptError> {
    let map: FxHashMap<Vec<u8>, H256> = hashes
        .iter()
        .map(|(path, hash)| (path.0.clone(), *hash))
        .collect();
    let mut pass = HashPass {
        inner,
        persist: true,
        verify: false,
        hints: Some(&map),
        out: NodeHashes::new(),
        verified: FxHashSet::default(),
    };
    pass.root_hash(root)?;
    Ok(())
}

impl HashPass<'_> {
    fn root_hash(&mut self, root: &NodeReference) -> Result<H256, MptError> {
        let algorithm = self.inner.config.hashing;
        if root.is_empty() {
            return Ok(match algorithm {
                HashAlgorithm::Direct => H256::zero(),
                HashAlgorithm::EthereumLike => *EMPTY_TRIE_HASH,
            });
        }
        let full_len = self.account_trie_path_len();
        let mut path = Vec::new();
        match algorithm {
            HashAlgorithm::Direct => self.direct_digest(root, &mut path),
            HashAlgorithm::EthereumLike => {
                Ok(self.ethereum_digest(root, 0, full_len, false, &mut path)?.hash)
            }
        }
    }

    fn account_trie_path_len(&self) -> usize {
        if self.inner.config.use_hashed_paths {
            Path::MAX_NIBBLES
        } else {
            40
        }
    }

    fn lookup_or_keccak(&self, path: &[u8], encoding: &[u8]) -> H256 {
        if let Some(hints) = self.hints {
            if let Some(hash) = hints.get(path) {
                return *hash;
            }
        }
        keccak256(encoding)
    }

    /// Reads the hash of a child whose dirty bit is clear. With parent-side
    /// storage the caller's copy is authoritative; with node-side storage
    /// the child itself carries it. A still-dirty child reports `None` and
    /// must be recursed into. Verification trusts only already-checked
    /// subtrees.
    fn clean_child_hash(
        &self,
        parent_copy: H256,
        child: &NodeReference,
    ) -> Result<Option<H256>, MptError> {
        if self.verify && !self.verified.contains(&child.id()) {
            return Ok(None);
        }
        match self.inner.config.hash_storage {
            HashStorageLocation::WithParent => Ok(Some(parent_copy)),
            HashStorageLocation::WithNode => {
                let cell = self.inner.get_shared_node(child)?;
                let node = cell.hash_access();
                if node.is_hash_dirty() {
                    Ok(None)
                } else {
                    Ok(Some(node.hash()))
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Ethereum-like hashing
    // -----------------------------------------------------------------

    /// Computes hash and, when shorter than 32 bytes, the encoding of the
    /// node. `need_encoding` forces the encoding even for clean nodes, so
    /// parents can refresh their embedded-child knowledge.
    fn ethereum_digest(
        &mut self,
        reference: &NodeReference,
        depth: usize,
        full_len: usize,
        need_encoding: bool,
        path: &mut Vec<u8>,
    ) -> Result<Digest, MptError> {
        if reference.is_empty() {
            return Ok(Digest {
                hash: *EMPTY_TRIE_HASH,
                embedded: None,
            });
        }

        let cell = self.inner.get_shared_node(reference)?;
        let mut handle = cell.hash_access();

        if self.verify {
            if self.verified.contains(&reference.id()) && !need_encoding {
                return Ok(Digest {
                    hash: handle.hash(),
                    embedded: None,
                });
            }
        } else if !handle.is_hash_dirty() && !need_encoding {
            return Ok(Digest {
                hash: handle.hash(),
                embedded: None,
            });
        }

        let was_dirty = handle.is_hash_dirty();
        let encoding = match &mut *handle {
            Node::Empty => vec![RLP_NULL],

            Node::Value(value) => {
                let suffix_len = full_len - depth;
                let key_path = self.inner.key_to_path(&value.key);
                let suffix: Vec<u8> = key_path.suffix(suffix_len).nibbles().collect();
                let trimmed = strip_leading_zeros(value.value.as_bytes());
                let payload = trimmed.encode_to_vec();

                let mut buf = Vec::new();
                Encoder::new(&mut buf)
                    .encode_bytes(&compact_encode(&suffix, true))
                    .encode_bytes(&payload)
                    .finish();
                buf
            }

            Node::Account(account) => {
                let storage_root = {
                    let storage = account.storage.clone();
                    if storage.is_empty() {
                        *EMPTY_TRIE_HASH
                    } else {
                        let clean = if account.storage_hash_dirty {
                            None
                        } else {
                            self.clean_child_hash(account.storage_hash, &storage)?
                        };
                        match clean {
                            Some(hash) => hash,
                            None => {
                                path.push(STORAGE_MARKER);
                                let digest = self.ethereum_digest(
                                    &storage,
                                    0,
                                    Path::MAX_NIBBLES,
                                    false,
                                    path,
                                )?;
                                path.pop();
                                digest.hash
                            }
                        }
                    }
                };
                if self.persist {
                    account.storage_hash = storage_root;
                    account.storage_hash_dirty = false;
                }

                let code_hash = if account.info.code_hash.is_zero() {
                    *EMPTY_CODE_HASH
                } else {
                    account.info.code_hash
                };
                let mut payload = Vec::new();
                Encoder::new(&mut payload)
                    .encode_field(&account.info.nonce)
                    .encode_field(&account.info.balance)
                    .encode_field(&storage_root)
                    .encode_field(&code_hash)
                    .finish();

                let suffix_len = full_len - depth;
                let addr_path = self.inner.address_to_path(&account.address);
                let suffix: Vec<u8> = addr_path.suffix(suffix_len).nibbles().collect();

                let mut buf = Vec::new();
                Encoder::new(&mut buf)
                    .encode_bytes(&compact_encode(&suffix, true))
                    .encode_bytes(&payload)
                    .finish();
                buf
            }

            Node::Extension(ext) => {
                let next = ext.next.clone();
                let child_depth = depth + ext.path.len();
                let clean = if ext.next_hash_dirty || ext.next_embedded {
                    None
                } else {
                    self.clean_child_hash(ext.next_hash, &next)?
                };
                let (child_hash, child_embedded) = match clean {
                    Some(hash) => (hash, None),
                    None => {
                        let before = path.len();
                        path.extend(ext.path.nibbles());
                        let digest =
                            self.ethereum_digest(&next, child_depth, full_len, true, path)?;
                        path.truncate(before);
                        (digest.hash, digest.embedded)
                    }
                };
                if self.persist {
                    ext.next_hash = child_hash;
                    ext.next_hash_dirty = false;
                    ext.next_embedded = child_embedded.is_some();
                }

                let prefix: Vec<u8> = ext.path.nibbles().collect();
                let mut buf = Vec::new();
                let encoder = Encoder::new(&mut buf).encode_bytes(&compact_encode(&prefix, false));
                match &child_embedded {
                    Some(encoding) => encoder.encode_raw(encoding).finish(),
                    None => encoder.encode_field(&child_hash).finish(),
                }
                buf
            }

            Node::Branch(branch) => {
                let mut items: [Option<(H256, Option<Vec<u8>>)>; 16] =
                    std::array::from_fn(|_| None);
                for nibble in 0..16u8 {
                    let child = branch.children[nibble as usize].clone();
                    if child.is_empty() {
                        continue;
                    }
                    let bit_dirty = branch.dirty_child_hashes & (1 << nibble) != 0;
                    let clean = if bit_dirty || branch.is_embedded(nibble) {
                        None
                    } else {
                        self.clean_child_hash(branch.child_hashes[nibble as usize], &child)?
                    };
                    items[nibble as usize] = Some(match clean {
                        Some(hash) => (hash, None),
                        None => {
                            path.push(nibble);
                            let digest =
                                self.ethereum_digest(&child, depth + 1, full_len, true, path)?;
                            path.pop();
                            (digest.hash, digest.embedded)
                        }
                    });
                }

                if self.persist {
                    for nibble in 0..16u8 {
                        if let Some((hash, embedded)) = &items[nibble as usize] {
                            branch.child_hashes[nibble as usize] = *hash;
                            branch.set_embedded(nibble, embedded.is_some());
                        }
                    }
                    branch.dirty_child_hashes = 0;
                }

                let mut buf = Vec::new();
                let mut encoder = Encoder::new(&mut buf);
                for item in &items {
                    encoder = match item {
                        None => encoder.encode_bytes(&[]),
                        Some((_, Some(encoding))) => encoder.encode_raw(encoding),
                        Some((hash, None)) => encoder.encode_field(hash),
                    };
                }
                encoder.encode_bytes(&[]).finish();
                buf
            }
        };

        let hash = self.lookup_or_keccak(path, &encoding);
        if self.verify {
            if !was_dirty && handle.hash() != hash {
                return Err(MptError::corrupt(format!(
                    "node {:?} stores hash {:#x}, content hashes to {hash:#x}",
                    reference.id(),
                    handle.hash()
                )));
            }
            self.verified.insert(reference.id());
        }
        if self.persist && was_dirty {
            handle.set_hash(hash);
            self.out.push((NodePath(path.clone()), hash));
        }

        let embedded = (encoding.len() < 32).then_some(encoding);
        Ok(Digest { hash, embedded })
    }

    // -----------------------------------------------------------------
    // direct hashing
    // -----------------------------------------------------------------

    fn direct_digest(
        &mut self,
        reference: &NodeReference,
        path: &mut Vec<u8>,
    ) -> Result<H256, MptError> {
        if reference.is_empty() {
            return Ok(H256::zero());
        }

        let cell = self.inner.get_shared_node(reference)?;
        let mut handle = cell.hash_access();
        if self.verify {
            if self.verified.contains(&reference.id()) {
                return Ok(handle.hash());
            }
        } else if !handle.is_hash_dirty() {
            return Ok(handle.hash());
        }
        let was_dirty = handle.is_hash_dirty();

        let encoding = match &mut *handle {
            Node::Empty => return Ok(H256::zero()),

            Node::Value(value) => {
                let mut buf = Vec::with_capacity(1 + 32 + 32);
                buf.push(0x03);
                buf.extend_from_slice(value.key.as_bytes());
                buf.extend_from_slice(value.value.as_bytes());
                buf
            }

            Node::Account(account) => {
                let storage = account.storage.clone();
                let storage_hash = if storage.is_empty() {
                    H256::zero()
                } else {
                    let clean = if account.storage_hash_dirty {
                        None
                    } else {
                        self.clean_child_hash(account.storage_hash, &storage)?
                    };
                    match clean {
                        Some(hash) => hash,
                        None => {
                            path.push(STORAGE_MARKER);
                            let hash = self.direct_digest(&storage, path)?;
                            path.pop();
                            hash
                        }
                    }
                };
                if self.persist {
                    account.storage_hash = storage_hash;
                    account.storage_hash_dirty = false;
                }

                let mut buf = Vec::with_capacity(1 + 20 + 8 + 32 + 32 + 32);
                buf.push(0x02);
                buf.extend_from_slice(account.address.as_bytes());
                buf.extend_from_slice(&account.info.nonce.to_be_bytes());
                buf.extend_from_slice(&account.info.balance.to_big_endian());
                buf.extend_from_slice(account.info.code_hash.as_bytes());
                buf.extend_from_slice(storage_hash.as_bytes());
                buf
            }

            Node::Extension(ext) => {
                let next = ext.next.clone();
                let clean = if ext.next_hash_dirty {
                    None
                } else {
                    self.clean_child_hash(ext.next_hash, &next)?
                };
                let child_hash = match clean {
                    Some(hash) => hash,
                    None => {
                        let before = path.len();
                        path.extend(ext.path.nibbles());
                        let hash = self.direct_digest(&next, path)?;
                        path.truncate(before);
                        hash
                    }
                };
                if self.persist {
                    ext.next_hash = child_hash;
                    ext.next_hash_dirty = false;
                }

                let mut buf = Vec::with_capacity(1 + Path::PACKED_SIZE + 32);
                buf.push(0x01);
                buf.extend_from_slice(&ext.path.to_packed());
                buf.extend_from_slice(child_hash.as_bytes());
                buf
            }

            Node::Branch(branch) => {
                let mut child_hashes = [H256::zero(); 16];
                for nibble in 0..16u8 {
                    let child = branch.children[nibble as usize].clone();
                    if child.is_empty() {
                        continue;
                    }
                    let bit_dirty = branch.dirty_child_hashes & (1 << nibble) != 0;
                    let clean = if bit_dirty {
                        None
                    } else {
                        self.clean_child_hash(branch.child_hashes[nibble as usize], &child)?
                    };
                    child_hashes[nibble as usize] = match clean {
                        Some(hash) => hash,
                        None => {
                            path.push(nibble);
                            let hash = self.direct_digest(&child, path)?;
                            path.pop();
                            hash
                        }
                    };
                }

                if self.persist {
                    branch.child_hashes = child_hashes;
                    branch.dirty_child_hashes = 0;
                }

                let mut buf = Vec::with_capacity(1 + 16 * 32);
                buf.push(0x00);
                for hash in &child_hashes {
                    buf.extend_from_slice(hash.as_bytes());
                }
                buf
            }
        };

        let hash = self.lookup_or_keccak(path, &encoding);
        if self.verify {
            if !was_dirty && handle.hash() != hash {
                return Err(MptError::corrupt(format!(
                    "node {:?} stores hash {:#x}, content hashes to {hash:#x}",
                    reference.id(),
                    handle.hash()
                )));
            }
            self.verified.insert(reference.id());
        }
        if self.persist && was_dirty {
            handle.set_hash(hash);
            self.out.push((NodePath(path.clone()), hash));
        }
        Ok(hash)
    }
}

/// Hex-prefix encoding of a nibble sequence (Yellow Paper appendix C).
fn compact_encode(nibbles: &[u8], is_leaf: bool) -> Vec<u8> {
    let flag: u8 = if is_leaf { 0x20 } else { 0x00 };
    let mut out = Vec::with_capacity(nibbles.len() / 2 + 1);
    let mut at = 0;
    if nibbles.len() % 2 == 1 {
        out.push(flag | 0x10 | nibbles[0]);
        at = 1;
    } else {
        out.push(flag);
    }
    while at < nibbles.len() {
        out.push((nibbles[at] << 4) | nibbles[at + 1]);
        at += 2;
    }
    out
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn empty_trie_hash_matches_reference() {
        assert_eq!(
            EMPTY_TRIE_HASH.as_bytes(),
            hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
        );
    }

    #[test]
    fn compact_encoding_follows_the_yellow_paper() {
        // even extension
        assert_eq!(compact_encode(&[1, 2, 3, 4], false), vec![0x00, 0x12, 0x34]);
        // odd extension
        assert_eq!(compact_encode(&[1, 2, 3], false), vec![0x11, 0x23]);
        // even leaf
        assert_eq!(compact_encode(&[0xf, 0x1], true), vec![0x20, 0xf1]);
        // odd leaf
        assert_eq!(compact_encode(&[0xf], true), vec![0x3f]);
        // empty leaf path
        assert_eq!(compact_encode(&[], true), vec![0x20]);
    }

    #[test]
    fn leading_zeros_are_stripped_from_values() {
        assert_eq!(strip_leading_zeros(&[0, 0, 5, 0]), &[5, 0]);
        assert_eq!(strip_leading_zeros(&[0, 0, 0]), &[] as &[u8]);
        assert_eq!(strip_leading_zeros(&[9]), &[9]);
    }
}
