//! Fixed-size binary record layouts for the four node stocks.
//!
//! All integers are big-endian. The layouts depend on two configuration
//! axes: where clean hashes live (with the node itself or with its parent)
//! and whether leaf records carry their residual path length.

use ethereum_types::{H256, U256};

use crate::config::{HashStorageLocation, MptConfig};
use crate::error::MptError;
use crate::node::{AccountNode, BranchNode, ExtensionNode, NodeId, NodeReference, ValueNode};
use crate::path::Path;
use crate::stock::StockCodec;
use crate::types::{AccountInfo, Address};

const FLAG_HASH_DIRTY: u8 = 0b0000_0001;
const FLAG_CHILD_EMBEDDED: u8 = 0b0000_0010;
const FLAG_CHILD_HASH_DIRTY: u8 = 0b0000_0100;

pub struct BranchCodec {
    hash_storage: HashStorageLocation,
}

pub struct ExtensionCodec {
    hash_storage: HashStorageLocation,
}

pub struct AccountCodec {
    hash_storage: HashStorageLocation,
    track_suffix: bool,
}

pub struct ValueCodec {
    hash_storage: HashStorageLocation,
    track_suffix: bool,
}

impl BranchCodec {
    pub fn new(config: &MptConfig) -> Self {
        BranchCodec {
            hash_storage: config.hash_storage,
        }
    }
}

impl ExtensionCodec {
    pub fn new(config: &MptConfig) -> Self {
        ExtensionCodec {
            hash_storage: config.hash_storage,
        }
    }
}

impl AccountCodec {
    pub fn new(config: &MptConfig) -> Self {
        AccountCodec {
            hash_storage: config.hash_storage,
            track_suffix: config.track_suffix_lengths,
        }
    }
}

impl ValueCodec {
    pub fn new(config: &MptConfig) -> Self {
        ValueCodec {
            hash_storage: config.hash_storage,
            track_suffix: config.track_suffix_lengths,
        }
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, at: 0 }
    }

    fn put(&mut self, data: &[u8]) {
        self.buf[self.at..self.at + data.len()].copy_from_slice(data);
        self.at += data.len();
    }

    fn put_u8(&mut self, value: u8) {
        self.buf[self.at] = value;
        self.at += 1;
    }

    fn put_u16(&mut self, value: u16) {
        self.put(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.put(&value.to_be_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, at: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], MptError> {
        let end = self.at + N;
        if end > self.buf.len() {
            return Err(MptError::corrupt("node record too short"));
        }
        let out: [u8; N] = self.buf[self.at..end].try_into().unwrap();
        self.at = end;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, MptError> {
        Ok(self.take::<1>()?[0])
    }

    fn take_u16(&mut self) -> Result<u16, MptError> {
        Ok(u16::from_be_bytes(self.take::<2>()?))
    }

    fn take_u64(&mut self) -> Result<u64, MptError> {
        Ok(u64::from_be_bytes(self.take::<8>()?))
    }

    fn take_id(&mut self) -> Result<NodeId, MptError> {
        Ok(NodeId::from_bytes(self.take::<8>()?))
    }

    fn take_hash(&mut self) -> Result<H256, MptError> {
        Ok(H256(self.take::<32>()?))
    }
}

impl StockCodec for BranchCodec {
    type Item = BranchNode;

    fn encoded_size(&self) -> usize {
        match self.hash_storage {
            // children + embedded mask + dirty mask + flags + own hash
            HashStorageLocation::WithNode => 16 * 8 + 2 + 2 + 1 + 32,
            // children + embedded mask + dirty mask + flags + child hashes
            HashStorageLocation::WithParent => 16 * 8 + 2 + 2 + 1 + 16 * 32,
        }
    }

    fn encode(&self, node: &BranchNode, out: &mut [u8]) {
        let mut w = Writer::new(out);
        for child in &node.children {
            w.put(&child.id().to_bytes());
        }
        w.put_u16(node.embedded_children);
        w.put_u16(node.dirty_child_hashes);
        w.put_u8(if node.hash_dirty { FLAG_HASH_DIRTY } else { 0 });
        match self.hash_storage {
            HashStorageLocation::WithNode => w.put(node.hash.as_bytes()),
            HashStorageLocation::WithParent => {
                for hash in &node.child_hashes {
                    w.put(hash.as_bytes());
                }
            }
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<BranchNode, MptError> {
        let mut r = Reader::new(buf);
        let mut node = BranchNode::empty();
        for nibble in 0..16 {
            node.children[nibble] = NodeReference::new(r.take_id()?);
        }
        node.embedded_children = r.take_u16()?;
        node.dirty_child_hashes = r.take_u16()?;
        let flags = r.take_u8()?;
        node.hash_dirty = flags & FLAG_HASH_DIRTY != 0;
        match self.hash_storage {
            HashStorageLocation::WithNode => node.hash = r.take_hash()?,
            HashStorageLocation::WithParent => {
                for nibble in 0..16 {
                    node.child_hashes[nibble] = r.take_hash()?;
                }
            }
        }
        node.dirty = false;
        node.frozen = false;
        Ok(node)
    }
}

impl StockCodec for ExtensionCodec {
    type Item = ExtensionNode;

    fn encoded_size(&self) -> usize {
        // path + child id + flags + hash slot
        Path::PACKED_SIZE + 8 + 1 + 32
    }

    fn encode(&self, node: &ExtensionNode, out: &mut [u8]) {
        let mut w = Writer::new(out);
        w.put(&node.path.to_packed());
        w.put(&node.next.id().to_bytes());
        let mut flags = 0;
        if node.hash_dirty {
            flags |= FLAG_HASH_DIRTY;
        }
        if node.next_embedded {
            flags |= FLAG_CHILD_EMBEDDED;
        }
        if node.next_hash_dirty {
            flags |= FLAG_CHILD_HASH_DIRTY;
        }
        w.put_u8(flags);
        match self.hash_storage {
            HashStorageLocation::WithNode => w.put(node.hash.as_bytes()),
            HashStorageLocation::WithParent => w.put(node.next_hash.as_bytes()),
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<ExtensionNode, MptError> {
        let mut r = Reader::new(buf);
        let packed = r.take::<{ Path::PACKED_SIZE }>()?;
        let path = Path::from_packed(&packed)
            .ok_or_else(|| MptError::corrupt("extension record with invalid path length"))?;
        let next = NodeReference::new(r.take_id()?);
        let flags = r.take_u8()?;
        let hash = r.take_hash()?;

        let mut node = ExtensionNode::new(path, next);
        node.hash_dirty = flags & FLAG_HASH_DIRTY != 0;
        node.next_embedded = flags & FLAG_CHILD_EMBEDDED != 0;
        node.next_hash_dirty = flags & FLAG_CHILD_HASH_DIRTY != 0;
        match self.hash_storage {
            HashStorageLocation::WithNode => node.hash = hash,
            HashStorageLocation::WithParent => node.next_hash = hash,
        }
        node.dirty = false;
        node.frozen = false;
        Ok(node)
    }
}

impl StockCodec for AccountCodec {
    type Item = AccountNode;

    fn encoded_size(&self) -> usize {
        // address + nonce + balance + code hash + storage id + flags + hash slot
        let base = 20 + 8 + 32 + 32 + 8 + 1 + 32;
        if self.track_suffix { base + 1 } else { base }
    }

    fn encode(&self, node: &AccountNode, out: &mut [u8]) {
        let mut w = Writer::new(out);
        w.put(node.address.as_bytes());
        w.put_u64(node.info.nonce);
        w.put(&node.info.balance.to_big_endian());
        w.put(node.info.code_hash.as_bytes());
        w.put(&node.storage.id().to_bytes());
        let mut flags = 0;
        if node.hash_dirty {
            flags |= FLAG_HASH_DIRTY;
        }
        if node.storage_hash_dirty {
            flags |= FLAG_CHILD_HASH_DIRTY;
        }
        w.put_u8(flags);
        match self.hash_storage {
            HashStorageLocation::WithNode => w.put(node.hash.as_bytes()),
            HashStorageLocation::WithParent => w.put(node.storage_hash.as_bytes()),
        }
        if self.track_suffix {
            w.put_u8(node.path_length);
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<AccountNode, MptError> {
        let mut r = Reader::new(buf);
        let address = Address::from(r.take::<20>()?);
        let nonce = r.take_u64()?;
        let balance = U256::from_big_endian(&r.take::<32>()?);
        let code_hash = r.take_hash()?;
        let storage = NodeReference::new(r.take_id()?);
        let flags = r.take_u8()?;
        let hash = r.take_hash()?;
        let path_length = if self.track_suffix { r.take_u8()? } else { 0 };

        let mut node = AccountNode::new(
            address,
            AccountInfo {
                nonce,
                balance,
                code_hash,
            },
            path_length,
        );
        node.storage = storage;
        node.hash_dirty = flags & FLAG_HASH_DIRTY != 0;
        node.storage_hash_dirty = flags & FLAG_CHILD_HASH_DIRTY != 0;
        match self.hash_storage {
            HashStorageLocation::WithNode => node.hash = hash,
            HashStorageLocation::WithParent => node.storage_hash = hash,
        }
        node.dirty = false;
        node.frozen = false;
        Ok(node)
    }
}

impl StockCodec for ValueCodec {
    type Item = ValueNode;

    fn encoded_size(&self) -> usize {
        // key + value + flags
        let mut size = 32 + 32 + 1;
        if matches!(self.hash_storage, HashStorageLocation::WithNode) {
            size += 32;
        }
        if self.track_suffix {
            size += 1;
        }
        size
    }

    fn encode(&self, node: &ValueNode, out: &mut [u8]) {
        let mut w = Writer::new(out);
        w.put(node.key.as_bytes());
        w.put(node.value.as_bytes());
        w.put_u8(if node.hash_dirty { FLAG_HASH_DIRTY } else { 0 });
        if matches!(self.hash_storage, HashStorageLocation::WithNode) {
            w.put(node.hash.as_bytes());
        }
        if self.track_suffix {
            w.put_u8(node.path_length);
        }
    }

    fn decode(&self, buf: &[u8]) -> Result<ValueNode, MptError> {
        let mut r = Reader::new(buf);
        let key = r.take_hash()?;
        let value = r.take_hash()?;
        let flags = r.take_u8()?;
        let hash = if matches!(self.hash_storage, HashStorageLocation::WithNode) {
            r.take_hash()?
        } else {
            H256::zero()
        };
        let path_length = if self.track_suffix { r.take_u8()? } else { 0 };

        let mut node = ValueNode::new(key, value, path_length);
        node.hash_dirty = flags & FLAG_HASH_DIRTY != 0;
        node.hash = hash;
        node.dirty = false;
        node.frozen = false;
        Ok(node)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::NodeKind;
    use crate::types::U256;

    fn codec_config() -> MptConfig {
        MptConfig::S5_LIVE.clone()
    }

    #[test]
    fn branch_round_trip() {
        let config = codec_config();
        let codec = BranchCodec::new(&config);

        let mut node = BranchNode::empty();
        node.children[3] = NodeReference::new(NodeId::new(NodeKind::Value, 17));
        node.children[10] = NodeReference::new(NodeId::new(NodeKind::Branch, 4));
        node.child_hashes[3] = H256::repeat_byte(0xab);
        node.embedded_children = 1 << 3;
        node.dirty_child_hashes = 1 << 10;
        node.hash = H256::repeat_byte(0x11);
        node.hash_dirty = false;

        let mut buf = vec![0u8; codec.encoded_size()];
        codec.encode(&node, &mut buf);
        let decoded = codec.decode(&buf).unwrap();

        assert_eq!(decoded.children[3].id(), node.children[3].id());
        assert_eq!(decoded.children[10].id(), node.children[10].id());
        assert!(decoded.children[0].is_empty());
        assert_eq!(decoded.embedded_children, node.embedded_children);
        assert_eq!(decoded.dirty_child_hashes, node.dirty_child_hashes);
        assert_eq!(decoded.hash, node.hash);
        assert!(!decoded.hash_dirty);
        assert!(!decoded.dirty);
    }

    #[test]
    fn branch_with_parent_hashes_round_trip() {
        let config = MptConfig {
            hash_storage: HashStorageLocation::WithParent,
            ..MptConfig::S5_LIVE
        };
        let codec = BranchCodec::new(&config);

        let mut node = BranchNode::empty();
        node.children[0] = NodeReference::new(NodeId::new(NodeKind::Account, 1));
        node.child_hashes[0] = H256::repeat_byte(0x42);

        let mut buf = vec![0u8; codec.encoded_size()];
        codec.encode(&node, &mut buf);
        let decoded = codec.decode(&buf).unwrap();
        assert_eq!(decoded.child_hashes[0], H256::repeat_byte(0x42));
        assert_eq!(decoded.child_hashes[1], H256::zero());
    }

    #[test]
    fn extension_round_trip() {
        let config = codec_config();
        let codec = ExtensionCodec::new(&config);

        let mut node = ExtensionNode::new(
            Path::from_nibbles(&[1, 2, 3]),
            NodeReference::new(NodeId::new(NodeKind::Branch, 9)),
        );
        node.next_embedded = true;
        node.next_hash_dirty = false;
        node.hash = H256::repeat_byte(7);
        node.hash_dirty = false;

        let mut buf = vec![0u8; codec.encoded_size()];
        codec.encode(&node, &mut buf);
        let decoded = codec.decode(&buf).unwrap();
        assert_eq!(decoded.path, node.path);
        assert_eq!(decoded.next.id(), node.next.id());
        assert!(decoded.next_embedded);
        assert!(!decoded.next_hash_dirty);
        assert_eq!(decoded.hash, node.hash);
    }

    #[test]
    fn account_round_trip_tracks_suffix() {
        let config = codec_config();
        let codec = AccountCodec::new(&config);

        let mut node = AccountNode::new(
            Address::repeat_byte(0x77),
            AccountInfo {
                nonce: 12,
                balance: U256::from(99_999u64),
                code_hash: H256::repeat_byte(0xcc),
            },
            41,
        );
        node.storage = NodeReference::new(NodeId::new(NodeKind::Branch, 2));
        node.hash_dirty = false;
        node.hash = H256::repeat_byte(0x31);

        let mut buf = vec![0u8; codec.encoded_size()];
        codec.encode(&node, &mut buf);
        let decoded = codec.decode(&buf).unwrap();
        assert_eq!(decoded.address, node.address);
        assert_eq!(decoded.info, node.info);
        assert_eq!(decoded.storage.id(), node.storage.id());
        assert_eq!(decoded.path_length, 41);
        assert_eq!(decoded.hash, node.hash);
    }

    #[test]
    fn value_round_trip() {
        let config = codec_config();
        let codec = ValueCodec::new(&config);

        let mut node = ValueNode::new(H256::repeat_byte(1), H256::repeat_byte(2), 63);
        node.hash_dirty = false;
        node.hash = H256::repeat_byte(3);

        let mut buf = vec![0u8; codec.encoded_size()];
        codec.encode(&node, &mut buf);
        let decoded = codec.decode(&buf).unwrap();
        assert_eq!(decoded.key, node.key);
        assert_eq!(decoded.value, node.value);
        assert_eq!(decoded.path_length, 63);
        assert_eq!(decoded.hash, node.hash);
        assert!(!decoded.hash_dirty);
    }

    #[test]
    fn record_sizes_differ_by_hash_location() {
        let with_node = BranchCodec::new(&MptConfig::S5_LIVE);
        let with_parent = BranchCodec::new(&MptConfig {
            hash_storage: HashStorageLocation::WithParent,
            ..MptConfig::S5_LIVE
        });
        assert!(with_parent.encoded_size() > with_node.encoded_size());
    }
}
