//! A persistent Merkle-Patricia-Trie storage engine for Ethereum-style
//! world state.
//!
//! The engine maintains a live state of accounts and per-account storage
//! slots, computes cryptographic root hashes over that state and can retain
//! every historical block's state as an immutable archive, all backed by
//! files on local disk.
//!
//! The central abstraction is the [`Forest`]: many trie versions multiplexed
//! over four typed node stocks, a shared node cache and an asynchronous
//! write buffer. [`MptState`] is the mutable façade over the current state;
//! [`ArchiveTrie`] appends one frozen state per block and checkpoints the
//! whole directory for crash recovery.

pub mod config;
pub mod error;
pub mod path;
pub mod types;
pub mod update;

mod archive;
mod cache;
mod cell;
mod checkpoint;
mod code_store;
mod dirlock;
mod forest;
mod hasher;
mod live;
mod node;
mod state;
mod stock;
mod verify;
mod write_buffer;

pub use archive::{AccountDiff, ArchiveTrie, Diff};
pub use checkpoint::{Checkpoint, CheckpointParticipant};
pub use config::{
    ArchiveConfig, HashAlgorithm, HashStorageLocation, MptConfig, NodeCacheConfig, StorageMode,
};
pub use error::MptError;
pub use forest::{Forest, NodeVisitor, VisitResponse, dump_trie};
pub use hasher::{EMPTY_TRIE_HASH, NodeHashes, NodePath};
pub use live::LiveTrie;
pub use node::{Node, NodeId, NodeKind, NodeReference};
pub use path::Path;
pub use state::MptState;
pub use types::{AccountInfo, Address, EMPTY_CODE_HASH, Key, U256, Value};
pub use update::Update;
pub use verify::{VerificationObserver, verify_directory};
