use std::time::Duration;

/// Hash scheme used for the whole forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// Keccak over a tagged binary encoding; `Empty` hashes to all zeros.
    Direct,
    /// Yellow-Paper RLP hashing, bit-compatible with Ethereum state tries.
    EthereumLike,
}

/// Where clean hashes are persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashStorageLocation {
    /// Every node record carries its own hash.
    WithNode,
    /// Parents carry the hashes of their children.
    WithParent,
}

/// Write discipline of a forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// Nodes are updated in place; released nodes are reused.
    Mutable,
    /// Nodes loaded from disk arrive frozen; mutating a frozen node copies
    /// it, leaving the original reachable from older roots.
    Immutable,
}

impl StorageMode {
    pub fn is_immutable(self) -> bool {
        matches!(self, StorageMode::Immutable)
    }
}

/// Static description of a trie format. The four canonical presets are
/// [`MptConfig::S4_LIVE`], [`MptConfig::S4_ARCHIVE`], [`MptConfig::S5_LIVE`]
/// and [`MptConfig::S5_ARCHIVE`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MptConfig {
    pub name: &'static str,
    /// Derive trie paths from the keccak of addresses/keys instead of their
    /// raw bytes.
    pub use_hashed_paths: bool,
    /// Persist the residual path length in leaf records.
    pub track_suffix_lengths: bool,
    pub hashing: HashAlgorithm,
    pub hash_storage: HashStorageLocation,
    pub mode: StorageMode,
}

impl MptConfig {
    pub const S4_LIVE: MptConfig = MptConfig {
        name: "S4-Live",
        use_hashed_paths: false,
        track_suffix_lengths: false,
        hashing: HashAlgorithm::Direct,
        hash_storage: HashStorageLocation::WithNode,
        mode: StorageMode::Mutable,
    };

    pub const S4_ARCHIVE: MptConfig = MptConfig {
        name: "S4-Archive",
        use_hashed_paths: false,
        track_suffix_lengths: false,
        hashing: HashAlgorithm::Direct,
        hash_storage: HashStorageLocation::WithNode,
        mode: StorageMode::Immutable,
    };

    pub const S5_LIVE: MptConfig = MptConfig {
        name: "S5-Live",
        use_hashed_paths: true,
        track_suffix_lengths: true,
        hashing: HashAlgorithm::EthereumLike,
        hash_storage: HashStorageLocation::WithNode,
        mode: StorageMode::Mutable,
    };

    pub const S5_ARCHIVE: MptConfig = MptConfig {
        name: "S5-Archive",
        use_hashed_paths: true,
        track_suffix_lengths: true,
        hashing: HashAlgorithm::EthereumLike,
        hash_storage: HashStorageLocation::WithNode,
        mode: StorageMode::Immutable,
    };

    pub fn by_name(name: &str) -> Option<&'static MptConfig> {
        match name {
            "S4-Live" => Some(&Self::S4_LIVE),
            "S4-Archive" => Some(&Self::S4_ARCHIVE),
            "S5-Live" => Some(&Self::S5_LIVE),
            "S5-Archive" => Some(&Self::S5_ARCHIVE),
            _ => None,
        }
    }
}

/// Sizing of the in-memory node cache and its background workers.
#[derive(Clone, Debug)]
pub struct NodeCacheConfig {
    /// Number of node cells kept in memory. Values below
    /// [`NodeCacheConfig::MIN_CAPACITY`] are raised to it, so the working
    /// set of one in-flight update never reaches eviction.
    pub capacity: usize,
    /// Interval between background write-buffer drains; `None` disables the
    /// flusher.
    pub background_flush_period: Option<Duration>,
    /// Queue length above which an eviction triggers an asynchronous drain.
    pub write_buffer_capacity: usize,
}

impl NodeCacheConfig {
    pub const MIN_CAPACITY: usize = 2_000;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000_000,
            background_flush_period: Some(Duration::from_secs(5)),
            write_buffer_capacity: 1024,
        }
    }
}

/// Checkpoint scheduling of an archive.
#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    /// Create a checkpoint whenever the block height crosses a multiple of
    /// this interval.
    pub checkpoint_interval: u64,
    /// Create a checkpoint when this much wall time passed since the last
    /// one, regardless of block count.
    pub checkpoint_period: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 1_000_000,
            checkpoint_period: Duration::from_secs(600),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn presets_are_resolvable_by_name() {
        for cfg in [
            &MptConfig::S4_LIVE,
            &MptConfig::S4_ARCHIVE,
            &MptConfig::S5_LIVE,
            &MptConfig::S5_ARCHIVE,
        ] {
            assert_eq!(MptConfig::by_name(cfg.name), Some(cfg));
        }
        assert_eq!(MptConfig::by_name("S6-Live"), None);
    }

    #[test]
    fn archive_presets_are_immutable() {
        assert!(MptConfig::S4_ARCHIVE.mode.is_immutable());
        assert!(MptConfig::S5_ARCHIVE.mode.is_immutable());
        assert!(!MptConfig::S5_LIVE.mode.is_immutable());
    }
}
