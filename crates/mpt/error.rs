use std::path::PathBuf;
use std::sync::Arc;

use ethereum_types::H256;
use sylva_rlp::error::RLPDecodeError;
use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// The enum is `Clone` because the archive keeps its first error sticky and
/// returns it on every subsequent call; non-clonable sources are wrapped in
/// `Arc`.
#[derive(Debug, Error, Clone)]
pub enum MptError {
    #[error("directory {0:?} is locked by another process")]
    LockHeld(PathBuf),
    #[error("directory {0:?} was not cleanly closed, restore it first")]
    DirtyDirectory(PathBuf),
    #[error("format mismatch: {0}")]
    FormatMismatch(String),
    #[error("corrupted state: {0}")]
    Corrupt(String),
    #[error("code for hash {0:#x} is not in the code store")]
    MissingCode(H256),
    #[error("code stored for hash {0:#x} does not hash to it")]
    BadCodeHash(H256),
    #[error("invalid block {block}: {reason}")]
    InvalidBlock { block: u64, reason: String },
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("metadata error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for MptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for MptError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl MptError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub(crate) fn invalid_block(block: u64, reason: impl Into<String>) -> Self {
        Self::InvalidBlock {
            block,
            reason: reason.into(),
        }
    }
}
