use ethereum_types::H256;
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};

pub use ethereum_types::{Address, U256};

/// A storage slot key.
pub type Key = H256;
/// A storage slot value; all-zero means absent.
pub type Value = H256;

lazy_static! {
    /// keccak of the empty byte string, the code hash of accounts without code.
    pub static ref EMPTY_CODE_HASH: H256 =
        H256::from_slice(Keccak256::digest([]).as_slice());
}

pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(Keccak256::digest(data).as_slice())
}

/// The account payload stored in the trie.
///
/// An all-zero info marks an absent account; writing it deletes the account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub nonce: u64,
    pub balance: U256,
    /// keccak of the contract code; zero for accounts without code (the
    /// hashing pipeline substitutes the empty-code hash).
    pub code_hash: H256,
}

impl AccountInfo {
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash.is_zero()
    }
}
