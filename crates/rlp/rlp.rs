//! Recursive Length Prefix (RLP) encoding and decoding.
//!
//! RLP is the serialization format the Ethereum-compatible hashing pipeline
//! is defined over: trie nodes, account payloads and leaf values are all
//! RLP items. This crate provides the two core traits plus builder structs
//! for field-by-field work on composite items.
//!
//! - [`encode::RLPEncode`]: types that can be RLP-encoded
//! - [`decode::RLPDecode`]: types that can be RLP-decoded
//! - [`structs::Encoder`] / [`structs::Decoder`]: list builders with
//!   per-field error context

pub mod constants;
pub mod decode;
pub mod encode;
pub mod error;
pub mod structs;
