// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Range-addressable verified streaming.
//!
//! A resource is cut into fixed-size blocks and committed to by a single
//! root digest, either through a suffix-hash chain ([`BlockHash`]) or a
//! packed Merkle tree ([`MerkleTreeHash`]); [`SingleHash`] is the degenerate
//! one-block case. A descriptor built from local bytes serves any
//! block-aligned range together with the proof material a downstream
//! verifier needs. A descriptor built from a length and a trusted root
//! accepts such streams, verifies them block by block, and serves plain
//! bytes to readers, fetching missing blocks on demand.

mod algorithm;
mod authentic;
mod block_hash;
mod config;
mod engine;
mod error;
mod fetch;
mod hash;
mod merkle_tree_hash;
mod range;
mod readiness;
mod single_hash;
mod stream_utils;

pub mod testing;

pub use algorithm::AlgorithmId;
pub use authentic::{
    AuthenticData, ContentSource, create_authentic_data, create_authentic_data_with_config,
};
pub use block_hash::{BlockHash, ChainScheme};
pub use config::AuthflowConfig;
pub use engine::{BlockLayout, CancelPredicate, Engine, Scheme, Verifier};
pub use error::{AuthflowError, Result};
pub use fetch::{ByteSource, Fetch, TimeoutFetch};
pub use hash::{ContentHasher, Sha2Hasher, hasher_by_name};
pub use merkle_tree_hash::{MerkleScheme, MerkleTreeHash, TreeShape};
pub use range::{RequestedRange, parse_auth_range, parse_http_range};
pub use readiness::{BlockTable, Readiness};
pub use single_hash::{SingleHash, SingleScheme};
pub use stream_utils::{
    AcceptSink, BufferedReadable, BufferedWritable, OutputStream, accept_channel, output_channel,
    pump,
};
