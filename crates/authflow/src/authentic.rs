// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The descriptor contract every verifier implements, and the factory that
//! picks a verifier from an algorithm identifier.

use crate::algorithm::AlgorithmId;
use crate::block_hash::BlockHash;
use crate::config::AuthflowConfig;
use crate::engine::CancelPredicate;
use crate::error::Result;
use crate::fetch::Fetch;
use crate::hash::hasher_by_name;
use crate::merkle_tree_hash::MerkleTreeHash;
use crate::readiness::Readiness;
use crate::single_hash::SingleHash;
use crate::stream_utils::{AcceptSink, OutputStream};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Where a descriptor's bytes come from.
#[derive(Clone)]
pub enum ContentSource {
    /// The whole resource is at hand; every hash is computed up front.
    Local(Bytes),

    /// Only the length and a trusted root digest are known. Blocks arrive
    /// through accept-streams, opened either by the caller or by the engine
    /// through `fetch` when a reader finds them missing.
    Remote {
        length: u64,
        root_digest: Bytes,
        fetch: Option<Arc<dyn Fetch>>,
    },
}

impl ContentSource {
    pub fn local(data: impl Into<Bytes>) -> Self {
        ContentSource::Local(data.into())
    }

    pub fn remote(
        length: u64,
        root_digest: impl Into<Bytes>,
        fetch: Option<Arc<dyn Fetch>>,
    ) -> Self {
        ContentSource::Remote {
            length,
            root_digest: root_digest.into(),
            fetch,
        }
    }
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::Local(data) => f.debug_tuple("Local").field(&data.len()).finish(),
            ContentSource::Remote {
                length,
                root_digest,
                fetch,
            } => f
                .debug_struct("Remote")
                .field("length", length)
                .field("root_digest", &hex::encode(root_digest))
                .field("fetch", &fetch.is_some())
                .finish(),
        }
    }
}

/// A resource whose bytes can be verified against a root digest while
/// streaming, in any block-aligned range.
pub trait AuthenticData: Send + Sync {
    fn algorithm(&self) -> AlgorithmId;

    fn length(&self) -> u64;

    fn root_digest(&self) -> Bytes;

    /// Verification units; a whole-resource descriptor has one.
    fn block_count(&self) -> usize;

    fn readiness(&self, block: usize) -> Option<Readiness>;

    fn is_ready(&self, block: usize) -> bool {
        self.readiness(block) == Some(Readiness::Ready)
    }

    /// The smallest range [`AuthenticData::output_stream`] accepts that
    /// covers `[start, end)`.
    fn output_range(&self, start: u64, end: u64) -> (u64, u64);

    /// A sink for the wire encoding of `[start, end)`. Shutting the sink
    /// down reports whether everything written verified.
    fn accept_stream(
        &self,
        start: u64,
        end: u64,
        cancel: Option<CancelPredicate>,
    ) -> Result<AcceptSink>;

    /// The wire encoding of `[start, end)`: data plus the proof material a
    /// downstream verifier needs.
    fn output_stream(&self, start: u64, end: u64) -> Result<OutputStream>;

    /// Exactly the verified bytes `[start, end)`.
    fn plain_output_stream(&self, start: u64, end: u64) -> Result<OutputStream>;
}

pub fn create_authentic_data(
    source: ContentSource,
    algorithm: &AlgorithmId,
) -> Result<Arc<dyn AuthenticData>> {
    create_authentic_data_with_config(source, algorithm, &AuthflowConfig::default())
}

pub fn create_authentic_data_with_config(
    source: ContentSource,
    algorithm: &AlgorithmId,
    config: &AuthflowConfig,
) -> Result<Arc<dyn AuthenticData>> {
    let hasher = hasher_by_name(algorithm.hash_name())?;
    Ok(match algorithm {
        AlgorithmId::Single { .. } => Arc::new(SingleHash::new(source, hasher, config)?),
        AlgorithmId::Block { block_size, .. } => {
            Arc::new(BlockHash::new(source, *block_size, hasher, config)?)
        }
        AlgorithmId::MerkleTree { block_size, .. } => {
            Arc::new(MerkleTreeHash::new(source, *block_size, hasher, config)?)
        }
    })
}
