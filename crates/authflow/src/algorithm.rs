// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Algorithm identifiers as carried by the signed response headers:
//! `single,<hash>`, `block,<blockSize>,<hash>` and
//! `merkle-tree,<blockSize>,<hash>`.

use crate::error::AuthflowError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmId {
    Single { hash: String },
    Block { block_size: u64, hash: String },
    MerkleTree { block_size: u64, hash: String },
}

impl AlgorithmId {
    #[must_use]
    pub fn hash_name(&self) -> &str {
        match self {
            AlgorithmId::Single { hash }
            | AlgorithmId::Block { hash, .. }
            | AlgorithmId::MerkleTree { hash, .. } => hash,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> Option<u64> {
        match self {
            AlgorithmId::Single { .. } => None,
            AlgorithmId::Block { block_size, .. } | AlgorithmId::MerkleTree { block_size, .. } => {
                Some(*block_size)
            }
        }
    }
}

fn parse_block_size(raw: &str, id: &str) -> Result<u64, AuthflowError> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(AuthflowError::UnsupportedAlgorithm(format!(
            "bad block size {raw:?} in {id:?}"
        ))),
        Ok(bs) => Ok(bs),
    }
}

impl FromStr for AlgorithmId {
    type Err = AuthflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        match parts.as_slice() {
            ["single", hash] if !hash.is_empty() => Ok(AlgorithmId::Single {
                hash: (*hash).to_string(),
            }),
            ["block", bs, hash] if !hash.is_empty() => Ok(AlgorithmId::Block {
                block_size: parse_block_size(bs, s)?,
                hash: (*hash).to_string(),
            }),
            ["merkle-tree", bs, hash] if !hash.is_empty() => Ok(AlgorithmId::MerkleTree {
                block_size: parse_block_size(bs, s)?,
                hash: (*hash).to_string(),
            }),
            _ => Err(AuthflowError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmId::Single { hash } => write!(f, "single,{hash}"),
            AlgorithmId::Block { block_size, hash } => write!(f, "block,{block_size},{hash}"),
            AlgorithmId::MerkleTree { block_size, hash } => {
                write!(f, "merkle-tree,{block_size},{hash}")
            }
        }
    }
}
