// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Merkle tree verification over a packed binary tree.
//!
//! Node 1 is the root and node `j` has children `2j` and `2j + 1`. Leaves use
//! segment-tree packing so every internal node has exactly two children for
//! any block count: with `L = ceil(log2 nb)`, `base = 2^(L-1)` and
//! `ext = 2 (nb - base)`, blocks `0..ext` sit on the deepest level at nodes
//! `2^L..2^L + ext` and the rest sit one level up at nodes `nb..2nb - ext`.
//!
//! On the wire each block is followed by the sibling hashes, bottom up, that
//! the receiver has not yet learned in this session. A session starts out
//! knowing only the root.

use crate::algorithm::AlgorithmId;
use crate::authentic::ContentSource;
use crate::config::AuthflowConfig;
use crate::engine::{BlockLayout, CancelPredicate, Scheme, Verifier, check_root};
use crate::error::{AuthflowError, Result};
use crate::hash::{ContentHasher, short_hex};
use crate::readiness::BlockTable;
use crate::stream_utils::BufferedWritable;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type MerkleTreeHash = Verifier<MerkleScheme>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    blocks: usize,
    deep_start: usize,
    deep_leaves: usize,
}

impl TreeShape {
    /// Requires `blocks >= 2`.
    #[must_use]
    pub fn new(blocks: usize) -> Self {
        let level = usize::BITS - (blocks - 1).leading_zeros();
        let deep_start = 1usize << level;
        let base = deep_start / 2;
        Self {
            blocks,
            deep_start,
            deep_leaves: 2 * (blocks - base),
        }
    }

    #[must_use]
    pub fn leaf_node(&self, block: usize) -> usize {
        if block < self.deep_leaves {
            self.deep_start + block
        } else {
            self.blocks + block - self.deep_leaves
        }
    }

    /// Length of a node array indexed by node id.
    #[must_use]
    pub fn node_slots(&self) -> usize {
        self.deep_start + self.deep_leaves + 1
    }

    /// Ids of the internal nodes, children before parents.
    fn internal_nodes_bottom_up(&self) -> impl Iterator<Item = usize> {
        (1..self.blocks).rev()
    }
}

pub struct MerkleScheme {
    hasher: Arc<dyn ContentHasher>,
    root: Bytes,
    shape: TreeShape,
    nodes: Mutex<Vec<Option<Bytes>>>,
}

impl MerkleScheme {
    fn from_blocks(blocks: &[Bytes], hasher: Arc<dyn ContentHasher>) -> Self {
        let shape = TreeShape::new(blocks.len());
        let mut nodes: Vec<Option<Bytes>> = vec![None; shape.node_slots()];
        for (block, data) in blocks.iter().enumerate() {
            nodes[shape.leaf_node(block)] = Some(hasher.hash(&[&data[..]]));
        }
        for j in shape.internal_nodes_bottom_up() {
            let parent = match (&nodes[2 * j], &nodes[2 * j + 1]) {
                (Some(left), Some(right)) => Some(hasher.hash(&[&left[..], &right[..]])),
                _ => None,
            };
            nodes[j] = parent;
        }
        let root = nodes[1].clone().unwrap_or_default();
        Self {
            hasher,
            root,
            shape,
            nodes: Mutex::new(nodes),
        }
    }

    fn from_root(blocks: usize, root: Bytes, hasher: Arc<dyn ContentHasher>) -> Self {
        let shape = TreeShape::new(blocks);
        let mut nodes = vec![None; shape.node_slots()];
        nodes[1] = Some(root.clone());
        Self {
            hasher,
            root,
            shape,
            nodes: Mutex::new(nodes),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, Vec<Option<Bytes>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    /// Cached hash of tree node `node`, if known.
    pub fn node_hash(&self, node: usize) -> Option<Bytes> {
        self.nodes().get(node).cloned().flatten()
    }
}

#[async_trait]
impl Scheme for MerkleScheme {
    /// Node hashes this receiver has learned on the current stream.
    type Session = Vec<Option<Bytes>>;
    /// Nodes whose hashes the peer on this stream already has.
    type Emitter = Vec<bool>;

    fn algorithm(&self, layout: &BlockLayout) -> AlgorithmId {
        AlgorithmId::MerkleTree {
            block_size: layout.block_size(),
            hash: self.hasher.name().to_string(),
        }
    }

    fn root_digest(&self) -> Bytes {
        self.root.clone()
    }

    fn open_session(&self, _layout: &BlockLayout, _first: usize) -> Self::Session {
        let mut known = vec![None; self.shape.node_slots()];
        known[1] = Some(self.root.clone());
        known
    }

    async fn accept_block(
        &self,
        layout: &BlockLayout,
        known: &mut Self::Session,
        block: usize,
        wire: &mut BufferedWritable,
        _cancel: Option<&CancelPredicate>,
    ) -> Result<Bytes> {
        let width = self.hasher.output_len();
        let data = wire.read_exact(layout.block_len(block)).await?;

        let leaf_node = self.shape.leaf_node(block);
        let leaf = self.hasher.hash(&[&data[..]]);
        known[leaf_node] = Some(leaf.clone());
        let mut staged = vec![(leaf_node, leaf)];

        let mut j = leaf_node >> 1;
        while j >= 1 {
            for child in [2 * j, 2 * j + 1] {
                if known[child].is_none() {
                    let sibling = wire.read_exact(width).await?;
                    known[child] = Some(sibling.clone());
                    staged.push((child, sibling));
                }
            }
            let (Some(left), Some(right)) = (&known[2 * j], &known[2 * j + 1]) else {
                return Err(AuthflowError::missing_hash(format!("children of node {j}")));
            };
            let parent = self.hasher.hash(&[&left[..], &right[..]]);
            if let Some(expected) = &known[j] {
                if *expected != parent {
                    return Err(AuthflowError::verification(format!(
                        "tree node {j} hashes to {} but {} was expected (block {block})",
                        short_hex(&parent),
                        short_hex(expected)
                    )));
                }
                break;
            }
            known[j] = Some(parent.clone());
            staged.push((j, parent));
            j >>= 1;
        }

        let mut nodes = self.nodes();
        for (node, hash) in staged {
            nodes[node] = Some(hash);
        }
        Ok(data)
    }

    fn open_emitter(&self, _layout: &BlockLayout, _first: usize) -> Self::Emitter {
        let mut sent = vec![false; self.shape.node_slots()];
        sent[1] = true;
        sent
    }

    fn wrap_block(
        &self,
        _layout: &BlockLayout,
        sent: &mut Self::Emitter,
        block: usize,
        data: &Bytes,
    ) -> Result<Vec<Bytes>> {
        let nodes = self.nodes();
        let mut out = vec![data.clone()];
        let leaf_node = self.shape.leaf_node(block);
        sent[leaf_node] = true;

        let mut j = leaf_node >> 1;
        while j >= 1 {
            for child in [2 * j, 2 * j + 1] {
                if !sent[child] {
                    let hash = nodes[child]
                        .clone()
                        .ok_or_else(|| AuthflowError::missing_hash(format!("tree node {child}")))?;
                    out.push(hash);
                    sent[child] = true;
                }
            }
            if sent[j] {
                break;
            }
            sent[j] = true;
            j >>= 1;
        }
        Ok(out)
    }
}

impl Verifier<MerkleScheme> {
    pub fn new(
        source: ContentSource,
        block_size: u64,
        hasher: Arc<dyn ContentHasher>,
        config: &AuthflowConfig,
    ) -> Result<Self> {
        match source {
            ContentSource::Local(data) => {
                let layout = BlockLayout::multi_block(data.len() as u64, block_size)?;
                let blocks = layout.split(&data);
                let scheme = MerkleScheme::from_blocks(&blocks, hasher);
                Ok(Self::assemble(scheme, layout, BlockTable::ready(blocks), None, config))
            }
            ContentSource::Remote {
                length,
                root_digest,
                fetch,
            } => {
                let layout = BlockLayout::multi_block(length, block_size)?;
                check_root(&root_digest, hasher.as_ref())?;
                let scheme = MerkleScheme::from_root(layout.blocks(), root_digest, hasher);
                let table = BlockTable::unclaimed(layout.blocks());
                Ok(Self::assemble(scheme, layout, table, fetch, config))
            }
        }
    }
}
