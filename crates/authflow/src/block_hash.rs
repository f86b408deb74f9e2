// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Chained block verification.
//!
//! Blocks are committed to by a suffix-hash chain folded right to left:
//! `suffix[nb-1] = H(block[nb-1])`, `suffix[i] = H(leaf[i] || suffix[i+1])`
//! with `leaf[i] = H(block[i])`, and the root digest is `suffix[0]`.
//!
//! A stream covering blocks `[start, end)` carries, on the wire:
//!
//! ```text
//! leaf[0] .. leaf[start-1]             boot hashes, only when start > 0
//! for i in start..end:
//!     block[i]
//!     suffix[i+1]                      omitted after the final block
//! ```
//!
//! The boot hashes let a receiver that starts mid-resource fold the chain
//! back to the root before trusting anything.

use crate::algorithm::AlgorithmId;
use crate::authentic::ContentSource;
use crate::config::AuthflowConfig;
use crate::engine::{
    BlockLayout, CancelPredicate, Scheme, Verifier, check_root, is_cancelled,
};
use crate::error::{AuthflowError, Result};
use crate::hash::{ContentHasher, short_hex};
use crate::readiness::BlockTable;
use crate::stream_utils::BufferedWritable;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type BlockHash = Verifier<ChainScheme>;

struct ChainHashes {
    leaves: Vec<Option<Bytes>>,
    suffixes: Vec<Option<Bytes>>,
}

pub struct ChainScheme {
    hasher: Arc<dyn ContentHasher>,
    root: Bytes,
    hashes: Mutex<ChainHashes>,
}

pub struct ChainSession {
    first: usize,
    /// `suffix[i]` for the block about to be read, as delivered after the
    /// previous block.
    expected: Option<Bytes>,
}

impl ChainScheme {
    fn from_blocks(blocks: &[Bytes], hasher: Arc<dyn ContentHasher>) -> Self {
        let leaves: Vec<Bytes> = blocks.iter().map(|b| hasher.hash(&[&b[..]])).collect();
        let mut suffixes = leaves.clone();
        for i in (0..suffixes.len().saturating_sub(1)).rev() {
            suffixes[i] = hasher.hash(&[&leaves[i][..], &suffixes[i + 1][..]]);
        }
        let root = suffixes.first().cloned().unwrap_or_default();
        Self {
            hasher,
            root,
            hashes: Mutex::new(ChainHashes {
                leaves: leaves.into_iter().map(Some).collect(),
                suffixes: suffixes.into_iter().map(Some).collect(),
            }),
        }
    }

    fn from_root(blocks: usize, root: Bytes, hasher: Arc<dyn ContentHasher>) -> Self {
        let mut suffixes = vec![None; blocks];
        suffixes[0] = Some(root.clone());
        Self {
            hasher,
            root,
            hashes: Mutex::new(ChainHashes {
                leaves: vec![None; blocks],
                suffixes,
            }),
        }
    }

    fn hashes(&self) -> MutexGuard<'_, ChainHashes> {
        self.hashes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Known leaf hash of `block`, if any.
    pub fn leaf_hash(&self, block: usize) -> Option<Bytes> {
        self.hashes().leaves.get(block).cloned().flatten()
    }

    /// Known suffix hash of `block`, if any.
    pub fn suffix_hash(&self, block: usize) -> Option<Bytes> {
        self.hashes().suffixes.get(block).cloned().flatten()
    }

    fn link(&self, leaf: &Bytes, next: Option<&Bytes>) -> Bytes {
        match next {
            Some(next) => self.hasher.hash(&[&leaf[..], &next[..]]),
            None => leaf.clone(),
        }
    }
}

#[async_trait]
impl Scheme for ChainScheme {
    type Session = ChainSession;
    type Emitter = usize;

    fn algorithm(&self, layout: &BlockLayout) -> AlgorithmId {
        AlgorithmId::Block {
            block_size: layout.block_size(),
            hash: self.hasher.name().to_string(),
        }
    }

    fn root_digest(&self) -> Bytes {
        self.root.clone()
    }

    fn open_session(&self, _layout: &BlockLayout, first: usize) -> ChainSession {
        ChainSession {
            first,
            expected: None,
        }
    }

    async fn accept_block(
        &self,
        layout: &BlockLayout,
        session: &mut ChainSession,
        block: usize,
        wire: &mut BufferedWritable,
        cancel: Option<&CancelPredicate>,
    ) -> Result<Bytes> {
        let width = self.hasher.output_len();
        let booting = block == session.first;

        let mut boot = Vec::new();
        if booting {
            for _ in 0..block {
                boot.push(wire.read_exact(width).await?);
                if is_cancelled(cancel) {
                    return Err(AuthflowError::Cancelled);
                }
            }
        }
        let data = wire.read_exact(layout.block_len(block)).await?;
        let leaf = self.hasher.hash(&[&data[..]]);
        let next = if layout.is_last(block) {
            None
        } else {
            Some(wire.read_exact(width).await?)
        };
        let suffix = self.link(&leaf, next.as_ref());

        if booting {
            // Fold back to block 0; chain[k] ends up as suffix[block - k].
            let mut chain = vec![suffix];
            for boot_leaf in boot.iter().rev() {
                let below = chain.last().cloned().unwrap_or_default();
                chain.push(self.link(boot_leaf, Some(&below)));
            }
            chain.reverse();
            let folded = chain.first().cloned().unwrap_or_default();
            if folded != self.root {
                return Err(AuthflowError::verification(format!(
                    "chain from block {block} folds to {} but the root is {}",
                    short_hex(&folded),
                    short_hex(&self.root)
                )));
            }

            let mut hashes = self.hashes();
            for (j, boot_leaf) in boot.into_iter().enumerate() {
                hashes.leaves[j] = Some(boot_leaf);
            }
            for (j, suffix) in chain.into_iter().enumerate() {
                hashes.suffixes[j] = Some(suffix);
            }
        } else {
            let expected = session
                .expected
                .take()
                .ok_or_else(|| {
                    AuthflowError::missing_hash(format!("suffix hash of block {block}"))
                })?;
            if suffix != expected {
                return Err(AuthflowError::verification(format!(
                    "suffix hash of block {block} is {} but {} was committed",
                    short_hex(&suffix),
                    short_hex(&expected)
                )));
            }
        }

        let mut hashes = self.hashes();
        hashes.leaves[block] = Some(leaf);
        if let Some(next) = &next {
            hashes.suffixes[block + 1] = Some(next.clone());
        }
        drop(hashes);

        session.expected = next;
        Ok(data)
    }

    fn open_emitter(&self, _layout: &BlockLayout, first: usize) -> usize {
        first
    }

    fn wrap_block(
        &self,
        layout: &BlockLayout,
        first: &mut usize,
        block: usize,
        data: &Bytes,
    ) -> Result<Vec<Bytes>> {
        let hashes = self.hashes();
        let mut out = Vec::with_capacity(2);
        if block == *first {
            for j in 0..block {
                let leaf = hashes.leaves[j]
                    .clone()
                    .ok_or_else(|| AuthflowError::missing_hash(format!("leaf hash of block {j}")))?;
                out.push(leaf);
            }
        }
        out.push(data.clone());
        if !layout.is_last(block) {
            let next = hashes.suffixes[block + 1].clone().ok_or_else(|| {
                AuthflowError::missing_hash(format!("suffix hash of block {}", block + 1))
            })?;
            out.push(next);
        }
        Ok(out)
    }
}

impl Verifier<ChainScheme> {
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
                let scheme = ChainScheme::from_blocks(&blocks, hasher);
                Ok(Self::assemble(scheme, layout, BlockTable::ready(blocks), None, config))
            }
            ContentSource::Remote {
                length,
                root_digest,
                fetch,
            } => {
                let layout = BlockLayout::multi_block(length, block_size)?;
                check_root(&root_digest, hasher.as_ref())?;
                let scheme = ChainScheme::from_root(layout.blocks(), root_digest, hasher);
                let table = BlockTable::unclaimed(layout.blocks());
                Ok(Self::assemble(scheme, layout, table, fetch, config))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authentic::AuthenticData;
    use crate::hash::Sha2Hasher;
    use crate::testing::StubHasher;
    use tokio::io::AsyncWriteExt;

    fn stub() -> Arc<dyn ContentHasher> {
        Arc::new(StubHasher)
    }

    #[test]
    fn test_stub_chain_matches_hand_fold() {
        // Leaves of "ABCD", "EFGH", "IJ" under the byte-sum hash.
        let (a, b, c) = (266 % 251, 282 % 251, 147u32);
        let s2 = c;
        let s1 = (b + s2) % 251;
        let s0 = (a + s1) % 251;

        let bh = BlockHash::new(
            ContentSource::local(&b"ABCDEFGHIJ"[..]),
            4,
            stub(),
            &AuthflowConfig::default(),
        )
        .unwrap();
        let scheme = bh.scheme();
        assert_eq!(scheme.leaf_hash(0).unwrap()[..], [a as u8]);
        assert_eq!(scheme.leaf_hash(1).unwrap()[..], [b as u8]);
        assert_eq!(scheme.leaf_hash(2).unwrap()[..], [c as u8]);
        assert_eq!(scheme.suffix_hash(2).unwrap()[..], [s2 as u8]);
        assert_eq!(scheme.suffix_hash(1).unwrap()[..], [s1 as u8]);
        assert_eq!(bh.root_digest()[..], [s0 as u8]);
    }

    #[test]
    fn test_sha256_root_is_right_fold() {
        let data = Bytes::from((0..100u8).collect::<Vec<_>>());
        let hasher = Sha2Hasher::Sha256;
        let bh = BlockHash::new(
            ContentSource::local(data.clone()),
            32,
            Arc::new(hasher),
            &AuthflowConfig::default(),
        )
        .unwrap();

        let mut acc: Option<Bytes> = None;
        for chunk in data.chunks(32).rev() {
            let leaf = hasher.hash(&[chunk]);
            acc = Some(match acc {
                None => leaf,
                Some(next) => hasher.hash(&[&leaf[..], &next[..]]),
            });
        }
        assert_eq!(Some(bh.root_digest()), acc);
    }

    #[tokio::test]
    async fn test_boot_hashes_let_stream_start_mid_chain() {
        let local = BlockHash::new(
            ContentSource::local(&b"ABCDEFGHIJ"[..]),
            4,
            stub(),
            &AuthflowConfig::default(),
        )
        .unwrap();
        let root = local.root_digest();
        let remote = BlockHash::new(
            ContentSource::remote(10, root, None),
            4,
            stub(),
            &AuthflowConfig::default(),
        )
        .unwrap();

        let wire = local.output_stream(4, 10).unwrap().read_all().await.unwrap();
        // One boot hash, block 1, suffix[2], block 2.
        assert_eq!(wire.len(), 1 + 4 + 1 + 2);

        let mut sink = remote.accept_stream(4, 10, None).unwrap();
        sink.write_all(&wire).await.unwrap();
        sink.finish().await.unwrap();

        assert!(!remote.is_ready(0));
        assert!(remote.is_ready(1));
        assert!(remote.is_ready(2));
        assert_eq!(remote.scheme().leaf_hash(0), local.scheme().leaf_hash(0));
        assert_eq!(remote.scheme().suffix_hash(1), local.scheme().suffix_hash(1));
    }

    #[tokio::test]
    async fn test_wrong_boot_hash_rejected() {
        let local = BlockHash::new(
            ContentSource::local(&b"ABCDEFGHIJ"[..]),
            4,
            stub(),
            &AuthflowConfig::default(),
        )
        .unwrap();
        let remote = BlockHash::new(
            ContentSource::remote(10, local.root_digest(), None),
            4,
            stub(),
            &AuthflowConfig::default(),
        )
        .unwrap();

        let mut wire = local.output_stream(4, 10).unwrap().read_all().await.unwrap().to_vec();
        wire[0] = wire[0].wrapping_add(1);

        let mut sink = remote.accept_stream(4, 10, None).unwrap();
        // The stream may fail before every byte is written.
        _ = sink.write_all(&wire).await;
        assert!(matches!(
            sink.finish().await,
            Err(AuthflowError::Verification { .. })
        ));
        assert!(!remote.is_ready(1));
        // The failed claim was released.
        drop(remote.accept_stream(4, 10, None).unwrap());
    }

    #[tokio::test]
    async fn test_cancel_between_boot_hashes() {
        use crate::readiness::Readiness;
        use std::sync::atomic::{AtomicBool, Ordering};

        let local = BlockHash::new(
            ContentSource::local(&b"ABCDEFGHIJ"[..]),
            4,
            stub(),
            &AuthflowConfig::default(),
        )
        .unwrap();
        let remote = BlockHash::new(
            ContentSource::remote(10, local.root_digest(), None),
            4,
            stub(),
            &AuthflowConfig::default(),
        )
        .unwrap();
        let wire = local.output_stream(8, 10).unwrap().read_all().await.unwrap();
        // Two boot hashes, then block 2.
        assert_eq!(wire.len(), 2 + 2);

        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let cancel: CancelPredicate = Arc::new(move || flag.load(Ordering::Acquire));
        let mut sink = remote.accept_stream(8, 10, Some(cancel)).unwrap();
        assert_eq!(remote.readiness(2), Some(Readiness::Pending));
        stop.store(true, Ordering::Release);

        _ = sink.write_all(&wire).await;
        assert_eq!(sink.finish().await, Err(AuthflowError::Cancelled));
        assert_eq!(remote.readiness(2), Some(Readiness::Unclaimed));
        assert_eq!(remote.scheme().leaf_hash(0), None);
        assert_eq!(remote.scheme().leaf_hash(2), None);
    }
}
