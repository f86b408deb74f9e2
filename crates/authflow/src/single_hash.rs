// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Whole-resource verification: one block, one hash, no proof material.
//! The wire encoding is the plain bytes, and only the full range can be
//! accepted or emitted.

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
use std::sync::Arc;

pub type SingleHash = Verifier<SingleScheme>;

pub struct SingleScheme {
    hasher: Arc<dyn ContentHasher>,
    root: Bytes,
}

fn require_full(what: &str, layout: &BlockLayout, start: u64, end: u64) -> Result<()> {
    if start != 0 || end != layout.length() {
        return Err(AuthflowError::range(format!(
            "single hash only supports the full range 0-{}, not {what} {start}-{end}",
            layout.length()
        )));
    }
    Ok(())
}

#[async_trait]
impl Scheme for SingleScheme {
    type Session = ();
    type Emitter = ();

    fn algorithm(&self, _layout: &BlockLayout) -> AlgorithmId {
        AlgorithmId::Single {
            hash: self.hasher.name().to_string(),
        }
    }

    fn root_digest(&self) -> Bytes {
        self.root.clone()
    }

    fn check_accept(&self, layout: &BlockLayout, start: u64, end: u64) -> Result<()> {
        require_full("accept", layout, start, end)
    }

    fn check_output(&self, layout: &BlockLayout, start: u64, end: u64) -> Result<()> {
        require_full("output", layout, start, end)
    }

    fn open_session(&self, _layout: &BlockLayout, _first: usize) {}

    async fn accept_block(
        &self,
        layout: &BlockLayout,
        _session: &mut (),
        block: usize,
        wire: &mut BufferedWritable,
        _cancel: Option<&CancelPredicate>,
    ) -> Result<Bytes> {
        let data = wire.read_exact(layout.block_len(block)).await?;
        let digest = self.hasher.hash(&[&data[..]]);
        if digest != self.root {
            return Err(AuthflowError::verification(format!(
                "content hashes to {} but the root is {}",
                short_hex(&digest),
                short_hex(&self.root)
            )));
        }
        Ok(data)
    }

    fn open_emitter(&self, _layout: &BlockLayout, _first: usize) {}

    fn wrap_block(
        &self,
        _layout: &BlockLayout,
        _emitter: &mut (),
        _block: usize,
        data: &Bytes,
    ) -> Result<Vec<Bytes>> {
        Ok(vec![data.clone()])
    }
}

impl Verifier<SingleScheme> {
    pub fn new(
        source: ContentSource,
        hasher: Arc<dyn ContentHasher>,
        config: &AuthflowConfig,
    ) -> Result<Self> {
        match source {
            ContentSource::Local(data) => {
                let layout = BlockLayout::whole(data.len() as u64);
                let root = hasher.hash(&[&data[..]]);
                let scheme = SingleScheme { hasher, root };
                Ok(Self::assemble(scheme, layout, BlockTable::ready(vec![data]), None, config))
            }
            ContentSource::Remote {
                length,
                root_digest,
                fetch,
            } => {
                check_root(&root_digest, hasher.as_ref())?;
                let scheme = SingleScheme {
                    hasher,
                    root: root_digest,
                };
                Ok(Self::assemble(
                    scheme,
                    BlockLayout::whole(length),
                    BlockTable::unclaimed(1),
                    fetch,
                    config,
                ))
            }
        }
    }
}
