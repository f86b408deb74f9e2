// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The block engine behind every verifier.
//!
//! A [`Scheme`] knows how one block's data and proof material look on the
//! wire and how to check them. The [`Engine`] owns everything else: the block
//! layout, the readiness table, the claim and revert discipline, the
//! cooperative cancellation predicate, and fetch coalescing for readers that
//! find blocks missing.

use crate::algorithm::AlgorithmId;
use crate::authentic::AuthenticData;
use crate::config::AuthflowConfig;
use crate::error::{AuthflowError, Result};
use crate::fetch::{Fetch, TimeoutFetch};
use crate::hash::ContentHasher;
use crate::readiness::{BlockTable, Lookup, Readiness};
use crate::stream_utils::{
    AcceptSink, BufferedReadable, BufferedWritable, OutputStream, accept_channel, output_channel,
    pump,
};
use async_trait::async_trait;
use bytes::Bytes;
use diagnostics::*;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Polled once per block by an accept-stream; `true` stops the stream with
/// [`AuthflowError::Cancelled`].
pub type CancelPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

pub(crate) fn is_cancelled(cancel: Option<&CancelPredicate>) -> bool {
    cancel.is_some_and(|cancel| cancel())
}

/// How a resource of `length` bytes is cut into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    length: u64,
    block_size: u64,
    blocks: usize,
}

impl BlockLayout {
    /// A layout of at least two `block_size` blocks, as the chained and tree
    /// verifiers require.
    pub fn multi_block(length: u64, block_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(AuthflowError::InvalidDescriptor(
                "block size must be positive".to_string(),
            ));
        }
        let blocks = usize::try_from(length.div_ceil(block_size)).map_err(|_| {
            AuthflowError::InvalidDescriptor(format!("{length} bytes is too many blocks"))
        })?;
        if blocks < 2 {
            return Err(AuthflowError::InvalidDescriptor(format!(
                "{length} bytes in blocks of {block_size} is fewer than two blocks; use single"
            )));
        }
        Ok(Self {
            length,
            block_size,
            blocks,
        })
    }

    /// The whole resource as one block.
    #[must_use]
    pub fn whole(length: u64) -> Self {
        Self {
            length,
            block_size: length.max(1),
            blocks: 1,
        }
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    #[must_use]
    pub fn is_last(&self, block: usize) -> bool {
        block + 1 == self.blocks
    }

    #[must_use]
    pub fn block_start(&self, block: usize) -> u64 {
        (block as u64 * self.block_size).min(self.length)
    }

    #[must_use]
    pub fn block_end(&self, block: usize) -> u64 {
        ((block as u64 + 1) * self.block_size).min(self.length)
    }

    /// Bytes in `block`; only the final block may be short.
    #[must_use]
    pub fn block_len(&self, block: usize) -> usize {
        (self.block_end(block) - self.block_start(block)) as usize
    }

    fn is_boundary(&self, offset: u64) -> bool {
        offset % self.block_size == 0 || offset == self.length
    }

    /// Blocks overlapping `[start, end)`.
    fn covering(&self, start: u64, end: u64) -> Range<usize> {
        if start >= end {
            return 0..0;
        }
        let first = (start / self.block_size) as usize;
        let last = end.div_ceil(self.block_size) as usize;
        first..last.min(self.blocks)
    }

    /// Round `[start, end)` outward to block boundaries, clipped to
    /// `[0, length]`.
    #[must_use]
    pub fn output_range(&self, start: u64, end: u64) -> (u64, u64) {
        let end = end.min(self.length);
        let start = start.min(end);
        let bs = self.block_size;
        let lo = start - start % bs;
        let hi = end.div_ceil(bs).saturating_mul(bs).min(self.length);
        (lo, hi)
    }

    fn check_bounds(&self, what: &str, start: u64, end: u64) -> Result<()> {
        if start > end || end > self.length {
            return Err(AuthflowError::range(format!(
                "{what} range {start}-{end} invalid for length {}",
                self.length
            )));
        }
        Ok(())
    }

    fn check_aligned(&self, what: &str, start: u64, end: u64) -> Result<()> {
        self.check_bounds(what, start, end)?;
        if !self.is_boundary(start) || !self.is_boundary(end) {
            return Err(AuthflowError::range(format!(
                "{what} range {start}-{end} is not aligned to {}-byte blocks",
                self.block_size
            )));
        }
        Ok(())
    }

    /// Slice the resource into owned per-block buffers without copying.
    pub(crate) fn split(&self, data: &Bytes) -> Vec<Bytes> {
        (0..self.blocks)
            .map(|block| {
                data.slice(self.block_start(block) as usize..self.block_end(block) as usize)
            })
            .collect()
    }
}

/// Reject a root digest whose width does not match the hash that will be
/// compared against it.
pub(crate) fn check_root(root: &Bytes, hasher: &dyn ContentHasher) -> Result<()> {
    if root.len() != hasher.output_len() {
        return Err(AuthflowError::InvalidDescriptor(format!(
            "root digest is {} bytes but {} produces {}",
            root.len(),
            hasher.name(),
            hasher.output_len()
        )));
    }
    Ok(())
}

/// The wire layout and verification rule of one commitment scheme.
#[async_trait]
pub trait Scheme: Send + Sync + 'static {
    /// Verifier state carried from block to block of one accept-stream.
    type Session: Send;

    /// Record of the proof material one output stream has already emitted.
    type Emitter: Send;

    fn algorithm(&self, layout: &BlockLayout) -> AlgorithmId;

    fn root_digest(&self) -> Bytes;

    /// Scheme-specific restrictions on accept ranges, beyond alignment.
    fn check_accept(&self, _layout: &BlockLayout, _start: u64, _end: u64) -> Result<()> {
        Ok(())
    }

    /// Scheme-specific restrictions on wrapped output ranges, beyond alignment.
    fn check_output(&self, _layout: &BlockLayout, _start: u64, _end: u64) -> Result<()> {
        Ok(())
    }

    fn open_session(&self, layout: &BlockLayout, first: usize) -> Self::Session;

    /// Read `block`'s data and whatever proof material precedes or follows
    /// it, verify, and commit newly learned hashes. Returns the block's data.
    ///
    /// `cancel` may be polled between reads that come before anything is
    /// committed.
    async fn accept_block(
        &self,
        layout: &BlockLayout,
        session: &mut Self::Session,
        block: usize,
        wire: &mut BufferedWritable,
        cancel: Option<&CancelPredicate>,
    ) -> Result<Bytes>;

    fn open_emitter(&self, layout: &BlockLayout, first: usize) -> Self::Emitter;

    /// The wire chunks for a verified block: its data plus the proof
    /// material a receiver in the same session does not have yet.
    fn wrap_block(
        &self,
        layout: &BlockLayout,
        emitter: &mut Self::Emitter,
        block: usize,
        data: &Bytes,
    ) -> Result<Vec<Bytes>>;
}

enum OutputMode {
    Wrapped,
    Plain { start: u64, end: u64 },
}

pub struct Engine<S: Scheme> {
    scheme: S,
    layout: BlockLayout,
    table: BlockTable,
    fetch: Option<Arc<dyn Fetch>>,
    config: AuthflowConfig,
}

impl<S: Scheme> Engine<S> {
    pub(crate) fn new(
        scheme: S,
        layout: BlockLayout,
        table: BlockTable,
        fetch: Option<Arc<dyn Fetch>>,
        config: &AuthflowConfig,
    ) -> Arc<Self> {
        let fetch = match (fetch, config.fetch_timeout_ms) {
            (Some(fetch), Some(ms)) => Some(Arc::new(TimeoutFetch::new(
                fetch,
                Duration::from_millis(ms),
            )) as Arc<dyn Fetch>),
            (fetch, _) => fetch,
        };
        Arc::new(Self {
            scheme,
            layout,
            table,
            fetch,
            config: config.clone(),
        })
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn readiness(&self, block: usize) -> Option<Readiness> {
        self.table.readiness(block)
    }

    /// Open an accept-stream for the block-aligned range `[start, end)`.
    ///
    /// The first block is claimed before this returns, so a second stream
    /// starting at the same block fails here with
    /// [`AuthflowError::DuplicateClaim`]. Must be called from within a Tokio
    /// runtime.
    pub fn accept_stream(
        self: &Arc<Self>,
        start: u64,
        end: u64,
        cancel: Option<CancelPredicate>,
    ) -> Result<AcceptSink> {
        self.layout.check_aligned("accept", start, end)?;
        self.scheme.check_accept(&self.layout, start, end)?;
        let blocks = self.layout.covering(start, end);
        if blocks.is_empty() {
            return Err(AuthflowError::range(format!("empty accept range {start}-{end}")));
        }
        if is_cancelled(cancel.as_ref()) {
            return Err(AuthflowError::Cancelled);
        }
        self.table.claim(blocks.start)?;
        let claimed_until = blocks.start + 1;
        Ok(self.spawn_accept(blocks, claimed_until, cancel))
    }

    fn spawn_accept(
        self: &Arc<Self>,
        blocks: Range<usize>,
        claimed_until: usize,
        cancel: Option<CancelPredicate>,
    ) -> AcceptSink {
        let (sink, wire) = accept_channel(self.config.sink_capacity);
        _ = tokio::spawn(self.clone().run_accept(blocks, claimed_until, wire, cancel));
        sink
    }

    /// Blocks `[blocks.start, claimed_until)` are already `Pending` on this
    /// stream's behalf; later ones are claimed as the stream reaches them.
    async fn run_accept(
        self: Arc<Self>,
        blocks: Range<usize>,
        mut claimed_until: usize,
        mut wire: BufferedWritable,
        cancel: Option<CancelPredicate>,
    ) {
        let (first, last) = (blocks.start, blocks.end);
        debug!("accept {first}..{last}: started", first: first, last: last);

        let mut next = first;
        let outcome: Result<()> = async {
            let mut session = self.scheme.open_session(&self.layout, first);
            while next < last {
                let block = next;
                // The first block was checked before it was claimed. A scheme
                // may also stop inside a block before committing anything;
                // the revert below releases that claim.
                if block != first && is_cancelled(cancel.as_ref()) {
                    return Err(AuthflowError::Cancelled);
                }
                if block >= claimed_until {
                    self.table.claim(block)?;
                    claimed_until = block + 1;
                }
                let data = self
                    .scheme
                    .accept_block(
                        &self.layout,
                        &mut session,
                        block,
                        &mut wire,
                        cancel.as_ref(),
                    )
                    .await?;
                self.table.resolve(block, data);
                debug!("accept: resolved block {block}", block: block);
                next += 1;
            }
            Ok::<(), AuthflowError>(())
        }
        .await;

        if let Err(err) = &outcome {
            self.table.revert(next..claimed_until, err);
            let reason = err.to_string();
            if err.reverts_claim() {
                warn!(
                    "accept {first}..{last}: rejected at block {next}: {reason}",
                    first: first,
                    last: last,
                    next: next,
                    reason: reason
                );
            } else {
                debug!(
                    "accept {first}..{last}: stopped at block {next}: {reason}",
                    first: first,
                    last: last,
                    next: next,
                    reason: reason
                );
            }
        } else {
            debug!("accept {first}..{last}: complete", first: first, last: last);
        }
        wire.complete(&outcome);
    }

    /// Resolve to `block`'s verified bytes, fetching the unclaimed run that
    /// starts at it (bounded by `scan_end`) if nobody is supplying it yet.
    async fn ensure_ready(
        self: &Arc<Self>,
        block: usize,
        scan_end: usize,
        cancel: &CancelPredicate,
    ) -> Result<Bytes> {
        loop {
            if cancel() {
                return Err(AuthflowError::Cancelled);
            }
            let waiter = match self.table.lookup(block, scan_end, self.fetch.is_some())? {
                Lookup::Ready(data) => return Ok(data),
                Lookup::Wait(waiter) => waiter,
                Lookup::Reserved { span, waiter } => {
                    self.fetch_span(span, cancel).await?;
                    waiter
                }
            };
            match waiter.await {
                Ok(Ok(data)) => return Ok(data),
                // The supplier was cancelled by its own reader; the block is
                // unclaimed again and says nothing about the data.
                Ok(Err(AuthflowError::Cancelled)) => continue,
                Ok(Err(err)) => return Err(err),
                // The table went away with the descriptor.
                Err(_) => return Err(AuthflowError::Cancelled),
            }
        }
    }

    /// Fetch the reserved `span` and pipe it into an accept-stream that
    /// already holds every block of it.
    async fn fetch_span(
        self: &Arc<Self>,
        span: Range<usize>,
        cancel: &CancelPredicate,
    ) -> Result<()> {
        let start = self.layout.block_start(span.start);
        let end = self.layout.block_end(span.end - 1);
        info!("requesting content {start}-{end}", start: start, end: end);

        let fetched = match &self.fetch {
            Some(fetch) => fetch.fetch(start, end).await,
            None => Err(AuthflowError::InvalidDescriptor(
                "no fetch callback".to_string(),
            )),
        };
        let source = match fetched {
            Ok(source) => source,
            Err(err) => {
                self.table.revert(span, &err);
                return Err(err);
            }
        };

        let claimed_until = span.end;
        let sink = self.spawn_accept(span, claimed_until, Some(cancel.clone()));
        let chunk_size = self.config.pump_chunk_size;
        _ = tokio::spawn(async move {
            if let Err(err) = pump(source, sink, chunk_size).await {
                let reason = err.to_string();
                debug!(
                    "pump for {start}-{end} ended: {reason}",
                    start: start,
                    end: end,
                    reason: reason
                );
            }
        });
        Ok(())
    }

    /// Stream the block-aligned range `[start, end)` with proof material.
    pub fn output_stream(self: &Arc<Self>, start: u64, end: u64) -> Result<OutputStream> {
        self.layout.check_aligned("output", start, end)?;
        self.scheme.check_output(&self.layout, start, end)?;
        let blocks = self.layout.covering(start, end);
        Ok(self.spawn_output(blocks, OutputMode::Wrapped))
    }

    /// Stream exactly the bytes `[start, end)`, fetching whatever blocks
    /// they touch.
    pub fn plain_output_stream(self: &Arc<Self>, start: u64, end: u64) -> Result<OutputStream> {
        self.layout.check_bounds("plain output", start, end)?;
        if start == end {
            let (producer, consumer) = output_channel();
            producer.finish();
            return Ok(consumer);
        }
        let (lo, hi) = self.layout.output_range(start, end);
        let blocks = self.layout.covering(lo, hi);
        Ok(self.spawn_output(blocks, OutputMode::Plain { start, end }))
    }

    fn spawn_output(self: &Arc<Self>, blocks: Range<usize>, mode: OutputMode) -> OutputStream {
        let (producer, consumer) = output_channel();
        _ = tokio::spawn(self.clone().run_output(blocks, mode, producer));
        consumer
    }

    async fn run_output(
        self: Arc<Self>,
        blocks: Range<usize>,
        mode: OutputMode,
        producer: BufferedReadable,
    ) {
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = terminated.clone();
        let cancel: CancelPredicate = Arc::new(move || flag.load(Ordering::Acquire));

        let result: Result<()> = async {
            let mut emitter = match mode {
                OutputMode::Wrapped => Some(self.scheme.open_emitter(&self.layout, blocks.start)),
                OutputMode::Plain { .. } => None,
            };
            for block in blocks.clone() {
                let data = self.ensure_ready(block, blocks.end, &cancel).await?;
                match (&mode, emitter.as_mut()) {
                    (OutputMode::Plain { start, end }, _) => {
                        let base = self.layout.block_start(block);
                        let lo = start.saturating_sub(base).min(data.len() as u64) as usize;
                        let hi = end.saturating_sub(base).min(data.len() as u64) as usize;
                        producer.write_exact(data.slice(lo..hi.max(lo))).await?;
                    }
                    (OutputMode::Wrapped, Some(emitter)) => {
                        for chunk in self.scheme.wrap_block(&self.layout, emitter, block, &data)? {
                            producer.write_exact(chunk).await?;
                        }
                    }
                    (OutputMode::Wrapped, None) => {
                        return Err(AuthflowError::missing_hash("output emitter"));
                    }
                }
            }
            Ok::<(), AuthflowError>(())
        }
        .await;

        match result {
            Ok(()) => producer.finish(),
            Err(err) => {
                terminated.store(true, Ordering::Release);
                let (first, last) = (blocks.start, blocks.end);
                let reason = err.to_string();
                debug!(
                    "output {first}..{last}: terminated: {reason}",
                    first: first,
                    last: last,
                    reason: reason
                );
                producer.fail(err);
            }
        }
    }
}

/// A descriptor backed by an [`Engine`] over scheme `S`.
pub struct Verifier<S: Scheme> {
    engine: Arc<Engine<S>>,
}

impl<S: Scheme> Verifier<S> {
    pub(crate) fn assemble(
        scheme: S,
        layout: BlockLayout,
        table: BlockTable,
        fetch: Option<Arc<dyn Fetch>>,
        config: &AuthflowConfig,
    ) -> Self {
        Self {
            engine: Engine::new(scheme, layout, table, fetch, config),
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        self.engine.layout()
    }

    pub fn scheme(&self) -> &S {
        self.engine.scheme()
    }
}

impl<S: Scheme> AuthenticData for Verifier<S> {
    fn algorithm(&self) -> AlgorithmId {
        self.engine.scheme.algorithm(&self.engine.layout)
    }

    fn length(&self) -> u64 {
        self.engine.layout.length()
    }

    fn root_digest(&self) -> Bytes {
        self.engine.scheme.root_digest()
    }

    fn block_count(&self) -> usize {
        self.engine.layout.blocks()
    }

    fn readiness(&self, block: usize) -> Option<Readiness> {
        self.engine.readiness(block)
    }

    fn output_range(&self, start: u64, end: u64) -> (u64, u64) {
        self.engine.layout.output_range(start, end)
    }

    fn accept_stream(
        &self,
        start: u64,
        end: u64,
        cancel: Option<CancelPredicate>,
    ) -> Result<AcceptSink> {
        self.engine.accept_stream(start, end, cancel)
    }

    fn output_stream(&self, start: u64, end: u64) -> Result<OutputStream> {
        self.engine.output_stream(start, end)
    }

    fn plain_output_stream(&self, start: u64, end: u64) -> Result<OutputStream> {
        self.engine.plain_output_stream(start, end)
    }
}
