// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Per-block readiness table shared by every stream of one descriptor.
//!
//! Each block is `Unclaimed`, `Pending` (held by exactly one accept-stream)
//! or `Ready` (verified, immutable). Consumers register a oneshot waiter on
//! a block that is not ready; the waiter is resolved with the block's bytes
//! when it turns `Ready`, or rejected when the holding stream fails and the
//! block goes back to a fresh `Unclaimed`.

use crate::error::{AuthflowError, Result};
use bytes::Bytes;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Unclaimed,
    Pending,
    Ready,
}

enum SlotState {
    Unclaimed,
    Pending,
    Ready(Bytes),
}

struct Slot {
    state: SlotState,
    waiters: Vec<oneshot::Sender<Result<Bytes>>>,
}

impl Slot {
    fn unclaimed() -> Self {
        Self {
            state: SlotState::Unclaimed,
            waiters: Vec::new(),
        }
    }

    fn readiness(&self) -> Readiness {
        match self.state {
            SlotState::Unclaimed => Readiness::Unclaimed,
            SlotState::Pending => Readiness::Pending,
            SlotState::Ready(_) => Readiness::Ready,
        }
    }

    fn wait(&mut self) -> oneshot::Receiver<Result<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }
}

/// Outcome of looking a block up on behalf of a reader.
pub(crate) enum Lookup {
    Ready(Bytes),
    Wait(oneshot::Receiver<Result<Bytes>>),
    /// The block and its unclaimed successors up to `span.end` were claimed
    /// for the caller, who must now fetch them or revert the claim. The
    /// caller is also registered as a waiter on the first block.
    Reserved {
        span: Range<usize>,
        waiter: oneshot::Receiver<Result<Bytes>>,
    },
}

pub struct BlockTable {
    slots: Mutex<Vec<Slot>>,
}

impl BlockTable {
    pub fn unclaimed(blocks: usize) -> Self {
        Self {
            slots: Mutex::new((0..blocks).map(|_| Slot::unclaimed()).collect()),
        }
    }

    pub fn ready(blocks: Vec<Bytes>) -> Self {
        let slots = blocks
            .into_iter()
            .map(|data| Slot {
                state: SlotState::Ready(data),
                waiters: Vec::new(),
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn readiness(&self, block: usize) -> Option<Readiness> {
        self.slots().get(block).map(Slot::readiness)
    }

    /// Take the exclusive right to supply `block`.
    pub fn claim(&self, block: usize) -> Result<()> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(block)
            .ok_or_else(|| AuthflowError::range(format!("block {block} out of range")))?;
        match slot.state {
            SlotState::Unclaimed => {
                slot.state = SlotState::Pending;
                Ok(())
            }
            _ => Err(AuthflowError::DuplicateClaim { block }),
        }
    }

    /// Mark a held block verified and hand its bytes to every waiter.
    pub fn resolve(&self, block: usize, data: Bytes) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(block) {
            slot.state = SlotState::Ready(data.clone());
            for waiter in slot.waiters.drain(..) {
                _ = waiter.send(Ok(data.clone()));
            }
        }
    }

    /// Return held blocks to a fresh `Unclaimed`, rejecting their waiters.
    /// Blocks that are not `Pending` are left alone.
    pub fn revert(&self, blocks: Range<usize>, err: &AuthflowError) {
        let mut slots = self.slots();
        for block in blocks {
            let Some(slot) = slots.get_mut(block) else {
                break;
            };
            if !matches!(slot.state, SlotState::Pending) {
                continue;
            }
            let stale = std::mem::replace(slot, Slot::unclaimed());
            for waiter in stale.waiters {
                _ = waiter.send(Err(err.clone()));
            }
        }
    }

    /// Ready bytes, a waiter, or, when `can_fetch` and the block is
    /// unclaimed, a reservation of the longest unclaimed run starting at
    /// `block` and ending before `scan_end` or the first claimed block.
    ///
    /// Scanning and claiming happen under one lock, so two readers can never
    /// both reserve the same block.
    pub(crate) fn lookup(&self, block: usize, scan_end: usize, can_fetch: bool) -> Result<Lookup> {
        let mut slots = self.slots();
        let len = slots.len();
        let slot = slots
            .get_mut(block)
            .ok_or_else(|| AuthflowError::range(format!("block {block} out of range")))?;
        match &slot.state {
            SlotState::Ready(data) => return Ok(Lookup::Ready(data.clone())),
            SlotState::Pending => return Ok(Lookup::Wait(slot.wait())),
            SlotState::Unclaimed if !can_fetch => return Ok(Lookup::Wait(slot.wait())),
            SlotState::Unclaimed => {}
        }

        let waiter = slot.wait();
        let scan_end = scan_end.clamp(block + 1, len);
        let mut end = block;
        while end < scan_end && matches!(slots[end].state, SlotState::Unclaimed) {
            slots[end].state = SlotState::Pending;
            end += 1;
        }
        Ok(Lookup::Reserved {
            span: block..end,
            waiter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_waiter_sees_resolution() {
        let table = BlockTable::unclaimed(3);
        table.claim(1).unwrap();
        let Lookup::Wait(rx) = table.lookup(1, 3, true).unwrap() else {
            panic!("pending block should yield a waiter");
        };
        table.resolve(1, Bytes::from_static(b"data"));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"data"));
        assert_eq!(table.readiness(1), Some(Readiness::Ready));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let table = BlockTable::unclaimed(2);
        table.claim(0).unwrap();
        assert_eq!(table.claim(0), Err(AuthflowError::DuplicateClaim { block: 0 }));

        let ready = BlockTable::ready(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(ready.claim(1), Err(AuthflowError::DuplicateClaim { block: 1 }));
    }

    #[tokio::test]
    async fn test_revert_rejects_waiters_and_allows_reclaim() {
        let table = BlockTable::unclaimed(2);
        table.claim(0).unwrap();
        let Lookup::Wait(rx) = table.lookup(0, 2, false).unwrap() else {
            panic!("expected waiter");
        };
        let err = AuthflowError::verification("mismatch");
        table.revert(0..1, &err);

        assert_eq!(rx.await.unwrap(), Err(err));
        assert_eq!(table.readiness(0), Some(Readiness::Unclaimed));
        table.claim(0).unwrap();
    }

    #[test]
    fn test_revert_leaves_ready_blocks_alone() {
        let table = BlockTable::unclaimed(2);
        table.claim(0).unwrap();
        table.resolve(0, Bytes::from_static(b"ok"));
        table.claim(1).unwrap();
        table.revert(0..2, &AuthflowError::Cancelled);
        assert_eq!(table.readiness(0), Some(Readiness::Ready));
        assert_eq!(table.readiness(1), Some(Readiness::Unclaimed));
    }

    #[test]
    fn test_lookup_reserves_unclaimed_run() {
        let table = BlockTable::unclaimed(6);
        table.claim(3).unwrap();

        match table.lookup(1, 6, true).unwrap() {
            Lookup::Reserved { span, .. } => assert_eq!(span, 1..3),
            _ => panic!("expected reservation"),
        }
        assert_eq!(table.readiness(2), Some(Readiness::Pending));

        // The reserved block now makes later readers wait.
        assert!(matches!(table.lookup(2, 6, true).unwrap(), Lookup::Wait(_)));
        // Scanning stops at the caller's bound.
        match table.lookup(4, 5, true).unwrap() {
            Lookup::Reserved { span, .. } => assert_eq!(span, 4..5),
            _ => panic!("expected reservation"),
        }
    }

    #[tokio::test]
    async fn test_reserver_learns_of_failed_fetch() {
        let table = BlockTable::unclaimed(4);
        let Lookup::Reserved { span, waiter } = table.lookup(0, 4, true).unwrap() else {
            panic!("expected reservation");
        };
        let err = AuthflowError::upstream(std::io::ErrorKind::ConnectionRefused, "down");
        table.revert(span, &err);
        assert_eq!(waiter.await.unwrap(), Err(err));
        assert_eq!(table.readiness(3), Some(Readiness::Unclaimed));
    }

    #[test]
    fn test_lookup_without_fetch_only_waits() {
        let table = BlockTable::unclaimed(2);
        assert!(matches!(table.lookup(0, 2, false).unwrap(), Lookup::Wait(_)));
        assert_eq!(table.readiness(0), Some(Readiness::Unclaimed));
    }
}
