// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Deterministic helpers for exercising descriptors in tests.

use crate::authentic::AuthenticData;
use crate::error::{AuthflowError, Result};
use crate::fetch::{ByteSource, Fetch};
use crate::hash::ContentHasher;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};

/// One-byte "digest": the sum of all input bytes modulo 251. Small enough
/// to work out chains and trees by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubHasher;

impl ContentHasher for StubHasher {
    fn name(&self) -> &str {
        "stub"
    }

    fn output_len(&self) -> usize {
        1
    }

    fn hash(&self, parts: &[&[u8]]) -> Bytes {
        let sum = parts
            .iter()
            .flat_map(|part| part.iter())
            .fold(0u32, |acc, b| (acc + u32::from(*b)) % 251);
        Bytes::copy_from_slice(&[sum as u8])
    }
}

/// A fetch that serves the wire encoding of a local descriptor and records
/// every span it was asked for.
pub struct WireFetch {
    origin: Arc<dyn AuthenticData>,
    calls: Mutex<Vec<(u64, u64)>>,
    corrupt_at: Option<usize>,
    failure: Option<AuthflowError>,
}

impl WireFetch {
    pub fn new(origin: Arc<dyn AuthenticData>) -> Self {
        Self {
            origin,
            calls: Mutex::new(Vec::new()),
            corrupt_at: None,
            failure: None,
        }
    }

    /// Flip the low bit of the wire byte at `offset` in every response.
    #[must_use]
    pub fn corrupting(mut self, offset: usize) -> Self {
        self.corrupt_at = Some(offset);
        self
    }

    /// Fail every call with `err` (still recording it).
    #[must_use]
    pub fn failing(mut self, err: AuthflowError) -> Self {
        self.failure = Some(err);
        self
    }

    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Fetch for WireFetch {
    async fn fetch(&self, start: u64, end: u64) -> Result<ByteSource> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((start, end));
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let stream = self.origin.output_stream(start, end)?;
        match self.corrupt_at {
            None => Ok(Box::pin(stream)),
            Some(offset) => {
                let mut wire = stream.read_all().await?.to_vec();
                if let Some(byte) = wire.get_mut(offset) {
                    *byte ^= 0x01;
                }
                Ok(Box::pin(Cursor::new(wire)))
            }
        }
    }
}
