// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The remote-fetch callback a descriptor uses to back-fill missing blocks.
//!
//! The callback receives a block-aligned byte span and must return a byte
//! source producing the wire encoding (data plus proof material) for exactly
//! that span. Transport, retries and timeouts are the callback's business;
//! whatever error it returns surfaces through the output stream that
//! triggered it.

use crate::error::{AuthflowError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, start: u64, end: u64) -> Result<ByteSource>;
}

#[async_trait]
impl<F, Fut> Fetch for F
where
    F: Fn(u64, u64) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ByteSource>> + Send + 'static,
{
    async fn fetch(&self, start: u64, end: u64) -> Result<ByteSource> {
        (self)(start, end).await
    }
}

/// Bounds the time a wrapped callback may take to produce its byte source.
pub struct TimeoutFetch {
    inner: Arc<dyn Fetch>,
    timeout: Duration,
}

impl TimeoutFetch {
    pub fn new(inner: Arc<dyn Fetch>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl Fetch for TimeoutFetch {
    async fn fetch(&self, start: u64, end: u64) -> Result<ByteSource> {
        match tokio::time::timeout(self.timeout, self.inner.fetch(start, end)).await {
            Ok(result) => result,
            Err(_) => Err(AuthflowError::upstream(
                io::ErrorKind::TimedOut,
                format!(
                    "fetch {start}-{end} timed out after {}ms",
                    self.timeout.as_millis()
                ),
            )),
        }
    }
}
