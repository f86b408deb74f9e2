// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Flow-controlled duplex adapters.
//!
//! The verifiers are written as straight-line async code that wants exact
//! byte counts: "give me the next 32 bytes of digest", "hand this block to
//! whoever is reading". The outside world speaks `AsyncWrite` (a peer pushing
//! arbitrary chunks) and `AsyncRead` (a consumer pulling at its own pace).
//!
//! - [`accept_channel`] pairs an [`AcceptSink`] (push side, `AsyncWrite`)
//!   with a [`BufferedWritable`] whose [`BufferedWritable::read_exact`]
//!   suspends until enough bytes have arrived.
//! - [`output_channel`] pairs a [`BufferedReadable`] whose
//!   [`BufferedReadable::write_exact`] suspends until the consumer has drained
//!   the buffer, with an [`OutputStream`] (pull side, `AsyncRead`).
//!
//! Both pairs are single-producer/single-consumer.

use crate::error::{AuthflowError, Result};
use crate::fetch::ByteSource;
use bytes::{Bytes, BytesMut};
use diagnostics::*;
use std::future::{Future, poll_fn};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::PollSender;

type Chunk = std::result::Result<Bytes, AuthflowError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure recorded by the verifying task, so that a writer finding the
/// channel closed can report why.
#[derive(Default)]
struct SinkShared {
    failure: Mutex<Option<AuthflowError>>,
}

/// Create a connected accept pair. The sink goes to whoever supplies wire
/// bytes; the [`BufferedWritable`] goes to the verifying task.
pub fn accept_channel(capacity: usize) -> (AcceptSink, BufferedWritable) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (done_tx, done_rx) = oneshot::channel();
    let shared = Arc::new(SinkShared::default());
    let sink = AcceptSink {
        tx: PollSender::new(tx),
        shared: shared.clone(),
        done: Some(done_rx),
        outcome: None,
    };
    let reader = BufferedWritable {
        rx,
        buffer: BytesMut::new(),
        eof: false,
        shared,
        done: Some(done_tx),
    };
    (sink, reader)
}

/// Pull side of an accept pair: exact-length reads over pushed chunks.
pub struct BufferedWritable {
    rx: mpsc::Receiver<Chunk>,
    buffer: BytesMut,
    eof: bool,
    shared: Arc<SinkShared>,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl BufferedWritable {
    /// Resolve to exactly `n` bytes, buffering any surplus for the next call.
    ///
    /// Once the writer side has ended, this and every later call fail with
    /// [`AuthflowError::UnexpectedEof`] (or the error the writer aborted with).
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        if self.eof {
            return Err(AuthflowError::UnexpectedEof {
                needed: n,
                buffered: self.buffer.len(),
            });
        }
        while self.buffer.len() < n {
            match self.rx.recv().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    self.eof = true;
                    return Err(err);
                }
                None => {
                    self.eof = true;
                    return Err(AuthflowError::UnexpectedEof {
                        needed: n,
                        buffered: self.buffer.len(),
                    });
                }
            }
        }
        Ok(self.buffer.split_to(n).freeze())
    }

    /// Report the task's outcome to the sink and stop accepting input.
    pub fn complete(mut self, outcome: &Result<()>) {
        if let Err(err) = outcome {
            *lock(&self.shared.failure) = Some(err.clone());
        }
        self.rx.close();
        if let Some(done) = self.done.take() {
            _ = done.send(outcome.clone());
        }
    }
}

/// Push side of an accept pair.
///
/// `shutdown()` resolves once the verifying task has finished and carries
/// its outcome, so a caller that wrote a whole proof learns whether it
/// verified.
pub struct AcceptSink {
    tx: PollSender<Chunk>,
    shared: Arc<SinkShared>,
    done: Option<oneshot::Receiver<Result<()>>>,
    outcome: Option<Result<()>>,
}

impl AcceptSink {
    fn closed_error(&self) -> io::Error {
        match lock(&self.shared.failure).clone() {
            Some(err) => err.into(),
            None => io::Error::new(
                io::ErrorKind::BrokenPipe,
                "accept stream is no longer reading",
            ),
        }
    }

    /// Fail the accept-stream with an upstream error instead of ending it
    /// cleanly.
    pub async fn abort(&mut self, err: AuthflowError) {
        if let Some(tx) = self.tx.get_ref() {
            let tx = tx.clone();
            _ = tx.send(Err(err)).await;
        }
        self.tx.close();
    }

    /// Close the input and wait for the verifying task's outcome.
    pub async fn finish(&mut self) -> Result<()> {
        self.shutdown().await.map_err(AuthflowError::from)
    }
}

impl AsyncWrite for AcceptSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.closed_error()));
        }
        if this.tx.send_item(Ok(Bytes::copy_from_slice(buf))).is_err() {
            return Poll::Ready(Err(this.closed_error()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tx.close();
        if let Some(done) = this.done.as_mut() {
            let outcome = match ready!(Pin::new(done).poll(cx)) {
                Ok(outcome) => outcome,
                Err(_) => Err(AuthflowError::Cancelled),
            };
            this.done = None;
            this.outcome = Some(outcome);
        }
        match this.outcome.clone() {
            Some(Err(err)) => Poll::Ready(Err(err.into())),
            _ => Poll::Ready(Ok(())),
        }
    }
}

/// Copy `source` into `sink` and report the accept-stream's outcome.
///
/// A read error on the source aborts the sink with that error; a clean end
/// of the source shuts the sink down.
pub async fn pump(mut source: ByteSource, mut sink: AcceptSink, chunk_size: usize) -> Result<()> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let err = AuthflowError::from(e);
                let reason = err.to_string();
                debug!("pump: upstream read failed: {reason}", reason: reason);
                sink.abort(err.clone()).await;
                return Err(err);
            }
        };
        sink.write_all(&buf[..n]).await?;
    }
    sink.finish().await
}

#[derive(Default)]
struct ReadableState {
    chunk: Bytes,
    finished: bool,
    failure: Option<AuthflowError>,
    consumer_gone: bool,
    reader: Option<Waker>,
    writer: Option<Waker>,
}

impl ReadableState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.writer.take() {
            waker.wake();
        }
    }
}

/// Create a connected output pair: the producer half for the task that
/// assembles the stream, the [`OutputStream`] for the consumer.
pub fn output_channel() -> (BufferedReadable, OutputStream) {
    let state = Arc::new(Mutex::new(ReadableState::default()));
    (
        BufferedReadable {
            state: state.clone(),
        },
        OutputStream { state },
    )
}

/// Producer half of an output pair.
pub struct BufferedReadable {
    state: Arc<Mutex<ReadableState>>,
}

impl BufferedReadable {
    /// Hand `buf` to the consumer and suspend until it has all been read.
    ///
    /// Fails with [`AuthflowError::Cancelled`] if the consumer is dropped
    /// first.
    pub async fn write_exact(&self, buf: Bytes) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.consumer_gone {
                return Err(AuthflowError::Cancelled);
            }
            if buf.is_empty() {
                return Ok(());
            }
            state.chunk = buf;
            state.wake_reader();
        }
        poll_fn(|cx| {
            let mut state = lock(&self.state);
            if state.consumer_gone {
                state.chunk = Bytes::new();
                return Poll::Ready(Err(AuthflowError::Cancelled));
            }
            if state.chunk.is_empty() {
                return Poll::Ready(Ok(()));
            }
            state.writer = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// End the stream normally once the consumer has read everything.
    pub fn finish(&self) {
        let mut state = lock(&self.state);
        state.finished = true;
        state.wake_reader();
    }

    /// Destroy the stream with `err`; the consumer's next read fails with it.
    pub fn fail(&self, err: AuthflowError) {
        let mut state = lock(&self.state);
        state.failure = Some(err);
        state.wake_reader();
        state.wake_writer();
    }
}

/// Consumer half of an output pair.
///
/// Dropping it cancels the producer.
pub struct OutputStream {
    state: Arc<Mutex<ReadableState>>,
}

impl OutputStream {
    /// Read the whole stream into memory.
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        _ = self.read_to_end(&mut out).await?;
        Ok(Bytes::from(out))
    }
}

impl AsyncRead for OutputStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = lock(&self.state);
        if !state.chunk.is_empty() {
            let n = buf.remaining().min(state.chunk.len());
            let head = state.chunk.split_to(n);
            buf.put_slice(&head);
            if state.chunk.is_empty() {
                state.wake_writer();
            }
            return Poll::Ready(Ok(()));
        }
        if let Some(err) = state.failure.clone() {
            return Poll::Ready(Err(err.into()));
        }
        if state.finished {
            return Poll::Ready(Ok(()));
        }
        state.reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.consumer_gone = true;
        state.wake_writer();
    }
}
