/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ic-channel project authors.
 */

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf, ReadHalf, SimplexStream, WriteHalf};

enum WriterSlot {
    Idle(WriteHalf<SimplexStream>),
    Busy,
    Closed,
}

/// Writable end of a synthesized body pipe. The handle is cloneable so the
/// channel can keep one to close the pipe when synthesis finishes while the
/// interceptor streams through another.
#[derive(Clone)]
pub struct BodyWriter {
    slot: Arc<Mutex<WriterSlot>>,
}

impl BodyWriter {
    fn take_writer(&self) -> io::Result<WriteHalf<SimplexStream>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *slot, WriterSlot::Busy) {
            WriterSlot::Idle(w) => Ok(w),
            WriterSlot::Busy => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "body pipe write already in progress",
            )),
            WriterSlot::Closed => {
                *slot = WriterSlot::Closed;
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "body pipe closed"))
            }
        }
    }

    fn put_writer(&self, w: WriteHalf<SimplexStream>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*slot, WriterSlot::Busy) {
            *slot = WriterSlot::Idle(w);
        } else {
            // close() ran while the half was out; complete the shutdown now
            shutdown_write_half(w);
        }
    }

    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut w = self.take_writer()?;
        let r = w.write_all(buf).await;
        self.put_writer(w);
        r
    }

    /// Close the pipe. The read end keeps yielding buffered bytes and then
    /// reports EOF. Idempotent.
    pub fn close(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *slot, WriterSlot::Closed) {
            WriterSlot::Idle(w) => shutdown_write_half(w),
            WriterSlot::Busy | WriterSlot::Closed => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*slot, WriterSlot::Closed)
    }
}

// the split halves keep the stream alive through a shared handle, so
// dropping the write half alone never wakes the read end with EOF; an
// explicit shutdown is required
fn shutdown_write_half(mut w: WriteHalf<SimplexStream>) {
    tokio::spawn(async move {
        let _ = w.shutdown().await;
    });
}

enum ReaderKind {
    Pipe(ReadHalf<SimplexStream>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

/// Readable end of a synthesized body: the pipe counterpart of a
/// [`BodyWriter`], an arbitrary replayed stream, or an empty substitute.
pub struct BodyReader {
    kind: ReaderKind,
}

impl BodyReader {
    /// An immediately-EOF body, substituted when a synthesized response has
    /// no payload.
    pub fn empty() -> Self {
        BodyReader {
            kind: ReaderKind::Stream(Box::new(tokio::io::empty())),
        }
    }

    pub fn from_stream(stream: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        BodyReader {
            kind: ReaderKind::Stream(stream),
        }
    }
}

impl AsyncRead for BodyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().kind {
            ReaderKind::Pipe(r) => Pin::new(r).poll_read(cx, buf),
            ReaderKind::Stream(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

/// Create an in-process byte channel for streaming a synthesized body from
/// the interceptor to the consumer.
pub fn new_body_pipe(capacity: usize) -> (BodyReader, BodyWriter) {
    let (read_half, write_half) = tokio::io::simplex(capacity);
    (
        BodyReader {
            kind: ReaderKind::Pipe(read_half),
        },
        BodyWriter {
            slot: Arc::new(Mutex::new(WriterSlot::Idle(write_half))),
        },
    )
}
