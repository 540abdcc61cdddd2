//! The ordered byte pipe between the download engine and its consumer.
//!
//! Exactly one [`PipeWriter`] exists per download; ownership of it is what
//! circulates through the worker token ring, so mutual exclusion on the
//! write side is structural rather than locked. Dropping the writer is the
//! end-of-stream signal. A worker that hits a fatal condition sends the
//! error down the same channel, where the consumer observes it as a read
//! error instead of a silent truncation.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::error::FetchError;

/// Segments in flight between the write turn holder and the consumer.
const PIPE_DEPTH: usize = 8;

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    let reader = PipeReader {
        inner: StreamReader::new(ReceiverStream::new(rx)),
    };
    (PipeWriter { tx }, reader)
}

pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Push one ordered segment, blocking on consumer backpressure.
    pub async fn write(&mut self, segment: Bytes) -> Result<(), FetchError> {
        self.tx
            .send(Ok(segment))
            .await
            .map_err(|_| FetchError::ConsumerGone)
    }

    /// Close the stream; the consumer sees EOF after the final segment.
    pub fn close(self) {}

    /// Surface a fatal error to the consumer, then close.
    pub async fn fail(self, err: FetchError) {
        let _ = self.tx.send(Err(err.into_io())).await;
    }
}

pub struct PipeReader {
    inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
