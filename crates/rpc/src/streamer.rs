//! An in-process byte pipe usable as a streaming response body.
//!
//! [`Streamer::pipe`] hands back a producer/consumer pair: the
//! [`StreamWriter`] side accepts writes and signals end-of-stream when every
//! writer is dropped or explicitly closed; the [`Streamer`] side implements
//! [`http_body::Body`], yielding one frame per write. A response whose body
//! is a streamer is written to the wire chunk by chunk with a flush per
//! frame.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use tokio::sync::mpsc;

use crate::body::BodyError;

const PIPE_DEPTH: usize = 16;

/// The consumer half of a streaming pipe.
#[derive(Debug)]
pub struct Streamer {
    rx: mpsc::Receiver<Bytes>,
    writer: mpsc::WeakSender<Bytes>,
}

/// The producer half of a streaming pipe.
///
/// Dropping the last writer (or calling [`StreamWriter::close`]) ends the
/// stream.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Streamer {
    /// Creates a connected writer/body pair.
    pub fn pipe() -> (StreamWriter, Streamer) {
        let (tx, rx) = mpsc::channel(PIPE_DEPTH);
        let writer = tx.downgrade();
        (StreamWriter { tx }, Streamer { rx, writer })
    }

    /// A fresh writer handle, if any writer is still alive.
    pub fn writer(&self) -> Option<StreamWriter> {
        self.writer.upgrade().map(|tx| StreamWriter { tx })
    }

    /// Appends a chunk from the consumer side (the body is a read *and*
    /// write pipe). Fails once the stream has been closed.
    pub(crate) async fn write(&self, data: Bytes) -> Result<(), BodyError> {
        match self.writer() {
            Some(writer) => writer.write(data).await,
            None => Err(BodyError::Closed),
        }
    }
}

impl StreamWriter {
    /// Sends one chunk down the pipe; applies backpressure when the consumer
    /// lags. Fails once the consumer half has gone away.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), BodyError> {
        self.tx.send(data.into()).await.map_err(|_| BodyError::Closed)
    }

    /// Ends the stream from this handle. Remaining clones keep it open.
    pub fn close(self) {
        drop(self);
    }
}

impl http_body::Body for Streamer {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
