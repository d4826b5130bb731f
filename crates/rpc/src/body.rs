//! Request/response bodies.
//!
//! A [`Body`] is one of three things: an owned in-memory buffer (the default
//! after construction, always writable), an externally supplied byte stream
//! (e.g. a hyper `Incoming`), or a [`Streamer`] pipe used to stream a
//! response out chunk by chunk. The enum implements [`http_body::Body`] so it
//! flows straight into hyper in both directions.
//!
//! The buffered/streaming split carries one deliberate rule: writing to a
//! non-writable body *upgrades* it: the existing stream is read to the end
//! into a fresh buffer first, so no bytes are ever silently dropped. If the
//! capture read fails, the write fails.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body::{Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use thiserror::Error;

use crate::streamer::Streamer;

#[derive(Error, Debug)]
pub enum BodyError {
    #[error("body stream error: {reason}")]
    Stream { reason: String },

    #[error("body closed")]
    Closed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl BodyError {
    pub fn stream<S: ToString>(reason: S) -> Self {
        Self::Stream { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Debug)]
pub enum Body {
    /// Owned buffer; readable and writable. The default after construction.
    Buffer(BytesMut),
    /// Externally supplied stream; readable once, not writable in place.
    Stream(UnsyncBoxBody<Bytes, BodyError>),
    /// In-process pipe; the consumer half of [`Streamer::pipe`].
    Streamer(Streamer),
}

impl Body {
    pub fn empty() -> Self {
        Self::Buffer(BytesMut::new())
    }

    /// Wraps any `http_body::Body` as an externally supplied stream.
    pub fn stream<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: ToString,
    {
        Self::Stream(UnsyncBoxBody::new(body.map_err(BodyError::stream)))
    }

    /// A streaming body: written to the wire chunk by chunk with a flush per
    /// write.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streamer(_))
    }

    /// Appends `data` to the body.
    ///
    /// Buffers accept the write directly. A [`Body::Stream`] is first read to
    /// the end into a fresh buffer (preserving every byte); an error reading
    /// the stream fails the write without truncation. Writing to a
    /// [`Body::Streamer`] sends one chunk down the pipe.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), BodyError> {
        match self {
            Self::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Self::Streamer(streamer) => streamer.write(Bytes::copy_from_slice(data)).await,
            Self::Stream(stream) => {
                let collected = BodyExt::collect(&mut *stream).await?.to_bytes();
                let mut buf = BytesMut::with_capacity(collected.len() + data.len());
                buf.extend_from_slice(&collected);
                buf.extend_from_slice(data);
                *self = Self::Buffer(buf);
                Ok(())
            }
        }
    }

    /// Returns the full body as bytes.
    ///
    /// With `consume = false` the body is left holding the same bytes, so
    /// repeated calls (and a later full read) observe identical content; a
    /// stream is captured into a buffer to make that possible. With
    /// `consume = true` the body is drained and left empty.
    pub async fn bytes(&mut self, consume: bool) -> Result<Bytes, BodyError> {
        match self {
            Self::Buffer(buf) => {
                if consume {
                    Ok(std::mem::take(buf).freeze())
                } else {
                    Ok(Bytes::copy_from_slice(buf))
                }
            }
            _ => {
                let collected = match self {
                    Self::Stream(stream) => BodyExt::collect(&mut *stream).await?.to_bytes(),
                    Self::Streamer(streamer) => BodyExt::collect(&mut *streamer).await?.to_bytes(),
                    Self::Buffer(_) => unreachable!("handled above"),
                };
                if consume {
                    *self = Self::empty();
                } else {
                    *self = Self::Buffer(BytesMut::from(&collected[..]));
                }
                Ok(collected)
            }
        }
    }

    pub fn len_hint(&self) -> Option<u64> {
        http_body::Body::size_hint(self).exact()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(BytesMut::from(&bytes[..]))
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(BytesMut::from(&bytes[..]))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Buffer(BytesMut::from(s.as_bytes()))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self::Buffer(BytesMut::from(s.as_bytes()))
    }
}

impl From<Streamer> for Body {
    fn from(streamer: Streamer) -> Self {
        Self::Streamer(streamer)
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Self::Buffer(buf) if buf.is_empty() => Poll::Ready(None),
            Self::Buffer(buf) => Poll::Ready(Some(Ok(Frame::data(std::mem::take(buf).freeze())))),
            Self::Stream(stream) => Pin::new(stream).poll_frame(cx),
            Self::Streamer(streamer) => Pin::new(streamer).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Buffer(buf) => buf.is_empty(),
            Self::Stream(stream) => stream.is_end_stream(),
            Self::Streamer(streamer) => streamer.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Buffer(buf) => SizeHint::with_exact(buf.len() as u64),
            Self::Stream(stream) => stream.size_hint(),
            Self::Streamer(streamer) => http_body::Body::size_hint(streamer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use http_body::Body as _;
    use http_body_util::StreamBody;

    fn check_send<T: Send>() {}

    #[test]
    fn is_send() {
        check_send::<Body>();
    }

    fn stream_of(chunks: &[&'static [u8]]) -> Body {
        let frames: Vec<Result<_, io::Error>> =
            chunks.iter().map(|c| Ok(Frame::data(Bytes::from_static(c)))).collect();
        let stream = futures::stream::iter(frames).map_err(BodyError::io);
        Body::stream(StreamBody::new(stream))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn buffer_write_then_read() {
        let mut body = Body::empty();
        body.write(b"hello ").await.unwrap();
        body.write(b"world").await.unwrap();
        assert_eq!(body.bytes(true).await.unwrap(), Bytes::from("hello world"));
        assert_eq!(body.bytes(true).await.unwrap(), Bytes::new());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn bytes_without_consume_is_idempotent() {
        let mut body = stream_of(&[b"abc", b"def"]);

        let first = body.bytes(false).await.unwrap();
        let second = body.bytes(false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Bytes::from("abcdef"));

        // a subsequent full read still sees the same bytes
        assert_eq!(body.bytes(true).await.unwrap(), Bytes::from("abcdef"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn write_upgrades_stream_preserving_bytes() {
        let mut body = stream_of(&[b"existing"]);
        body.write(b" appended").await.unwrap();

        assert!(matches!(body, Body::Buffer(_)));
        assert_eq!(body.bytes(true).await.unwrap(), Bytes::from("existing appended"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn write_upgrade_fails_when_stream_errors() {
        let frames: Vec<Result<Frame<Bytes>, io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let stream = futures::stream::iter(frames).map_err(BodyError::io);
        let mut body = Body::stream(StreamBody::new(stream));

        assert!(body.write(b"more").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn buffer_body_yields_single_frame() {
        let mut body = Body::from("chunk");
        assert_eq!(body.len_hint(), Some(5));
        assert!(!body.is_end_stream());

        let frame = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(frame, Bytes::from("chunk"));
        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
    }
}
