//! Buffered peeking over a raw byte stream.
//!
//! HTTP heads and chunk framing carry no length prefix, so the reader
//! accumulates bytes until a parser can make sense of them, hands the
//! consumer exactly the framed prefix, and serves whatever it over-read
//! before touching the stream again.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Upper bound on bytes pulled from the stream per [`PeekReader::fill`] call.
const FILL_CHUNK: usize = 4 * 1024;

/// A byte stream with an inspectable peek buffer in front of it.
///
/// Bytes enter the buffer through [`fill`](Self::fill) or
/// [`read_line`](Self::read_line) and leave through
/// [`advance`](Self::advance), [`pop_front`](Self::pop_front), or plain
/// `AsyncRead`, which always drains the buffer before the stream. Writes pass
/// straight through when the stream supports them.
#[derive(Debug)]
pub(crate) struct PeekReader<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Starts out with `front` already peeked, ahead of anything the stream
    /// delivers.
    pub(crate) fn with_front(inner: R, front: Bytes, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::from(&front[..]),
            limit,
        }
    }

    /// Bytes peeked so far and not yet consumed.
    pub(crate) fn peeked(&self) -> &[u8] {
        &self.buf
    }

    /// True once the peek buffer holds `limit` bytes.
    pub(crate) fn limit_reached(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Consumes `n` peeked bytes.
    pub(crate) fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Removes and returns the first `n` peeked bytes.
    pub(crate) fn pop_front(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Pulls more bytes from the stream into the peek buffer.
    ///
    /// Returns how many bytes arrived; zero means the stream hit EOF or the
    /// buffer is already at its limit.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self
            .limit
            .saturating_sub(self.buf.len())
            .min(FILL_CHUNK);
        if room == 0 {
            return Ok(0);
        }
        let mut scratch = [0u8; FILL_CHUNK];
        let n = self.inner.read(&mut scratch[..room]).await?;
        self.buf.extend_from_slice(&scratch[..n]);
        Ok(n)
    }

    /// Reads one line, up to and including its LF.
    ///
    /// Lines longer than the limit are invalid, as is EOF mid-line.
    pub(crate) async fn read_line(&mut self) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                return Ok(self.pop_front(pos + 1));
            }
            if self.limit_reached() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Line exceeds buffer limit",
                ));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Stream ended inside a line",
                ));
            }
        }
    }

    /// Returns the unconsumed peeked bytes and the stream.
    pub(crate) fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }
        let n = this.buf.len().min(out.remaining());
        out.put_slice(&this.buf[..n]);
        this.buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for PeekReader<R> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn peeks_a_head_then_reads_through() {
        let data = &b"GET / HTTP/1.1\r\n\r\nbody"[..];
        let mut reader = PeekReader::new(Cursor::new(data), 18);
        while !reader.limit_reached() && reader.fill().await.unwrap() > 0 {}
        assert_eq!(reader.peeked(), b"GET / HTTP/1.1\r\n\r\n");
        reader.advance(18);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"body");
    }

    #[tokio::test]
    async fn fill_stops_at_the_limit() {
        let mut reader = PeekReader::new(Cursor::new(&b"abcdefgh"[..]), 4);
        assert_eq!(reader.fill().await.unwrap(), 4);
        assert!(reader.limit_reached());
        assert_eq!(reader.fill().await.unwrap(), 0);
        assert_eq!(reader.peeked(), b"abcd");
    }

    #[tokio::test]
    async fn fill_reports_eof_as_zero() {
        let mut reader = PeekReader::new(Cursor::new(&b""[..]), 16);
        assert_eq!(reader.fill().await.unwrap(), 0);
        assert!(reader.peeked().is_empty());
    }

    #[tokio::test]
    async fn pop_front_hands_out_the_prefix() {
        let mut reader = PeekReader::new(Cursor::new(&b"3\r\nbla\r\n"[..]), 64);
        reader.fill().await.unwrap();
        assert_eq!(&reader.pop_front(3)[..], b"3\r\n");
        assert_eq!(reader.peeked(), b"bla\r\n");
    }

    #[tokio::test]
    async fn read_line_includes_the_terminator() {
        let mut reader = PeekReader::new(Cursor::new(&b"5;ext=1\r\nhello"[..]), 64);
        let line = reader.read_line().await.unwrap();
        assert_eq!(&line[..], b"5;ext=1\r\n");
        assert_eq!(reader.peeked(), b"hello");
    }

    #[tokio::test]
    async fn read_line_rejects_eof_and_oversized_lines() {
        let mut reader = PeekReader::new(Cursor::new(&b"no newline"[..]), 64);
        let err = reader.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut reader = PeekReader::new(Cursor::new(&b"aaaaaaaa"[..]), 4);
        let err = reader.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn with_front_serves_the_seed_before_the_stream() {
        let mut reader =
            PeekReader::with_front(Cursor::new(&b" world"[..]), Bytes::from_static(b"hello"), 64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn interleaved_reads_drain_the_buffer_first() {
        let mut reader = PeekReader::new(Cursor::new(&b"abcdef"[..]), 4);
        reader.fill().await.unwrap();
        reader.advance(2);
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ef");
    }

    #[tokio::test]
    async fn into_parts_returns_the_unconsumed_peek() {
        let mut reader = PeekReader::new(Cursor::new(&b"abcdef"[..]), 64);
        reader.fill().await.unwrap();
        reader.advance(2);
        let (front, _inner) = reader.into_parts();
        assert_eq!(&front[..], b"cdef");
    }
}
