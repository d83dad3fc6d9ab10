use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::{
    control::{Clock, ConnControl, Operation, RequestCtx},
    util::PeekReader,
};

/// Upstream byte stream produced by the dial pipeline.
///
/// The buffered variant carries bytes that arrived past a parent proxy's
/// CONNECT response head; they are served before anything is read from the
/// socket again.
#[derive(Debug)]
pub enum ProxyStream {
    Tcp(TcpStream),
    Buffered(PeekReader<TcpStream>),
}

impl ProxyStream {
    /// Returns the plain TCP stream when nothing is buffered ahead of it.
    fn into_tcp(self) -> Result<TcpStream, Self> {
        match self {
            ProxyStream::Tcp(stream) => Ok(stream),
            ProxyStream::Buffered(buffered) if buffered.peeked().is_empty() => {
                Ok(buffered.into_parts().1)
            }
            other => Err(other),
        }
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ProxyStream::Buffered(buffered) => Pin::new(buffered).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ProxyStream::Buffered(buffered) => Pin::new(buffered).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ProxyStream::Buffered(buffered) => Pin::new(buffered).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ProxyStream::Buffered(buffered) => Pin::new(buffered).poll_shutdown(cx),
        }
    }
}

/// Per-connection state shared between an observed connection and its split
/// halves.
///
/// The `closed` event fires from `Drop`, which runs once the last holder goes
/// away. Holders declare their I/O handle before the `Arc`, so the socket is
/// closed before the event fires.
pub(crate) struct ConnState {
    ctx: Arc<RequestCtx>,
    control: Arc<dyn ConnControl>,
    clock: Clock,
}

impl ConnState {
    fn op(&self, amount: usize) -> Operation<'_> {
        Operation {
            ctx: &self.ctx,
            time: (self.clock)(),
            amount,
        }
    }
}

impl Drop for ConnState {
    fn drop(&mut self) {
        let op = self.op(0);
        self.control.closed(op);
    }
}

/// Fires the read-request/read-report pair around an inner read.
///
/// `read_in_flight` keeps a pending inner read from firing a second
/// read-request; the report fires when the inner read completes, whatever its
/// outcome.
fn poll_observed_read<S: AsyncRead + Unpin>(
    io: &mut S,
    state: &ConnState,
    read_in_flight: &mut bool,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>> {
    if !*read_in_flight {
        let op = state.op(buf.remaining());
        if let Err(err) = state.control.read_request(op) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err)));
        }
        *read_in_flight = true;
    }
    let before = buf.filled().len();
    match Pin::new(io).poll_read(cx, buf) {
        Poll::Pending => Poll::Pending,
        ready => {
            *read_in_flight = false;
            let read = buf.filled().len() - before;
            state.control.read_report(state.op(read));
            ready
        }
    }
}

/// Wraps an upstream stream and reports its lifecycle to a [`ConnControl`].
///
/// Every read fires exactly one read-request event before touching the
/// underlying stream and one read-report event after it; a veto on the
/// read-request fails the read without any underlying I/O. Writes pass
/// through unchanged. The close event fires exactly once, after the
/// underlying stream has been closed.
pub struct ObservedConn<S> {
    io: S,
    state: Arc<ConnState>,
    read_in_flight: bool,
}

impl<S: std::fmt::Debug> std::fmt::Debug for ObservedConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedConn")
            .field("io", &self.io)
            .field("read_in_flight", &self.read_in_flight)
            .finish_non_exhaustive()
    }
}

impl<S> ObservedConn<S> {
    pub(crate) fn new(
        io: S,
        ctx: Arc<RequestCtx>,
        control: Arc<dyn ConnControl>,
        clock: Clock,
    ) -> Self {
        Self {
            io,
            state: Arc::new(ConnState {
                ctx,
                control,
                clock,
            }),
            read_in_flight: false,
        }
    }

    /// Request context this connection was opened for.
    pub fn ctx(&self) -> &RequestCtx {
        &self.state.ctx
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ObservedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_observed_read(&mut this.io, &this.state, &mut this.read_in_flight, cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObservedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl ObservedConn<ProxyStream> {
    /// Splits into TCP halves that keep reporting events, when the underlying
    /// stream supports half-close and nothing is buffered ahead of it.
    pub(crate) fn try_split(self) -> Result<(ObservedReadHalf, ObservedWriteHalf), Self> {
        let Self {
            io,
            state,
            read_in_flight,
        } = self;
        match io.into_tcp() {
            Ok(stream) => {
                let (read, write) = stream.into_split();
                Ok((
                    ObservedReadHalf {
                        io: read,
                        state: state.clone(),
                        read_in_flight,
                    },
                    ObservedWriteHalf { io: write, state },
                ))
            }
            Err(io) => Err(Self {
                io,
                state,
                read_in_flight,
            }),
        }
    }
}

/// Read half of a split observed connection; keeps firing read events.
pub(crate) struct ObservedReadHalf {
    io: OwnedReadHalf,
    state: Arc<ConnState>,
    read_in_flight: bool,
}

impl AsyncRead for ObservedReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_observed_read(&mut this.io, &this.state, &mut this.read_in_flight, cx, buf)
    }
}

/// Write half of a split observed connection. Shutting it down half-closes
/// the underlying TCP stream for writes.
pub(crate) struct ObservedWriteHalf {
    io: OwnedWriteHalf,
    #[allow(dead_code)]
    state: Arc<ConnState>,
}

impl AsyncWrite for ObservedWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Mutex,
        time::SystemTime,
    };

    use http::Method;
    use n0_error::{Result, anyerr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::control::{ConnControl, Route, system_clock};

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum Event {
        ReadRequest(usize),
        ReadReport(usize),
        Closed,
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        veto_reads: bool,
    }

    impl ConnControl for Recorder {
        fn open(&self, _op: Operation<'_>) -> Result<Route> {
            Ok(Route::default())
        }

        fn read_request(&self, op: Operation<'_>) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Event::ReadRequest(op.amount));
            if self.veto_reads {
                return Err(anyerr!("reads not allowed"));
            }
            Ok(())
        }

        fn read_report(&self, op: Operation<'_>) {
            self.events
                .lock()
                .unwrap()
                .push(Event::ReadReport(op.amount));
        }

        fn closed(&self, _op: Operation<'_>) {
            self.events.lock().unwrap().push(Event::Closed);
        }
    }

    fn test_ctx() -> Arc<RequestCtx> {
        Arc::new(RequestCtx {
            method: Method::GET,
            target: "http://example.com/".to_string(),
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            time: SystemTime::now(),
        })
    }

    fn observed<S>(io: S, control: Arc<Recorder>) -> ObservedConn<S> {
        ObservedConn::new(io, test_ctx(), control, system_clock())
    }

    #[tokio::test]
    async fn reads_fire_paired_events_and_close_fires_once() {
        let control = Arc::new(Recorder::default());
        let (near, mut far) = tokio::io::duplex(64);
        let mut conn = observed(near, control.clone());

        far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        drop(conn);

        let events = control.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                Event::ReadRequest(16),
                Event::ReadReport(5),
                Event::Closed
            ]
        );
    }

    #[tokio::test]
    async fn read_veto_fails_without_underlying_io() {
        let control = Arc::new(Recorder {
            veto_reads: true,
            ..Default::default()
        });
        let (near, mut far) = tokio::io::duplex(64);
        let mut conn = observed(near, control.clone());

        far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("reads not allowed"));

        let events = control.events.lock().unwrap().clone();
        // The veto happens before the underlying read, so no report fires.
        assert_eq!(events, vec![Event::ReadRequest(16)]);
    }

    #[tokio::test]
    async fn eof_read_reports_zero() {
        let control = Arc::new(Recorder::default());
        let (near, far) = tokio::io::duplex(64);
        let mut conn = observed(near, control.clone());
        drop(far);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        let events = control.events.lock().unwrap().clone();
        assert_eq!(events, vec![Event::ReadRequest(8), Event::ReadReport(0)]);
    }

    #[tokio::test]
    async fn writes_pass_through_without_events() {
        let control = Arc::new(Recorder::default());
        let (near, mut far) = tokio::io::duplex(64);
        let mut conn = observed(near, control.clone());

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(control.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_fires_after_both_split_halves_drop() {
        let control = Arc::new(Recorder::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let conn = observed(ProxyStream::Tcp(client), control.clone());
        let (read_half, write_half) = conn.try_split().expect("plain tcp splits");
        drop(read_half);
        assert!(control.events.lock().unwrap().is_empty());
        drop(write_half);
        let events = control.events.lock().unwrap().clone();
        assert_eq!(events, vec![Event::Closed]);
    }

    #[tokio::test]
    async fn buffered_stream_with_leftover_does_not_split() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let control = Arc::new(Recorder::default());
        let buffered = PeekReader::with_front(client, bytes::Bytes::from_static(b"early"), 64);
        let conn = observed(ProxyStream::Buffered(buffered), control);
        assert!(conn.try_split().is_err());
    }
}
