//! Client-facing proxy server: request handling and CONNECT tunneling.

use std::{io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http::StatusCode;
use n0_error::{AnyError, Result, StdResultExt, anyerr, stack_error};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, time::FutureExt};
use tracing::{Instrument, debug, error_span, warn};

pub use self::opts::{PoolOpts, ProxyOpts};
use crate::{
    HEADER_SECTION_MAX_LENGTH,
    control::{ConnControl, RequestCtx},
    parse::{Authority, HttpProxyRequestKind, HttpRequest, HttpResponse},
    transport::Transport,
    upstream::Dialer,
    util::{PeekReader, splice},
};

pub(crate) mod opts;

/// CONNECT success line, flushed to the client before any origin byte.
const CONNECT_OK: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

/// Forward proxy serving plain HTTP requests and CONNECT tunnels from TCP
/// clients.
///
/// Every upstream connection goes through the per-request dial pipeline: the
/// [`ConnControl`] picks the outbound interface and optional parent proxy and
/// observes all reads until the connection closes.
#[derive(Clone, derive_more::Debug)]
pub struct Proxy {
    #[debug("Arc<dyn ConnControl>")]
    control: Arc<dyn ConnControl>,
    #[debug(skip)]
    transport: Arc<Transport>,
    opts: ProxyOpts,
}

impl Proxy {
    /// Creates a proxy with default options.
    pub fn new(control: impl ConnControl) -> Self {
        Self::with_opts(control, ProxyOpts::default())
    }

    /// Creates a proxy with the given options.
    pub fn with_opts(control: impl ConnControl, opts: ProxyOpts) -> Self {
        Self {
            control: Arc::new(control),
            transport: Arc::new(Transport::new(opts.pool.clone())),
            opts,
        }
    }

    /// Accepts client connections from the listener and serves each in its
    /// own task until the listener fails. Dropping the returned future
    /// cancels the connection tasks.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let (client_stream, client_addr) = listener
                .accept()
                .await
                .std_context("failed to accept client connection")?;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!("accepted connection");
                        if let Err(err) = this.handle(client_stream, client_addr).await {
                            warn!("connection closed with error: {err:#}");
                        } else {
                            debug!("connection closed");
                        }
                    })
                    .instrument(error_span!("client", id, peer = %client_addr)),
            );
            id += 1;
        }
    }

    /// Serves a single client connection: reads requests, forwards or
    /// tunnels them, and writes error responses where the protocol still
    /// allows one.
    pub async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        match self.serve_requests(&mut stream, peer).await {
            Ok(Some(tunnel)) => self.serve_tunnel(stream, tunnel).await,
            Ok(None) => Ok(()),
            Err(err) => {
                if let Some(status) = err.response_status() {
                    send_error(&mut stream, status, &error_chain_text(&err))
                        .await
                        .ok();
                }
                Err(err.into())
            }
        }
    }

    /// Serves forward requests until the client is done, a CONNECT request
    /// hands the connection over to tunneling, or an error ends it.
    async fn serve_requests(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
    ) -> Result<Option<PendingTunnel>, ProxyError> {
        let (read_half, mut write_half) = stream.split();
        let mut reader = PeekReader::new(read_half, HEADER_SECTION_MAX_LENGTH);
        loop {
            let request = match self.read_head(&mut reader).await? {
                None => return Ok(None),
                Some(request) => request,
            };
            let request = match request {
                HttpRequest::Forward(request) => request,
                HttpRequest::Origin(request) => {
                    debug!(path = %request.path, "rejecting origin-form request");
                    return Err(ProxyError::bad_request(anyerr!(
                        "Origin-form request target on a forward proxy"
                    )));
                }
            };
            let ctx = Arc::new(RequestCtx {
                method: request.method(),
                target: request.target(),
                client_ip: peer.ip(),
                time: (self.opts.clock)(),
            });
            debug!(method = %ctx.method, target = %ctx.target, "request");
            let dialer = self.dialer(ctx.clone());
            match &request.kind {
                HttpProxyRequestKind::Tunnel { target } => {
                    let target = target.clone();
                    let (leftover, _) = reader.into_parts();
                    return Ok(Some(PendingTunnel {
                        dialer,
                        target,
                        leftover,
                    }));
                }
                HttpProxyRequestKind::Absolute { .. } => {
                    let keep_alive = self
                        .transport
                        .round_trip(&dialer, &request, &mut reader, &mut write_half)
                        .await?;
                    if !keep_alive {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Reads one request head, honoring the configured head-read timeout.
    async fn read_head(
        &self,
        reader: &mut PeekReader<tokio::net::tcp::ReadHalf<'_>>,
    ) -> Result<Option<HttpRequest>, ProxyError> {
        let head = match self.opts.head_read_timeout {
            Some(timeout) => HttpRequest::read(reader)
                .timeout(timeout)
                .await
                .map_err(|_| {
                    ProxyError::request_timeout(anyerr!("Timed out reading request head"))
                })?,
            None => HttpRequest::read(reader).await,
        };
        head.map_err(ProxyError::bad_request)
    }

    fn dialer(&self, ctx: Arc<RequestCtx>) -> Dialer {
        Dialer::new(
            ctx,
            self.control.clone(),
            self.opts.clock.clone(),
            self.opts.dial_timeout,
        )
    }

    /// Dials the tunnel target, acknowledges the CONNECT, and splices the
    /// client with the origin. Failures after the acknowledgment are only
    /// observable as a closed connection.
    async fn serve_tunnel(&self, mut stream: TcpStream, tunnel: PendingTunnel) -> Result<()> {
        let mut upstream = match tunnel.dialer.dial(&tunnel.target).await {
            Ok(upstream) => upstream,
            Err(err) => {
                send_error(
                    &mut stream,
                    StatusCode::SERVICE_UNAVAILABLE,
                    &error_chain_text(&err),
                )
                .await
                .ok();
                return Err(err.into());
            }
        };
        debug!(target = %tunnel.target, "tunnel established");

        stream
            .write_all(CONNECT_OK)
            .await
            .std_context("failed to write CONNECT response")?;
        stream
            .flush()
            .await
            .std_context("failed to flush CONNECT response")?;

        // Client bytes that arrived behind the CONNECT head go out first.
        if !tunnel.leftover.is_empty() {
            upstream
                .write_all(&tunnel.leftover)
                .await
                .std_context("failed to forward early client bytes")?;
        }

        match splice(stream, upstream).await {
            Ok((to_origin, from_origin)) => {
                debug!(to_origin, from_origin, "tunnel closed");
            }
            Err(err) => {
                debug!("tunnel closed with error: {err:#}");
            }
        }
        Ok(())
    }
}

/// A CONNECT request that passed parsing and is ready to be dialed.
struct PendingTunnel {
    dialer: Dialer,
    target: Authority,
    leftover: Bytes,
}

/// Error for client-facing proxy failures, carrying the HTTP status to reply
/// with. `None` means the protocol no longer allows a response and the
/// connection just closes.
#[stack_error(add_meta, derive)]
pub struct ProxyError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        Self::io(value)
    }
}

impl ProxyError {
    /// Returns the HTTP status code to surface to the client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub(crate) fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }

    pub(crate) fn request_timeout(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::REQUEST_TIMEOUT), source.into())
    }

    pub(crate) fn service_unavailable(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::SERVICE_UNAVAILABLE), source.into())
    }

    pub(crate) fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }
}

/// Flattens an error and its source chain into one line.
fn error_chain_text(err: &(dyn std::error::Error)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        text.push_str(": ");
        text.push_str(&err.to_string());
        source = err.source();
    }
    text
}

/// Writes a minimal `text/plain` error response carrying `message`.
pub(crate) async fn send_error(
    writer: &mut (impl AsyncWrite + Send + Unpin),
    status: StatusCode,
    message: &str,
) -> io::Result<()> {
    let response = HttpResponse::new(status);
    let body = format!("{message}\n");
    writer.write_all(response.status_line().as_bytes()).await?;
    writer
        .write_all(b"Content-Type: text/plain\r\nConnection: close\r\n")
        .await?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
