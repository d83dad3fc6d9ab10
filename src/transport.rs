//! Pooled transport for forward (non-CONNECT) requests.
//!
//! Round-trips one request over a connection produced by the per-request
//! dial pipeline. Idle connections are kept per authority and reused, in
//! which case no new open event fires.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::Mutex,
    time::Instant,
};

use bytes::Bytes;
use http::Uri;
use n0_error::{AnyError, Result, StdResultExt, anyerr};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    conn::{ObservedConn, ProxyStream},
    downstream::{PoolOpts, ProxyError},
    parse::{
        Authority, BodyKind, HttpProxyRequest, HttpProxyRequestKind, HttpResponse,
        filter_hop_by_hop_headers, wants_close,
    },
    upstream::Dialer,
    util::PeekReader,
};

/// An idle upstream connection waiting for reuse.
struct IdleConn {
    conn: ObservedConn<ProxyStream>,
    since: Instant,
}

pub(crate) struct Transport {
    opts: PoolOpts,
    idle: Mutex<HashMap<String, Vec<IdleConn>>>,
}

impl Transport {
    pub(crate) fn new(opts: PoolOpts) -> Self {
        Self {
            opts,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Pops a fresh idle connection for `key`. Stale entries are dropped
    /// here, which fires their close events.
    fn checkout(&self, key: &str) -> Option<ObservedConn<ProxyStream>> {
        let mut idle = self.idle.lock().unwrap();
        let conns = idle.get_mut(key)?;
        while let Some(entry) = conns.pop() {
            if entry.since.elapsed() <= self.opts.idle_timeout {
                return Some(entry.conn);
            }
        }
        None
    }

    fn put(&self, key: String, conn: ObservedConn<ProxyStream>) {
        let mut idle = self.idle.lock().unwrap();
        let conns = idle.entry(key).or_default();
        if conns.len() < self.opts.max_idle_per_host {
            conns.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
    }

    /// Forwards one absolute-form request to its origin and relays the
    /// response back to the client.
    ///
    /// Returns whether the client connection may carry further requests.
    /// Errors carry a response status only while nothing has been written to
    /// the client yet.
    pub(crate) async fn round_trip<R, W>(
        &self,
        dialer: &Dialer,
        request: &HttpProxyRequest,
        client_read: &mut PeekReader<R>,
        client_write: &mut W,
    ) -> Result<bool, ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let HttpProxyRequestKind::Absolute { target, method } = &request.kind else {
            return Err(ProxyError::bad_request(anyerr!(
                "Transport only handles absolute-form requests"
            )));
        };
        let uri = Uri::from_str(target)
            .std_context("Invalid absolute-form request target")
            .map_err(ProxyError::bad_request)?;
        if uri.scheme() != Some(&http::uri::Scheme::HTTP) {
            return Err(ProxyError::bad_request(anyerr!(
                "Only plain http targets can be forwarded; use CONNECT for TLS"
            )));
        }
        let authority = Authority::from_absolute_uri(&uri).map_err(ProxyError::bad_request)?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let request_body = BodyKind::of_request(&request.headers);
        let client_wants_close = wants_close(request.version, &request.headers);
        let head = request_head(method, &path, &authority, request);

        let key = authority.to_addr();
        let mut attempt = 0;
        let (mut conn, response, response_leftover) = loop {
            attempt += 1;
            let (mut conn, reused) = match self.checkout(&key) {
                Some(conn) => {
                    trace!(%authority, "reusing pooled connection");
                    (conn, true)
                }
                None => {
                    let conn = dialer
                        .dial(&authority)
                        .await
                        .map_err(ProxyError::service_unavailable)?;
                    (conn, false)
                }
            };
            match exchange(&mut conn, &head, request_body, client_read).await {
                Ok((response, leftover)) => break (conn, response, leftover),
                // A pooled connection may have been closed by the origin
                // since it went idle. Requests whose body was never touched
                // can go out again on a fresh connection.
                Err(err) if reused && request_body == BodyKind::Empty && attempt < 3 => {
                    debug!("pooled connection failed, dialing fresh: {err:#}");
                    continue;
                }
                Err(err) => return Err(ProxyError::service_unavailable(err)),
            }
        };

        let response_body =
            BodyKind::of_response(method, response.status, &response.headers);
        let origin_wants_close = wants_close(response.version, &response.headers);

        let mut head_out = HttpResponse::new(response.status);
        head_out.reason = response.reason.clone();
        head_out.headers = response.headers.clone();
        filter_hop_by_hop_headers(&mut head_out.headers);
        if response_body == BodyKind::Chunked {
            // Framing survives the hop even though Transfer-Encoding is in
            // the hop-by-hop set; the body is relayed chunk by chunk below.
            head_out.headers.insert(
                http::header::TRANSFER_ENCODING,
                http::HeaderValue::from_static("chunked"),
            );
        }
        head_out
            .write_head(client_write)
            .await
            .map_err(ProxyError::io)?;

        let mut upstream =
            PeekReader::with_front(&mut conn, response_leftover, HEADER_SECTION_MAX_LENGTH);
        match response_body {
            BodyKind::Empty => {}
            BodyKind::Length(len) => copy_exact(&mut upstream, client_write, len)
                .await
                .map_err(ProxyError::io)?,
            BodyKind::Chunked => relay_chunked(&mut upstream, client_write)
                .await
                .map_err(ProxyError::io)?,
            BodyKind::Unbounded => {
                io::copy(&mut upstream, client_write)
                    .await
                    .map_err(ProxyError::io)?;
            }
        }
        client_write.flush().await.map_err(ProxyError::io)?;

        let reusable = !origin_wants_close
            && response_body != BodyKind::Unbounded
            && upstream.peeked().is_empty();
        drop(upstream);
        if reusable {
            self.put(key, conn);
        }

        Ok(!client_wants_close && response_body != BodyKind::Unbounded)
    }
}

/// Serializes the outbound request head in origin-form with hop-by-hop
/// headers stripped and `Host` pinned to the target authority.
fn request_head(
    method: &http::Method,
    path: &str,
    authority: &Authority,
    request: &HttpProxyRequest,
) -> Vec<u8> {
    let mut headers = request.headers.clone();
    filter_hop_by_hop_headers(&mut headers);
    headers.remove(http::header::HOST);
    if BodyKind::of_request(&request.headers) == BodyKind::Chunked {
        headers.insert(
            http::header::TRANSFER_ENCODING,
            http::HeaderValue::from_static("chunked"),
        );
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
    head.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Writes the request to `conn` and reads the response head. Returns the
/// response and any bytes read past it.
async fn exchange<R: AsyncRead + Unpin>(
    conn: &mut ObservedConn<ProxyStream>,
    head: &[u8],
    request_body: BodyKind,
    client_read: &mut PeekReader<R>,
) -> Result<(HttpResponse, Bytes), AnyError> {
    conn.write_all(head)
        .await
        .std_context("Failed to send request to origin")?;
    match request_body {
        BodyKind::Empty => {}
        BodyKind::Length(len) => copy_exact(client_read, conn, len)
            .await
            .std_context("Failed to forward request body")?,
        BodyKind::Chunked => relay_chunked(client_read, conn)
            .await
            .std_context("Failed to forward chunked request body")?,
        // Requests are never close-delimited; the framing decision above
        // only yields the other three kinds.
        BodyKind::Unbounded => {}
    }
    conn.flush()
        .await
        .std_context("Failed to flush request to origin")?;

    let mut reader = PeekReader::new(&mut *conn, HEADER_SECTION_MAX_LENGTH);
    let response = HttpResponse::read(&mut reader).await?;
    let (leftover, _) = reader.into_parts();
    Ok((response, leftover))
}

/// Copies exactly `len` bytes from `src` to `dst`.
async fn copy_exact<R, W>(src: &mut PeekReader<R>, dst: &mut W, len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = AsyncReadExt::take(&mut *src, len);
    let copied = io::copy(&mut limited, dst).await?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Stream ended inside a sized message body",
        ));
    }
    Ok(())
}

/// Relays a chunked body verbatim, stopping after the last chunk and its
/// trailer section.
async fn relay_chunked<R, W>(src: &mut PeekReader<R>, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = src.read_line().await?;
        dst.write_all(&line).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            loop {
                let line = src.read_line().await?;
                dst.write_all(&line).await?;
                if line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
                    break;
                }
            }
            return Ok(());
        }
        // Chunk data plus its trailing CRLF.
        copy_exact(src, dst, size + 2).await?;
    }
}

/// Chunk size from the hex prefix of a chunk size line; extensions after `;`
/// are ignored.
fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Chunk size line is not ASCII"))?;
    let size = line
        .trim()
        .split(|c: char| c == ';' || c.is_ascii_whitespace())
        .next()
        .unwrap_or("");
    u64::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid chunk size"))
}
