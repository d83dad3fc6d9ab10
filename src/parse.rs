use std::str::FromStr;

use http::{
    HeaderMap, HeaderValue, Method, StatusCode, Version,
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::PeekReader;

/// Hop-by-hop header names, meaningful on a single transport hop only.
///
/// Kept in lowercase because `http::HeaderName` normalizes names, which makes
/// the membership test case-insensitive.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returns true iff `name` must not be forwarded to the next hop.
pub fn is_hop_by_hop(name: &http::HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Removes the hop-by-hop headers from `headers`. Idempotent.
pub(crate) fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Returns true when the message's sender asked for the connection to close
/// after this exchange.
pub(crate) fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let mut keep_alive = false;
    for value in headers.get_all(http::header::CONNECTION) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                return true;
            }
            if token.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }
    }
    version == Version::HTTP_10 && !keep_alive
}

/// Message body framing derived from the header section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    /// No body follows the header section.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked` framing.
    Chunked,
    /// Delimited by connection close.
    Unbounded,
}

impl BodyKind {
    pub(crate) fn of_request(headers: &HeaderMap) -> Self {
        if is_chunked(headers) {
            BodyKind::Chunked
        } else if let Some(len) = content_length(headers) {
            if len == 0 { BodyKind::Empty } else { BodyKind::Length(len) }
        } else {
            BodyKind::Empty
        }
    }

    pub(crate) fn of_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> Self {
        if *method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return BodyKind::Empty;
        }
        if is_chunked(headers) {
            BodyKind::Chunked
        } else if let Some(len) = content_length(headers) {
            if len == 0 { BodyKind::Empty } else { BodyKind::Length(len) }
        } else {
            BodyKind::Unbounded
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

/// Host and port authority parsed from HTTP request targets.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Parses an authority-form URI with no scheme and no path.
    ///
    /// Note: the URI must include a port.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        ensure_any!(uri.path_and_query().is_none(), "Expected URI without path");
        let authority = uri.authority().context("Expected URI with authority")?;
        let host = authority.host();
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parses an absolute-form URI and infers the port from the scheme.
    ///
    /// Note: if no port is present, only `http` and `https` schemes are accepted.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("Expected URI with authority")?;
        let host = authority.host();
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("Expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parses an authority-form request target from a string.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        Self::from_authority_uri(&Uri::from_str(s).std_context("Invalid authority string")?)
    }

    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Proxy request targets per RFC 9110.
#[derive(Debug)]
pub enum HttpProxyRequestKind {
    /// Tunnel CONNECT request with authority-form request target.
    Tunnel { target: Authority },
    /// Forward-proxy request with absolute-form request target.
    Absolute { target: String, method: Method },
}

/// Parsed HTTP proxy request with headers.
#[derive(Debug)]
pub struct HttpProxyRequest {
    /// Parsed proxy request target.
    pub kind: HttpProxyRequestKind,
    /// Protocol version from the request line.
    pub version: Version,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpProxyRequest {
    /// HTTP method of the request.
    pub fn method(&self) -> Method {
        match &self.kind {
            HttpProxyRequestKind::Tunnel { .. } => Method::CONNECT,
            HttpProxyRequestKind::Absolute { method, .. } => method.clone(),
        }
    }

    /// Request target as received on the request line.
    pub fn target(&self) -> String {
        match &self.kind {
            HttpProxyRequestKind::Tunnel { target } => target.to_string(),
            HttpProxyRequestKind::Absolute { target, .. } => target.clone(),
        }
    }
}

/// Direct origin request with origin-form request target.
///
/// A forward proxy rejects these; the type exists so the caller can tell the
/// two apart and report the right error.
#[derive(Debug)]
pub struct HttpOriginRequest {
    /// Origin-form path component.
    pub path: String,
    /// HTTP method from the request line.
    pub method: Method,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

/// Parsed HTTP request with request target classification.
#[derive(Debug)]
pub enum HttpRequest {
    Forward(HttpProxyRequest),
    Origin(HttpOriginRequest),
}

impl HttpRequest {
    /// Reads and parses the request line and header section, removing it from
    /// `reader`.
    ///
    /// Returns `None` on a clean EOF before the first byte. EOF in the middle
    /// of a header section is an error, as is a header section exceeding the
    /// reader's buffer limit.
    pub async fn read(reader: &mut PeekReader<impl AsyncRead + Unpin>) -> Result<Option<Self>> {
        loop {
            if let Some((len, request)) = Self::parse_with_len(reader.peeked())? {
                reader.advance(len);
                return Ok(Some(request));
            }
            if reader.limit_reached() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "Buffer size limit reached before end of request header section",
                )
                .into());
            }
            if reader.fill().await? == 0 {
                if reader.peeked().is_empty() {
                    return Ok(None);
                }
                return Err(anyerr!("Connection closed in the middle of a request head"));
            }
        }
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, req)| req))
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                Self::from_request(req).map(|req| Some((header_len, req)))
            }
        }
    }

    fn from_request(req: httparse::Request) -> Result<Self> {
        let method_str = req.method.context("Missing HTTP method")?;
        let method: Method = method_str.parse().std_context("Invalid HTTP method")?;
        let path = req.path.context("Missing request target")?;
        let uri = Uri::from_str(path).std_context("Invalid request target")?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let headers = HeaderMap::from_iter(req.headers.iter_mut().flat_map(|h| {
            let value = HeaderValue::from_bytes(h.value).ok()?;
            let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            Some((name, value))
        }));
        let request = match method {
            Method::CONNECT => {
                let authority = Authority::from_authority_uri(&uri)?;
                Self::Forward(HttpProxyRequest {
                    kind: HttpProxyRequestKind::Tunnel { target: authority },
                    version,
                    headers,
                })
            }
            _ => {
                if uri.scheme().is_some() {
                    Self::Forward(HttpProxyRequest {
                        kind: HttpProxyRequestKind::Absolute {
                            target: path.to_string(),
                            method,
                        },
                        version,
                        headers,
                    })
                } else {
                    Self::Origin(HttpOriginRequest {
                        path: path.to_string(),
                        method,
                        headers,
                    })
                }
            }
        };
        Ok(request)
    }
}

/// Parsed HTTP response with status, reason, and headers.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Protocol version from the response line.
    pub version: Version,
    /// Raw header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl HttpResponse {
    pub(crate) fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Writes the status line and header section, including the final CRLF.
    pub(crate) async fn write_head(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        writer.write_all(self.status_line().as_bytes()).await?;
        for (key, value) in self.headers.iter() {
            writer.write_all(key.as_str().as_bytes()).await?;
            writer.write_all(b": ").await?;
            writer.write_all(value.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, res)| res))
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("Failed to parse HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res.reason.map(ToOwned::to_owned);
                let version = match res.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    HttpResponse {
                        status,
                        reason,
                        version,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the response status line and header section, removing
    /// it from `reader`.
    pub async fn read(reader: &mut PeekReader<impl AsyncRead + Unpin>) -> Result<Self> {
        loop {
            if let Some((len, response)) = Self::parse_with_len(reader.peeked())? {
                reader.advance(len);
                return Ok(response);
            }
            if reader.limit_reached() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "Buffer size limit reached before end of response header section",
                )
                .into());
            }
            if reader.fill().await? == 0 {
                return Err(anyerr!("Connection closed before a complete response head"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        HeaderMap::from_iter(pairs.iter().map(|(name, value)| {
            (
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            )
        }))
    }

    #[test]
    fn hop_by_hop_membership_is_case_insensitive() {
        for name in ["Connection", "KEEP-ALIVE", "te", "Transfer-Encoding"] {
            let name = http::HeaderName::from_bytes(name.as_bytes()).unwrap();
            assert!(is_hop_by_hop(&name), "{name:?}");
        }
        let custom = http::HeaderName::from_bytes(b"X-Custom").unwrap();
        assert!(!is_hop_by_hop(&custom));
    }

    #[test]
    fn filter_strips_all_eight_and_is_idempotent() {
        let mut headers = header_map(&[
            ("Connection", "close"),
            ("Keep-Alive", "timeout=5"),
            ("Proxy-Authenticate", "Basic"),
            ("Proxy-Authorization", "Basic Zm9v"),
            ("TE", "trailers"),
            ("Trailer", "Expires"),
            ("Transfer-Encoding", "chunked"),
            ("Upgrade", "websocket"),
            ("X-Custom", "1"),
        ]);
        filter_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-custom").unwrap(), "1");
        let snapshot = headers.clone();
        filter_hop_by_hop_headers(&mut headers);
        assert_eq!(headers, snapshot);
    }

    #[test]
    fn wants_close_tokens() {
        let close = header_map(&[("Connection", "close")]);
        assert!(wants_close(Version::HTTP_11, &close));
        let keep = header_map(&[("Connection", "keep-alive")]);
        assert!(!wants_close(Version::HTTP_10, &keep));
        assert!(wants_close(Version::HTTP_10, &HeaderMap::new()));
        assert!(!wants_close(Version::HTTP_11, &HeaderMap::new()));
        let mixed = header_map(&[("Connection", "Upgrade, Close")]);
        assert!(wants_close(Version::HTTP_11, &mixed));
    }

    #[test]
    fn authority_from_connect_target() {
        let authority = Authority::from_authority_str("example.com:443").unwrap();
        assert_eq!(authority.host, "example.com");
        assert_eq!(authority.port, 443);
        assert_eq!(authority.to_addr(), "example.com:443");
    }

    #[test]
    fn authority_requires_port_in_authority_form() {
        assert!(Authority::from_authority_str("example.com").is_err());
    }

    #[test]
    fn authority_from_absolute_infers_port() {
        let uri = Uri::from_str("http://example.com/index.html").unwrap();
        let authority = Authority::from_absolute_uri(&uri).unwrap();
        assert_eq!(authority.port, 80);
        let uri = Uri::from_str("https://example.com:8443/").unwrap();
        let authority = Authority::from_absolute_uri(&uri).unwrap();
        assert_eq!(authority.port, 8443);
    }

    #[test]
    fn classifies_connect_request() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (len, request) = HttpRequest::parse_with_len(buf).unwrap().unwrap();
        assert_eq!(len, buf.len());
        match request {
            HttpRequest::Forward(HttpProxyRequest {
                kind: HttpProxyRequestKind::Tunnel { target },
                ..
            }) => assert_eq!(target.to_addr(), "example.com:443"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classifies_absolute_form_request() {
        let buf = b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let request = HttpRequest::parse(buf).unwrap().unwrap();
        match request {
            HttpRequest::Forward(HttpProxyRequest {
                kind: HttpProxyRequestKind::Absolute { target, method },
                ..
            }) => {
                assert_eq!(target, "http://example.com/path");
                assert_eq!(method, Method::GET);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classifies_origin_form_request() {
        let buf = b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let request = HttpRequest::parse(buf).unwrap().unwrap();
        assert!(matches!(request, HttpRequest::Origin(_)));
    }

    #[test]
    fn partial_request_returns_none() {
        let buf = b"GET http://example.com/path HTTP/1.1\r\nHost: exam";
        assert!(HttpRequest::parse(buf).unwrap().is_none());
    }

    #[test]
    fn response_parse_keeps_leftover_out_of_head() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nbla";
        let (len, response) = HttpResponse::parse_with_len(buf).unwrap().unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&buf[len..], b"bla");
    }

    #[test]
    fn body_kind_of_response() {
        let headers = header_map(&[("Content-Length", "6")]);
        assert_eq!(
            BodyKind::of_response(&Method::GET, StatusCode::OK, &headers),
            BodyKind::Length(6)
        );
        assert_eq!(
            BodyKind::of_response(&Method::HEAD, StatusCode::OK, &headers),
            BodyKind::Empty
        );
        let chunked = header_map(&[("Transfer-Encoding", "chunked")]);
        assert_eq!(
            BodyKind::of_response(&Method::GET, StatusCode::OK, &chunked),
            BodyKind::Chunked
        );
        assert_eq!(
            BodyKind::of_response(&Method::GET, StatusCode::OK, &HeaderMap::new()),
            BodyKind::Unbounded
        );
        assert_eq!(
            BodyKind::of_response(&Method::GET, StatusCode::NO_CONTENT, &HeaderMap::new()),
            BodyKind::Empty
        );
    }
}
