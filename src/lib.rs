//! Utilities for observable HTTP/HTTPS forward proxying over TCP.
//!
//! Two operating modes share one server: plain forwarding, which round-trips
//! absolute-form requests over a pooled transport, and CONNECT tunneling,
//! which splices the raw client stream with the origin. Every upstream
//! connection is dialed through a per-request pipeline that consults a
//! [`ConnControl`](control::ConnControl) for the outbound interface and an
//! optional parent proxy (HTTP CONNECT or SOCKS5), and reports every read
//! and the close back to it.

/// Connection lifecycle policy consulted around every upstream connection.
pub mod control;
/// Client-facing proxy server: request handling and CONNECT tunneling.
pub mod downstream;
/// Outbound dialing: interface binding, parent proxies, the dial pipeline.
pub mod upstream;

mod conn;
mod parse;
mod transport;
mod util;

pub use conn::{ObservedConn, ProxyStream};
pub use parse::{
    Authority, HttpOriginRequest, HttpProxyRequest, HttpProxyRequestKind, HttpRequest,
    HttpResponse, is_hop_by_hop,
};

/// How much data to read for a request or response head before it's
/// considered invalid. 8KB should be plenty.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;
