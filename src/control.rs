//! Connection lifecycle policy.
//!
//! Every upstream connection the proxy opens is governed by a
//! [`ConnControl`]: it decides the outbound route when the connection is
//! opened, sees every read before and after it happens, and is told when the
//! connection closes. Quota, throttling, and accounting policies plug in
//! here.

use std::{net::IpAddr, sync::Arc, time::SystemTime};

use http::Method;
use n0_error::Result;

use crate::upstream::ParentProxy;

/// Clock used to stamp request contexts and connection events.
///
/// Injectable so embedders can pin time in tests or drive accounting off a
/// different time source.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

pub(crate) fn system_clock() -> Clock {
    Arc::new(SystemTime::now)
}

/// Immutable snapshot of the request that caused a connection to be opened.
///
/// Created when the request arrives and shared, unchanged, with every event
/// fired on connections opened for that request.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// HTTP method of the request.
    pub method: Method,
    /// Request target: the absolute URL, or `host:port` for CONNECT.
    pub target: String,
    /// Numeric address of the client that sent the request.
    pub client_ip: IpAddr,
    /// When the request arrived.
    pub time: SystemTime,
}

/// A single connection lifecycle event.
///
/// `amount` is the number of bytes requested on a read-request event and the
/// number of bytes actually read on a read-report event; it is zero otherwise.
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    /// Request that opened the connection.
    pub ctx: &'a RequestCtx,
    /// When this event fired.
    pub time: SystemTime,
    /// Byte count for read events, zero otherwise.
    pub amount: usize,
}

/// Outbound route decided by [`ConnControl::open`].
#[derive(Debug, Clone, Default)]
pub struct Route {
    /// Local network interface to bind the dial to; `None` uses the OS
    /// default local address.
    pub interface: Option<String>,
    /// Parent proxy to dial through; `None` dials the origin directly.
    pub parent: Option<ParentProxy>,
}

/// Policy consulted on every connection lifecycle event.
///
/// Implementations must be safe under concurrent calls from many connections;
/// a blocking implementation blocks only the connection it was called for.
/// The events on one connection are ordered: `open` first, then alternating
/// `read_request`/`read_report` pairs, and `closed` last, exactly once.
pub trait ConnControl: Send + Sync + 'static {
    /// Decides the route for a new upstream connection. An error aborts the
    /// dial before any I/O happens and is surfaced to the client.
    fn open(&self, op: Operation<'_>) -> Result<Route>;

    /// Called before every read on an observed connection with the number of
    /// bytes requested. An error fails the read without touching the
    /// underlying stream.
    fn read_request(&self, op: Operation<'_>) -> Result<()> {
        let _ = op;
        Ok(())
    }

    /// Called after every read with the number of bytes actually read,
    /// regardless of the read's outcome.
    fn read_report(&self, op: Operation<'_>) {
        let _ = op;
    }

    /// Called once, after the underlying connection has been closed.
    fn closed(&self, op: Operation<'_>) {
        let _ = op;
    }
}

/// Control that vetoes nothing and always dials directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoControl;

impl ConnControl for NoControl {
    fn open(&self, _op: Operation<'_>) -> Result<Route> {
        Ok(Route::default())
    }
}

/// Default control: vetoes nothing and takes the parent proxy from the
/// standard `HTTPS_PROXY`/`HTTP_PROXY` environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvControl;

impl ConnControl for EnvControl {
    fn open(&self, op: Operation<'_>) -> Result<Route> {
        Ok(Route {
            interface: None,
            parent: parent_from_env(&op.ctx.method)?,
        })
    }
}

/// Reads the conventional proxy environment variables, preferring the
/// HTTPS set for CONNECT requests. An unset or empty variable means a direct
/// dial; a set but unparsable one is an error.
fn parent_from_env(method: &Method) -> Result<Option<ParentProxy>> {
    let names: &[&str] = if *method == Method::CONNECT {
        &["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"]
    } else {
        &["HTTP_PROXY", "http_proxy"]
    };
    for name in names {
        if let Ok(value) = std::env::var(name) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            return match ParentProxy::parse(value) {
                Ok(parent) => Ok(Some(parent)),
                Err(err) => Err(err.into()),
            };
        }
    }
    Ok(None)
}
