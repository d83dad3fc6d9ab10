use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy, copy_bidirectional},
    net::TcpStream,
};
use tracing::trace;

use crate::conn::{ObservedConn, ProxyStream};

pub(crate) use self::peek::PeekReader;

mod peek;

/// Relays bytes between a client connection and a dialed upstream until both
/// directions have completed. Returns (client-to-upstream, upstream-to-client)
/// byte counts.
///
/// When the upstream supports TCP half-close and has nothing buffered ahead
/// of it, each direction runs as its own pump that half-closes its
/// destination on source EOF, so one side can finish sending while the other
/// keeps reading. Otherwise both directions are relayed together and the
/// streams are fully closed once both reach EOF.
pub(crate) async fn splice(
    client: TcpStream,
    upstream: ObservedConn<ProxyStream>,
) -> io::Result<(u64, u64)> {
    let start = std::time::Instant::now();
    let res = match upstream.try_split() {
        Ok((upstream_read, upstream_write)) => {
            let (client_read, client_write) = client.into_split();
            let (up, down) = tokio::join!(
                pump(client_read, upstream_write),
                pump(upstream_read, client_write),
            );
            up.and_then(|up| down.map(|down| (up, down)))
        }
        Err(mut upstream) => {
            let mut client = client;
            copy_bidirectional(&mut client, &mut upstream).await
        }
    };
    trace!(?res, elapsed=?start.elapsed(), "splice finished");
    res
}

/// Copies `src` to `dst` until EOF, then shuts down `dst` for writes.
async fn pump(
    mut src: impl AsyncRead + Unpin,
    mut dst: impl AsyncWrite + Unpin,
) -> io::Result<u64> {
    let res = copy(&mut src, &mut dst).await;
    dst.shutdown().await.ok();
    res
}
