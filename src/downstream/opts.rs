use std::time::Duration;

use crate::{
    control::{Clock, system_clock},
    upstream::DEFAULT_DIAL_TIMEOUT,
};

/// Options for the idle upstream connection pool.
#[derive(Debug, Clone)]
pub struct PoolOpts {
    /// Idle connections kept per origin authority.
    pub max_idle_per_host: usize,
    /// How long an idle connection stays eligible for reuse.
    pub idle_timeout: Duration,
}

impl Default for PoolOpts {
    fn default() -> Self {
        Self {
            max_idle_per_host: 4,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Options for [`Proxy`](super::Proxy).
#[derive(derive_more::Debug, Clone)]
pub struct ProxyOpts {
    /// Time limit for establishing upstream connections.
    pub dial_timeout: Duration,
    /// Time limit for reading a request head from a client. Also bounds how
    /// long an idle keep-alive client connection is held. `None` waits
    /// forever.
    pub head_read_timeout: Option<Duration>,
    /// Connection pool for the forward (non-CONNECT) leg.
    pub pool: PoolOpts,
    /// Clock used to stamp request contexts and connection events.
    #[debug("Clock")]
    pub clock: Clock,
}

impl Default for ProxyOpts {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            head_read_timeout: Some(Duration::from_secs(30)),
            pool: PoolOpts::default(),
            clock: system_clock(),
        }
    }
}
