use core::time::Duration;
use std::net::SocketAddr;
use std::net::{IpAddr, Ipv4Addr};

/// Client and server config.
#[derive(Debug, Clone, Builder)]
#[builder(default)]
pub struct Config {
    /// Server bind address. Port `0` binds an ephemeral port.
    pub(crate) server_address: SocketAddr,
    /// Total time spent retrying a refused connect before the call fails as `Unavailable`.
    pub(crate) connect_timeout: Duration,
    pub(crate) connect_retry_interval: Duration,
    /// How long past the deadline the client keeps trying to deliver a cancel notice.
    pub(crate) cancel_grace: Duration,
    /// Bound on the final flush when a connection gets closed.
    pub(crate) close_timeout: Duration,
    /// How long the server waits for the request envelope of a fresh connection.
    pub(crate) envelope_timeout: Duration,
    pub(crate) max_frame_length: usize,
    pub(crate) message_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8888),
            connect_timeout: Duration::from_secs(3),
            connect_retry_interval: Duration::from_millis(100),
            cancel_grace: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
            envelope_timeout: Duration::from_secs(5),
            max_frame_length: 16 * 1024 * 1024,
            message_buffer_size: 100,
        }
    }
}

impl Config {
    pub fn server_address(&self) -> SocketAddr {
        self.server_address
    }
}
