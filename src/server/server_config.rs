use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    /// TCP frame ingest and UDP control share this port. 0 picks an ephemeral port for TCP, and
    ///  the control socket then binds to the same port number.
    pub server_port: u16,
    pub discovery_port: u16,

    pub server_name: String,
    pub version: String,

    /// Payloads that reach this size without completing are dropped
    pub max_payload_len: usize,
    pub read_chunk_size: usize,
    pub control_recv_buffer_len: usize,
    pub discovery_recv_buffer_len: usize,
    /// Upper bound for waiting on a frame connection. A stalled peer holds a connection slot for
    ///  at most this long. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Connections beyond this number wait in the OS's accept backlog
    pub max_connections: usize,

    pub metrics_interval: Duration,
    pub fps_window: Duration,

    pub session_timeout: Duration,
    pub session_sweep_interval: Duration,

    /// Reply to CONNECT with the session token. Peers that do not know about tokens may not
    ///  expect a reply, so this is off by default.
    pub send_connect_ack: bool,
    /// Draw detection boxes on frames before they are pushed to the display sink
    pub annotate_frames: bool,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 8888,
            discovery_port: 8889,
            server_name: "YOLO Feed Server".to_string(),
            version: "1.0".to_string(),
            max_payload_len: 2_000_000,
            read_chunk_size: 32 * 1024,
            control_recv_buffer_len: 4096,
            discovery_recv_buffer_len: 1024,
            read_timeout: Some(Duration::from_secs(30)),
            max_connections: 64,
            metrics_interval: Duration::from_millis(100),
            fps_window: Duration::from_secs(1),
            session_timeout: Duration::from_secs(60),
            session_sweep_interval: Duration::from_secs(5),
            send_connect_ack: false,
            annotate_frames: true,
        }
    }

    /// Configuration for tests: everything on localhost with ephemeral ports
    pub fn localhost_ephemeral() -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 0,
            discovery_port: 0,
            ..ServerConfig::new()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_port != 0 && self.server_port == self.discovery_port {
            bail!("server port and discovery port must differ, both are {}", self.server_port);
        }
        if self.max_payload_len < 2 {
            bail!("max payload length must leave room for an image trailer");
        }
        if self.read_chunk_size == 0 {
            bail!("read chunk size must be positive");
        }
        if self.control_recv_buffer_len == 0 || self.discovery_recv_buffer_len == 0 {
            bail!("datagram receive buffers must not be empty");
        }
        if self.max_connections == 0 {
            bail!("max connections must be positive");
        }
        if self.read_timeout == Some(Duration::ZERO) {
            bail!("a read timeout of zero would close every connection immediately");
        }
        if self.metrics_interval.is_zero() || self.fps_window.is_zero() || self.session_sweep_interval.is_zero() {
            bail!("intervals must be positive");
        }
        if self.session_timeout < self.session_sweep_interval {
            bail!("session timeout ({:?}) must not be shorter than the sweep interval ({:?})", self.session_timeout, self.session_sweep_interval);
        }
        Ok(())
    }
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
