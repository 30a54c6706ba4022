use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tracing::{debug, error, info, trace};

use crate::error::YfpResult;
use crate::protocol::envelope::{discover_response, Envelope, MessageType};
use crate::server::server_events::{DiscoveryRequestData, ServerEvent, ServerEventNotifier};
use crate::util::shutdown::Shutdown;

/// Answers DISCOVER probes (typically broadcast) with the server's identity, so that peers can
///  find the server without configuration. Everything else on the discovery port is dropped.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    server_name: String,
    version: String,
    recv_buffer_len: usize,
    events: Arc<ServerEventNotifier>,
}

impl DiscoveryResponder {
    pub async fn bind(addr: SocketAddr, server_name: &str, version: &str, recv_buffer_len: usize, events: Arc<ServerEventNotifier>) -> anyhow::Result<DiscoveryResponder> {
        Ok(DiscoveryResponder {
            socket: UdpSocket::bind(addr).await?,
            server_name: server_name.to_string(),
            version: version.to_string(),
            recv_buffer_len,
            events,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        let mut buf = vec![0u8; self.recv_buffer_len];
        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => self.on_datagram(&buf[..n], from).await,
                        Err(e) => error!("error receiving discovery datagram: {}", e),
                    }
                }
                _ = shutdown.wait() => {
                    debug!("discovery responder shutting down");
                    return;
                }
            }
        }
    }

    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        match self.response_for(buf) {
            Ok(Some(response)) => {
                if let Err(e) = self.socket.send_to(&response, from).await {
                    error!("error sending discovery response to {}: {}", from, e);
                    return;
                }
                info!("discovery request from {}", from);
                self.events.send_event(ServerEvent::DiscoveryRequest(DiscoveryRequestData { from }));
            }
            Ok(None) => {
                trace!("ignoring non-discovery datagram from {}", from);
            }
            Err(e) => {
                debug!("ignoring malformed datagram from {}: {}", from, e);
            }
        }
    }

    fn response_for(&self, buf: &[u8]) -> YfpResult<Option<Vec<u8>>> {
        let request = Envelope::parse(buf)?;
        if request.kind() != Some(MessageType::Discover) {
            return Ok(None);
        }
        discover_response(&self.server_name, &self.version)
            .to_bytes()
            .map(Some)
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::time::timeout;

    use crate::util::shutdown::ShutdownTrigger;

    use super::*;

    async fn responder(events: Arc<ServerEventNotifier>) -> DiscoveryResponder {
        DiscoveryResponder::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), "Test Server", "9.9", 1024, events)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_response_for() {
        let responder = responder(Arc::new(ServerEventNotifier::new())).await;

        let response = responder.response_for(br#"{"type":"DISCOVER"}"#).unwrap().unwrap();
        let response: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(response["type"], json!("DISCOVER"));
        assert!(response["timestamp"].as_u64().unwrap() > 0);
        assert_eq!(response["data"], json!({"server_name": "Test Server", "version": "9.9"}));

        assert!(responder.response_for(br#"{"type":"PING"}"#).unwrap().is_none());
        assert!(responder.response_for(br#"{"type":"discover"}"#).unwrap().is_none());
        assert!(responder.response_for(b"DISCOVER").is_err());
    }

    #[tokio::test]
    async fn test_discovery_round_trip() {
        let events = Arc::new(ServerEventNotifier::new());
        let mut event_receiver = events.subscribe();
        let responder = responder(events).await;
        let server_addr = responder.local_addr().unwrap();

        let trigger = ShutdownTrigger::new();
        let task = tokio::spawn(responder.run(trigger.signal()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"garbage", server_addr).await.unwrap();
        client.send_to(br#"{"type":"CONNECT"}"#, server_addr).await.unwrap();
        client.send_to(br#"{"type":"DISCOVER"}"#, server_addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(from, server_addr);
        let response = Envelope::parse(&buf[..n]).unwrap();
        assert_eq!(response.kind(), Some(MessageType::Discover));

        let event = timeout(Duration::from_secs(5), event_receiver.recv()).await.unwrap().unwrap();
        assert_eq!(event, ServerEvent::DiscoveryRequest(DiscoveryRequestData { from: client.local_addr().unwrap() }));

        trigger.trigger();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
