use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{debug, error, info, trace, warn};

use crate::error::YfpResult;
use crate::pipeline::frame_pipeline::{DetectionSender, FrameOrigin};
use crate::protocol::envelope::{self, connect_ack, pong, Detection, DetectionsData, Envelope, MessageType};
use crate::server::server_events::{ClientConnectedData, DetectionsSentData, ServerEvent, ServerEventNotifier};
use crate::session::client_registry::ClientRegistry;
use crate::util::shutdown::Shutdown;

/// The connectionless control channel: peers register with CONNECT and keep their session alive
///  with PING (answered with PONG) or PONG. Detection results for their frames are sent back
///  through the same socket.
pub struct ControlChannel {
    socket: UdpSocket,
    registry: Arc<ClientRegistry>,
    events: Arc<ServerEventNotifier>,
    recv_buffer_len: usize,
    send_connect_ack: bool,
}

impl ControlChannel {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<ClientRegistry>,
        events: Arc<ServerEventNotifier>,
        recv_buffer_len: usize,
        send_connect_ack: bool,
    ) -> anyhow::Result<ControlChannel> {
        Ok(ControlChannel {
            socket: UdpSocket::bind(addr).await?,
            registry,
            events,
            recv_buffer_len,
            send_connect_ack,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut buf = vec![0u8; self.recv_buffer_len];
        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => self.on_datagram(&buf[..n], from).await,
                        Err(e) => error!("error receiving control datagram: {}", e),
                    }
                }
                _ = shutdown.wait() => {
                    debug!("control channel shutting down");
                    return;
                }
            }
        }
    }

    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        let envelope = match Envelope::parse(buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed control datagram from {}: {}", from, e);
                return;
            }
        };

        match envelope.kind() {
            Some(MessageType::Connect) => self.on_connect(&envelope, from).await,
            Some(MessageType::Ping) => self.on_ping(from).await,
            Some(MessageType::Pong) => {
                trace!("received PONG from {}", from);
                self.registry.touch(from).await;
            }
            _ => debug!("ignoring {:?} message from {}", envelope.message_type, from),
        }
    }

    async fn on_connect(&self, envelope: &Envelope, from: SocketAddr) {
        let details = envelope.connect_data();
        let outcome = self.registry.upsert_with_details(from.ip(), from, details.clone()).await;
        if outcome.is_new {
            info!("client connected: {} (device {:?})", from, details.device_id);
        }
        else {
            debug!("client reconnected: {}", from);
        }

        self.events.send_event(ServerEvent::ClientConnected(ClientConnectedData {
            ip: from.ip(),
            control_addr: from,
            token: outcome.token,
            is_new: outcome.is_new,
        }));

        if self.send_connect_ack {
            if let Err(e) = self.send(&connect_ack(outcome.token), from).await {
                warn!("error acknowledging CONNECT from {}: {}", from, e);
            }
        }
    }

    async fn on_ping(&self, from: SocketAddr) {
        trace!("received PING from {}", from);
        self.registry.touch(from).await;
        if let Err(e) = self.send(&pong(), from).await {
            warn!("error sending PONG to {}: {}", from, e);
        }
    }

    async fn send<T: Serialize>(&self, message: &Envelope<T>, to: SocketAddr) -> YfpResult<()> {
        let buf = message.to_bytes()?;
        self.socket.send_to(&buf, to).await?;
        Ok(())
    }
}

#[async_trait]
impl DetectionSender for ControlChannel {
    async fn send_detections(&self, detections: &[Detection], frame_id: i64, processing_time_ms: u64, origin: FrameOrigin) -> YfpResult<SocketAddr> {
        let to = self.registry.resolve_frame(origin.peer.ip(), origin.session_token).await?;

        let message = envelope::detections(DetectionsData {
            frame_id,
            detections: detections.to_vec(),
            processing_time_ms,
        });
        self.send(&message, to).await?;
        self.registry.record_frame_sent(to).await;

        debug!("sent {} detections for frame {} to {}", detections.len(), frame_id, to);
        self.events.send_event(ServerEvent::DetectionsSent(DetectionsSentData {
            to,
            frame_id,
            num_detections: detections.len(),
        }));
        Ok(to)
    }
}
