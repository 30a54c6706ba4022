use std::net::{IpAddr, SocketAddr};

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::ErrorKind;
use crate::protocol::session_token::SessionToken;

/// Things that happen inside the server which applications may want to observe, e.g. for a
///  status display. Errors that are contained to a single frame or connection show up here as
///  well, since no error is ever reported back to the peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerEvent {
    ClientConnected(ClientConnectedData),
    ClientEvicted(ClientEvictedData),
    DiscoveryRequest(DiscoveryRequestData),
    ConnectionOpened(ConnectionOpenedData),
    ConnectionClosed(ConnectionClosedData),
    FrameDropped(FrameDroppedData),
    DetectionsSent(DetectionsSentData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientConnectedData {
    pub ip: IpAddr,
    pub control_addr: SocketAddr,
    pub token: SessionToken,
    /// `false` if this CONNECT only refreshed an existing session
    pub is_new: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientEvictedData {
    pub ip: IpAddr,
    pub control_addr: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveryRequestData {
    pub from: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionOpenedData {
    pub peer: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionClosedData {
    pub peer: SocketAddr,
    /// `None` if the peer closed the connection cleanly or the server shut down
    pub error: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameDroppedData {
    pub peer: SocketAddr,
    pub frame_id: i64,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DetectionsSentData {
    pub to: SocketAddr,
    pub frame_id: i64,
    pub num_detections: usize,
}


pub struct ServerEventNotifier {
    sender: broadcast::Sender<ServerEvent>,
}
impl ServerEventNotifier {
    pub fn new() -> ServerEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ServerEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ServerEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
impl Default for ServerEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
