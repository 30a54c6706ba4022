use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{YfpError, YfpResult};
use crate::protocol::session_token::SessionToken;
use crate::util::time::now_millis;

/// All message types of the protocol. The server only acts on some of them, the rest are part of
///  the vocabulary that peers use among themselves or that is reserved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Discover,
    Connect,
    Frame,
    Detections,
    Metrics,
    Ping,
    Pong,
    Error,
}
impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Discover => "DISCOVER",
            MessageType::Connect => "CONNECT",
            MessageType::Frame => "FRAME",
            MessageType::Detections => "DETECTIONS",
            MessageType::Metrics => "METRICS",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
        }
    }

    /// Unknown type strings are not an error: they are ignored by all handlers
    pub fn parse(s: &str) -> Option<MessageType> {
        match s {
            "DISCOVER" => Some(MessageType::Discover),
            "CONNECT" => Some(MessageType::Connect),
            "FRAME" => Some(MessageType::Frame),
            "DETECTIONS" => Some(MessageType::Detections),
            "METRICS" => Some(MessageType::Metrics),
            "PING" => Some(MessageType::Ping),
            "PONG" => Some(MessageType::Pong),
            "ERROR" => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// The flat JSON object exchanged on the connectionless channels:
///  `{ "type": string, "timestamp": integer (ms), "data": object }`.
///
/// Inbound envelopes may omit `timestamp` and `data`; outbound envelopes always carry a
///  timestamp, and `data` only if there is any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl Envelope<Value> {
    pub fn parse(buf: &[u8]) -> YfpResult<Envelope> {
        serde_json::from_slice(buf)
            .map_err(YfpError::MalformedMessage)
    }

    /// Extracts CONNECT details leniently: peers are not required to send them, and garbage in
    ///  this optional part does not invalidate the CONNECT itself.
    pub fn connect_data(&self) -> ConnectData {
        self.data.as_ref()
            .and_then(|data| ConnectData::deserialize(data).ok())
            .unwrap_or_default()
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn new(message_type: MessageType, data: Option<T>) -> Envelope<T> {
        Envelope {
            message_type: message_type.as_str().to_string(),
            timestamp: now_millis(),
            data,
        }
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.message_type)
    }

    pub fn to_bytes(&self) -> YfpResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(YfpError::MalformedMessage)
    }
}

pub fn discover_response(server_name: &str, version: &str) -> Envelope<DiscoverResponseData> {
    Envelope::new(MessageType::Discover, Some(DiscoverResponseData {
        server_name: server_name.to_string(),
        version: version.to_string(),
    }))
}

pub fn pong() -> Envelope<()> {
    Envelope::new(MessageType::Pong, None)
}

pub fn connect_ack(session_token: SessionToken) -> Envelope<ConnectAckData> {
    Envelope::new(MessageType::Connect, Some(ConnectAckData {
        session_token: session_token.to_string(),
    }))
}

pub fn detections(data: DetectionsData) -> Envelope<DetectionsData> {
    Envelope::new(MessageType::Detections, Some(data))
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponseData {
    pub server_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectData {
    pub device_id: Option<String>,
    pub resolution_width: Option<u32>,
    pub resolution_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectAckData {
    pub session_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionsData {
    pub frame_id: i64,
    pub detections: Vec<Detection>,
    pub processing_time_ms: u64,
}

/// A single detected object, in coordinates relative to the image dimensions (0.0 to 1.0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub class_name: String,
    pub confidence: f64,
}
