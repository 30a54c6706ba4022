use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{YfpError, YfpResult};
use crate::protocol::session_token::SessionToken;

/// size of the big-endian length prefix in front of every frame header
pub const HEADER_LEN_PREFIX_SIZE: usize = 4;
/// Upper bound for the JSON header. Anything beyond is treated as a corrupt or hostile stream.
pub const MAX_HEADER_LEN: u32 = 10_000;

/// The JSON header preceding every image on the frame channel. Peers send either their full
///  envelope (`{"type":"FRAME","timestamp":..,"data":{..}}`) or just `{"data":{..}}`, so
///  everything except `data` is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: FrameData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameData {
    #[serde(default)]
    pub frame_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// arbitrary metadata, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FrameHeader {
    pub fn with_frame_id(frame_id: i64) -> FrameHeader {
        FrameHeader {
            data: FrameData {
                frame_id,
                ..FrameData::default()
            },
            ..FrameHeader::default()
        }
    }

    pub fn frame_id(&self) -> i64 {
        self.data.frame_id
    }

    /// A token that does not parse is treated as absent - correlation then falls back to the
    ///  peer's IP address
    pub fn session_token(&self) -> Option<SessionToken> {
        self.data.session_token.as_deref()
            .and_then(|s| SessionToken::from_str(s).ok())
    }
}

/// Checks the raw length prefix against `(0, MAX_HEADER_LEN]`
pub fn validate_header_len(raw: [u8; HEADER_LEN_PREFIX_SIZE]) -> YfpResult<usize> {
    let len = u32::from_be_bytes(raw);
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(YfpError::InvalidHeaderLength(len));
    }
    Ok(len as usize)
}

pub fn parse_header(buf: &[u8]) -> YfpResult<FrameHeader> {
    serde_json::from_slice(buf)
        .map_err(YfpError::MalformedHeader)
}

/// Writes a complete frame the way a peer sends it: length prefix, JSON header, payload. The
///  payload is expected to carry its own terminator.
pub fn encode_frame<H: Serialize>(header: &H, payload: &[u8], buf: &mut BytesMut) -> YfpResult<()> {
    let json = serde_json::to_vec(header)
        .map_err(YfpError::MalformedHeader)?;

    let len: u32 = json.len().try_into()
        .unwrap_or(u32::MAX);
    if len == 0 || len > MAX_HEADER_LEN {
        return Err(YfpError::InvalidHeaderLength(len));
    }

    buf.reserve(HEADER_LEN_PREFIX_SIZE + json.len() + payload.len());
    buf.put_u32(len);
    buf.put_slice(&json);
    buf.put_slice(payload);
    Ok(())
}
