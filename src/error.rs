use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::frame_header::MAX_HEADER_LEN;

pub type YfpResult<T> = Result<T, YfpError>;

/// Coarse classification of [YfpError]s, deciding how far an error's effect reaches.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// socket closed, reset or stalled - ends the connection it happened on
    Transport,
    /// the peer violated the wire format
    Framing,
    /// a payload did not decode as an image - only that frame is dropped
    Decode,
    /// there is no session to send a reply to - only that reply is dropped
    CorrelationMiss,
    /// the detection engine failed - only that frame's results are dropped
    Collaborator,
}

#[derive(Error, Debug)]
pub enum YfpError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid header length {0}, expected 1..={max}", max = MAX_HEADER_LEN)]
    InvalidHeaderLength(u32),

    #[error("peer closed after {actual} of {expected} header bytes")]
    TruncatedHeader { expected: usize, actual: usize },

    #[error("malformed frame header: {0}")]
    MalformedHeader(#[source] serde_json::Error),

    #[error("payload reached {max} bytes without completing an image")]
    OversizedPayload { max: usize },

    #[error("malformed control message: {0}")]
    MalformedMessage(#[source] serde_json::Error),

    #[error("payload does not decode as an image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("no session registered for {0}")]
    CorrelationMiss(IpAddr),

    #[error("detection failed: {0}")]
    Collaborator(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl YfpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            YfpError::Transport(_) | YfpError::Timeout(_) => ErrorKind::Transport,
            YfpError::InvalidHeaderLength(_)
            | YfpError::TruncatedHeader { .. }
            | YfpError::MalformedHeader(_)
            | YfpError::OversizedPayload { .. }
            | YfpError::MalformedMessage(_) => ErrorKind::Framing,
            YfpError::Decode(_) => ErrorKind::Decode,
            YfpError::CorrelationMiss(_) => ErrorKind::CorrelationMiss,
            YfpError::Collaborator(_) => ErrorKind::Collaborator,
        }
    }

    /// Errors that end the connection's framing loop. An oversized payload is discarded, but the
    ///  stream is still in sync, so framing resumes with the next header.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            YfpError::OversizedPayload { .. } => false,
            _ => matches!(self.kind(), ErrorKind::Transport | ErrorKind::Framing),
        }
    }

    pub fn collaborator(e: anyhow::Error) -> YfpError {
        YfpError::Collaborator(e.into())
    }
}
