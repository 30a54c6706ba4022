//! Wire formats of the YOLO feed protocol: JSON envelopes on the connectionless control and
//!  discovery channels, and length-prefixed JSON headers followed by self-terminating image
//!  payloads on the connection-oriented frame channel.
//!
//! Everything here is pure except [frame_reader], which drives the framing rules over any
//!  [tokio::io::AsyncRead].

pub mod envelope;
pub mod frame_header;
pub mod frame_reader;
pub mod payload_format;
pub mod session_token;
