//! The network side of the server: discovery, the control channel, frame ingest and the
//!  orchestration that ties them together.

pub mod control_channel;
pub mod discovery;
pub mod frame_ingest;
pub mod server;
pub mod server_config;
pub mod server_events;
