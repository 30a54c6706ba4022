//! Peer sessions, created by CONNECT on the control channel and used to route detection results
//!  for frames that arrive on a separate connection.

pub mod client_registry;
pub mod session_sweeper;
