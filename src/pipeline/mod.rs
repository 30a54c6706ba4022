//! Everything that happens to a frame after it was received: decoding, detection, reporting
//!  results back to the peer, metrics and display.

pub mod detector;
pub mod display_sink;
pub mod frame_pipeline;
pub mod metrics;
