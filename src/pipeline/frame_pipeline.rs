use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::error::{YfpError, YfpResult};
use crate::pipeline::detector::{Detector, RawDetection};
use crate::pipeline::display_sink::{annotate, Annotation, DisplaySink};
use crate::pipeline::metrics::MetricsAggregator;
use crate::protocol::envelope::Detection;
use crate::protocol::frame_reader::RawFrame;
use crate::protocol::session_token::SessionToken;
use crate::server::server_events::{FrameDroppedData, ServerEvent, ServerEventNotifier};
use crate::util::time::as_millis_u64;

/// Where a frame came from, i.e. what detection results are correlated with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOrigin {
    pub peer: SocketAddr,
    pub session_token: Option<SessionToken>,
}

/// Sends a frame's detection results back to the peer that sent the frame
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DetectionSender: Send + Sync + 'static {
    /// Returns the address the results were sent to, or [YfpError::CorrelationMiss] if the
    ///  origin has no session
    async fn send_detections(&self, detections: &[Detection], frame_id: i64, processing_time_ms: u64, origin: FrameOrigin) -> YfpResult<SocketAddr>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub frame_id: i64,
    pub detections: Vec<Detection>,
    pub processing_time_ms: u64,
    /// `None` if the results could not be sent
    pub reply_to: Option<SocketAddr>,
}

pub struct FramePipeline {
    detector: Arc<dyn Detector>,
    sender: Arc<dyn DetectionSender>,
    sink: Arc<dyn DisplaySink>,
    metrics: Arc<MetricsAggregator>,
    events: Arc<ServerEventNotifier>,
    annotate_frames: bool,
}

impl FramePipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        sender: Arc<dyn DetectionSender>,
        sink: Arc<dyn DisplaySink>,
        metrics: Arc<MetricsAggregator>,
        events: Arc<ServerEventNotifier>,
        annotate_frames: bool,
    ) -> FramePipeline {
        FramePipeline {
            detector,
            sender,
            sink,
            metrics,
            events,
            annotate_frames,
        }
    }

    /// Runs detection on a decoded frame and distributes the results. A frame that the detector
    ///  fails on is logged and dropped - the caller just continues with the next frame.
    pub async fn process(&self, frame: RawFrame, peer: SocketAddr) -> Option<FrameOutcome> {
        let frame_id = frame.header.frame_id();
        match self.try_process(frame, peer).await {
            Ok(outcome) => {
                debug!("frame {} from {}: {} detections in {}ms", frame_id, peer, outcome.detections.len(), outcome.processing_time_ms);
                Some(outcome)
            }
            Err(e) => {
                warn!("dropping frame {} from {}: {}", frame_id, peer, e);
                self.events.send_event(ServerEvent::FrameDropped(FrameDroppedData {
                    peer,
                    frame_id,
                    kind: e.kind(),
                    reason: e.to_string(),
                }));
                None
            }
        }
    }

    async fn try_process(&self, frame: RawFrame, peer: SocketAddr) -> YfpResult<FrameOutcome> {
        let frame_id = frame.header.frame_id();
        let origin = FrameOrigin {
            peer,
            session_token: frame.header.session_token(),
        };

        // decoding happened while the frame was read, it counts towards the processing time
        let started = Instant::now();
        let detector = self.detector.clone();
        let image = frame.image;
        let (image, raw_detections) = tokio::task::spawn_blocking(move || -> YfpResult<_> {
            let raw_detections = detector.detect(&image)
                .map_err(YfpError::collaborator)?;
            Ok((image, raw_detections))
        })
            .await
            .map_err(|e| YfpError::Collaborator(Box::new(e)))??;
        let processing_time_ms = as_millis_u64(frame.decode_time + started.elapsed());

        let detections = raw_detections.iter()
            .map(|raw| to_relative(raw, image.width(), image.height(), self.detector.label_for(raw.class_index)))
            .collect::<Vec<_>>();

        self.metrics.record_frame(detections.len(), processing_time_ms).await;

        let reply_to = match self.sender.send_detections(&detections, frame_id, processing_time_ms, origin).await {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("detections for frame {} from {} were not sent: {}", frame_id, peer, e);
                None
            }
        };

        let image = if self.annotate_frames {
            let annotations = raw_detections.iter()
                .zip(&detections)
                .map(|(raw, detection)| Annotation::new(raw, &detection.class_name))
                .collect::<Vec<_>>();
            annotate(image, &annotations)
        }
        else {
            image
        };
        self.sink.push_frame(image);

        Ok(FrameOutcome {
            frame_id,
            detections,
            processing_time_ms,
            reply_to,
        })
    }
}

/// Converts a box in absolute pixels to coordinates relative to the image size. Boxes reaching
///  beyond the image are cut at its border, so all values are in `[0, 1]`.
pub fn to_relative(raw: &RawDetection, image_width: u32, image_height: u32, class_name: String) -> Detection {
    let w = image_width.max(1) as f64;
    let h = image_height.max(1) as f64;

    let clamp = |v: f32, max: f64| (v as f64).clamp(0.0, max);
    let x1 = clamp(raw.bbox.x1.min(raw.bbox.x2), w);
    let x2 = clamp(raw.bbox.x1.max(raw.bbox.x2), w);
    let y1 = clamp(raw.bbox.y1.min(raw.bbox.y2), h);
    let y2 = clamp(raw.bbox.y1.max(raw.bbox.y2), h);

    Detection {
        x: x1 / w,
        y: y1 / h,
        width: (x2 - x1) / w,
        height: (y2 - y1) / h,
        class_name,
        confidence: (raw.confidence as f64).clamp(0.0, 1.0),
    }
}
