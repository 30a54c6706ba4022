use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use image::DynamicImage;
use tokio::sync::RwLock;

use crate::error::YfpResult;
use crate::pipeline::detector::{Detector, RawDetection};
use crate::pipeline::display_sink::{DisplayMetrics, DisplaySink};
use crate::pipeline::frame_pipeline::{DetectionSender, FrameOrigin};
use crate::protocol::envelope::Detection;

/// Returns the same detections for every image
pub struct FixedDetector {
    detections: Vec<RawDetection>,
    labels: Vec<String>,
}
impl FixedDetector {
    pub fn new(detections: Vec<RawDetection>, labels: &[&str]) -> FixedDetector {
        FixedDetector {
            detections,
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Detector for FixedDetector {
    fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Vec<RawDetection>> {
        Ok(self.detections.clone())
    }

    fn label_for(&self, class_index: usize) -> String {
        self.labels.get(class_index)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_index))
    }
}

/// Keeps everything that is pushed to it
#[derive(Default)]
pub struct RecordingDisplaySink {
    frames: Mutex<Vec<DynamicImage>>,
    metrics: Mutex<Vec<DisplayMetrics>>,
}
impl RecordingDisplaySink {
    pub fn new() -> RecordingDisplaySink {
        Default::default()
    }

    pub fn frames(&self) -> Vec<DynamicImage> {
        self.frames.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> Vec<DisplayMetrics> {
        self.metrics.lock().unwrap().clone()
    }
}

impl DisplaySink for RecordingDisplaySink {
    fn push_frame(&self, frame: DynamicImage) {
        self.frames.lock().unwrap().push(frame);
    }

    fn update_metrics(&self, metrics: &DisplayMetrics) {
        self.metrics.lock().unwrap().push(*metrics);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentDetections {
    pub detections: Vec<Detection>,
    pub frame_id: i64,
    pub processing_time_ms: u64,
    pub origin: FrameOrigin,
}

/// Records detections instead of sending them, and pretends they were sent to the peer's address
#[derive(Default)]
pub struct RecordingDetectionSender {
    tracker: RwLock<Vec<SentDetections>>,
}
impl RecordingDetectionSender {
    pub fn new() -> RecordingDetectionSender {
        Default::default()
    }

    pub async fn sent(&self) -> Vec<SentDetections> {
        self.tracker.read().await.clone()
    }
}

#[async_trait]
impl DetectionSender for RecordingDetectionSender {
    async fn send_detections(&self, detections: &[Detection], frame_id: i64, processing_time_ms: u64, origin: FrameOrigin) -> YfpResult<SocketAddr> {
        self.tracker.write().await.push(SentDetections {
            detections: detections.to_vec(),
            frame_id,
            processing_time_ms,
            origin,
        });
        Ok(origin.peer)
    }
}
