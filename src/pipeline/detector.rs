use image::DynamicImage;
#[cfg(test)] use mockall::automock;

/// An axis-aligned box in absolute pixel coordinates of the image it was detected in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_index: usize,
}

/// The object detection engine. Calls are blocking and may take a long time (model inference),
///  so the server always invokes them from tokio's blocking thread pool.
#[cfg_attr(test, automock)]
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<RawDetection>>;

    /// The human-readable name for a class index returned by [Detector::detect]
    fn label_for(&self, class_index: usize) -> String;
}

/// Detects nothing. This allows running the server for protocol tests without a model.
pub struct NullDetector {}
impl Detector for NullDetector {
    fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }

    fn label_for(&self, class_index: usize) -> String {
        format!("class_{}", class_index)
    }
}
