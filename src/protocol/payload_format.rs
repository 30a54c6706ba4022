use image::{DynamicImage, ImageFormat};

use crate::error::{YfpError, YfpResult};

/// JPEG's end-of-image marker
pub const JPEG_TRAILER: [u8; 2] = [0xFF, 0xD9];

/// The compressed image format carried on the frame channel. Peers do not declare a payload
///  length, so a payload is complete when it ends with the format's trailer *and* decodes: the
///  trailer bytes can occur inside a still incomplete stream (e.g. an embedded thumbnail), so
///  decoding is the authoritative test and the trailer check just keeps it cheap.
///
/// `decode` is CPU bound and is called on the blocking pool.
pub trait PayloadFormat: Send + Sync + 'static {
    fn trailer(&self) -> &[u8];

    fn decode(&self, payload: &[u8]) -> YfpResult<DynamicImage>;
}

pub struct JpegFormat {}
impl PayloadFormat for JpegFormat {
    fn trailer(&self) -> &[u8] {
        &JPEG_TRAILER
    }

    fn decode(&self, payload: &[u8]) -> YfpResult<DynamicImage> {
        image::load_from_memory_with_format(payload, ImageFormat::Jpeg)
            .map_err(YfpError::Decode)
    }
}
