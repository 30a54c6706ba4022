use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;

use crate::error::YfpResult;
use crate::protocol::frame_header::encode_frame;
use crate::protocol::payload_format::PayloadFormat;

/// A small but valid baseline JPEG with a horizontal gradient, so that the encoder has something
///  to compress
pub fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
    });

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .expect("encoding an in-memory JPEG should not fail");
    buf.into_inner()
}

/// Encodes a frame with a bare `{"data":{"frame_id":..}}` header the way a peer sends it
pub fn encode_test_frame(frame_id: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_frame(&json!({"data": {"frame_id": frame_id}}), payload, &mut buf)
        .expect("test frame header should be valid");
    buf.to_vec()
}

/// A payload format that considers a payload complete as soon as it ends with the trailer,
///  allowing framing tests with arbitrary bytes. Payloads that are no real image decode to a 1x1
///  placeholder.
pub struct TrailerOnlyFormat {
    trailer: Vec<u8>,
}
impl TrailerOnlyFormat {
    pub fn new(trailer: &[u8]) -> TrailerOnlyFormat {
        TrailerOnlyFormat {
            trailer: trailer.to_vec(),
        }
    }
}

impl PayloadFormat for TrailerOnlyFormat {
    fn trailer(&self) -> &[u8] {
        &self.trailer
    }

    fn decode(&self, payload: &[u8]) -> YfpResult<DynamicImage> {
        Ok(image::load_from_memory(payload)
            .unwrap_or_else(|_| placeholder_image()))
    }
}

pub fn placeholder_image() -> DynamicImage {
    DynamicImage::new_rgb8(1, 1)
}

/// Wraps a format, counting how often a payload is decoded
pub struct CountingFormat<F> {
    inner: F,
    decodes: AtomicUsize,
}
impl<F: PayloadFormat> CountingFormat<F> {
    pub fn new(inner: F) -> CountingFormat<F> {
        CountingFormat {
            inner,
            decodes: AtomicUsize::new(0),
        }
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::Acquire)
    }
}

impl<F: PayloadFormat> PayloadFormat for CountingFormat<F> {
    fn trailer(&self) -> &[u8] {
        self.inner.trailer()
    }

    fn decode(&self, payload: &[u8]) -> YfpResult<DynamicImage> {
        self.decodes.fetch_add(1, Ordering::AcqRel);
        self.inner.decode(payload)
    }
}
