use image::{DynamicImage, Rgb, RgbImage};
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};

use crate::pipeline::detector::{BoundingBox, RawDetection};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DisplayMetrics {
    pub fps: f64,
    pub avg_detection_time_ms: f64,
    pub total_detections: u64,
    pub frames_processed: u64,
    pub client_count: usize,
}

/// Presents processed frames and metrics, e.g. in a window. Implementations must return quickly:
///  `push_frame` is called once per processed frame, `update_metrics` on every metrics tick.
#[cfg_attr(test, automock)]
pub trait DisplaySink: Send + Sync + 'static {
    fn push_frame(&self, frame: DynamicImage);

    fn update_metrics(&self, metrics: &DisplayMetrics);
}

/// A display sink for headless operation
pub struct LoggingDisplaySink {}
impl DisplaySink for LoggingDisplaySink {
    fn push_frame(&self, frame: DynamicImage) {
        trace!("frame {}x{}", frame.width(), frame.height());
    }

    fn update_metrics(&self, metrics: &DisplayMetrics) {
        debug!(
            "fps: {:.1}, detection time: {:.0}ms, total detections: {}, frames processed: {}, clients: {}",
            metrics.fps, metrics.avg_detection_time_ms, metrics.total_detections, metrics.frames_processed, metrics.client_count
        );
    }
}

/// A box to draw and the text to put above it
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub label: String,
}

impl Annotation {
    /// labels the box with class and confidence, e.g. `person 0.87`
    pub fn new(detection: &RawDetection, class_name: &str) -> Annotation {
        Annotation {
            bbox: detection.bbox,
            label: format!("{} {:.2}", class_name, detection.confidence),
        }
    }
}

/// Draws the boxes onto the image, each with its label above it
pub fn annotate(image: DynamicImage, annotations: &[Annotation]) -> DynamicImage {
    if annotations.is_empty() {
        return image;
    }

    let mut rgb = image.into_rgb8();
    for annotation in annotations {
        if let Some((left, top)) = draw_box(&mut rgb, &annotation.bbox) {
            // above the box if there is room, inside it otherwise
            let text_top = if top >= LABEL_HEIGHT + LABEL_GAP {
                top - LABEL_HEIGHT - LABEL_GAP
            }
            else {
                top + BOX_THICKNESS as i64 + LABEL_GAP
            };
            draw_text(&mut rgb, &annotation.label, left, text_top);
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

/// returns the box's clamped top left corner, or `None` for an empty image
fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) -> Option<(i64, i64)> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    let max_x = image.width() as i64 - 1;
    let max_y = image.height() as i64 - 1;

    // `as` saturates for out-of-range and NaN floats
    let left = (bbox.x1.min(bbox.x2) as i64).clamp(0, max_x);
    let right = (bbox.x1.max(bbox.x2) as i64).clamp(0, max_x);
    let top = (bbox.y1.min(bbox.y2) as i64).clamp(0, max_y);
    let bottom = (bbox.y1.max(bbox.y2) as i64).clamp(0, max_y);

    for inset in 0..BOX_THICKNESS as i64 {
        let (l, r, t, b) = (left + inset, right - inset, top + inset, bottom - inset);
        if l > r || t > b {
            break;
        }
        for x in l..=r {
            image.put_pixel(x as u32, t as u32, BOX_COLOR);
            image.put_pixel(x as u32, b as u32, BOX_COLOR);
        }
        for y in t..=b {
            image.put_pixel(l as u32, y as u32, BOX_COLOR);
            image.put_pixel(r as u32, y as u32, BOX_COLOR);
        }
    }
    Some((left, top))
}

const GLYPH_WIDTH: i64 = 3;
const GLYPH_HEIGHT: i64 = 5;
const TEXT_SCALE: i64 = 2;
const LABEL_HEIGHT: i64 = GLYPH_HEIGHT * TEXT_SCALE;
const LABEL_GAP: i64 = 2;

/// Renders text with a 3x5 pixel font, clipped at the image border. Letters are drawn upper
///  case, characters without a glyph as blanks.
fn draw_text(image: &mut RgbImage, text: &str, left: i64, top: i64) {
    let advance = (GLYPH_WIDTH + 1) * TEXT_SCALE;

    for (i, c) in text.chars().enumerate() {
        let glyph_left = left + i as i64 * advance;
        if glyph_left >= image.width() as i64 {
            break;
        }

        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for dy in 0..TEXT_SCALE {
                    for dx in 0..TEXT_SCALE {
                        let x = glyph_left + col * TEXT_SCALE + dx;
                        let y = top + row as i64 * TEXT_SCALE + dy;
                        if (0..image.width() as i64).contains(&x) && (0..image.height() as i64).contains(&y) {
                            image.put_pixel(x as u32, y as u32, BOX_COLOR);
                        }
                    }
                }
            }
        }
    }
}

/// rows top to bottom, the three low bits of each row left to right
fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b110, 0b001, 0b010, 0b100, 0b111],
        '3' => [0b110, 0b001, 0b010, 0b001, 0b110],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b110, 0b001, 0b110],
        '6' => [0b011, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b110],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '_' => [0b000, 0b000, 0b000, 0b000, 0b111],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        _ => [0; 5],
    }
}
