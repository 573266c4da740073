use crate::error::{FacewatchError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel format of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Raw RGB, 3 bytes per pixel, row-major
    Rgb24,
    /// JPEG-compressed frame
    Jpeg,
}

impl FrameFormat {
    /// Get bytes per pixel for the format (0 for compressed formats)
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            FrameFormat::Rgb24 => 3,
            FrameFormat::Jpeg => 0,
        }
    }

    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, FrameFormat::Jpeg)
    }
}

/// A single captured frame with metadata
#[derive(Debug, Clone)]
pub struct FrameData {
    /// Per-stream monotonic frame identifier
    pub id: u64,
    /// Timestamp when the frame was read from its source
    pub timestamp: SystemTime,
    /// Pixel data (shared ownership, frames are cloned between slot and consumers)
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format
    pub format: FrameFormat,
}

impl FrameData {
    pub fn new(
        id: u64,
        timestamp: SystemTime,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> Self {
        Self {
            id,
            timestamp,
            data: Arc::new(data),
            width,
            height,
            format,
        }
    }

    /// Expected byte length for uncompressed formats
    pub fn expected_size(&self) -> Option<usize> {
        if self.format.is_compressed() {
            None
        } else {
            Some(self.width as usize * self.height as usize * self.format.bytes_per_pixel())
        }
    }

    /// Validate data length against the declared dimensions
    pub fn validate_size(&self) -> bool {
        match self.expected_size() {
            Some(expected) => self.data.len() == expected,
            None => !self.data.is_empty(),
        }
    }

    /// Frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Decode into an owned RGB image buffer
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        match self.format {
            FrameFormat::Rgb24 => {
                RgbImage::from_raw(self.width, self.height, self.data.as_ref().clone())
                    .ok_or_else(|| {
                        FacewatchError::component(
                            "frame",
                            "RGB frame data does not match declared dimensions",
                        )
                    })
            }
            FrameFormat::Jpeg => {
                let img = image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)
                    .map_err(|e| {
                        FacewatchError::component("frame", &format!("JPEG decode failed: {}", e))
                    })?;
                Ok(img.to_rgb8())
            }
        }
    }

    /// Build a raw RGB frame from an image buffer, keeping the given identity
    pub fn from_rgb_image(id: u64, timestamp: SystemTime, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(id, timestamp, image.into_raw(), width, height, FrameFormat::Rgb24)
    }
}

/// Encode a frame to JPEG bytes. JPEG frames pass through untouched.
pub fn encode_jpeg(frame: &FrameData) -> Result<Vec<u8>> {
    match frame.format {
        FrameFormat::Jpeg => Ok(frame.data.as_ref().clone()),
        FrameFormat::Rgb24 => {
            let img = frame.to_rgb_image()?;
            let mut buf = Vec::new();
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, 85);
            encoder.encode_image(&img).map_err(|e| {
                FacewatchError::component("frame", &format!("JPEG encode failed: {}", e))
            })?;
            Ok(buf)
        }
    }
}

/// Render the "no frame yet" placeholder image as JPEG bytes.
///
/// Returned whenever a registered stream has not produced a frame, so callers
/// always receive a renderable payload instead of an error.
pub fn placeholder_jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
    let mut img = RgbImage::from_pixel(width, height, Rgb([24u8, 26u8, 30u8]));

    if width >= 16 && height >= 16 {
        let border = Rgb([72u8, 76u8, 84u8]);
        draw_hollow_rect_mut(&mut img, Rect::at(0, 0).of_size(width, height), border);
        draw_hollow_rect_mut(&mut img, Rect::at(1, 1).of_size(width - 2, height - 2), border);

        // Centered lens outline, stands in for a text banner
        let box_w = width / 4;
        let box_h = height / 4;
        let bx = ((width - box_w) / 2) as i32;
        let by = ((height - box_h) / 2) as i32;
        let accent = Rgb([110u8, 116u8, 128u8]);
        draw_hollow_rect_mut(&mut img, Rect::at(bx, by).of_size(box_w, box_h), accent);
        if box_w > 4 && box_h > 4 {
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(bx + 2, by + 2).of_size(box_w - 4, box_h - 4),
                accent,
            );
        }
    }

    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    encoder.encode_image(&img).map_err(|e| {
        FacewatchError::component("frame", &format!("Placeholder encode failed: {}", e))
    })?;
    Ok(buf)
}
