use crate::error::SourceError;
use crate::frame::{FrameData, FrameFormat};
use crate::source::FrameSource;
use std::time::SystemTime;
use tracing::debug;

/// Synthetic frame generator backing demo streams and capture devices when no
/// real capture backend is compiled in.
///
/// Produces a slowly cycling background with a moving bar and a per-source
/// header band, so distinct streams are visually distinguishable and motion
/// is apparent in a viewer.
pub struct SyntheticSource {
    label: String,
    width: u32,
    height: u32,
    frame_counter: u64,
    closed: bool,
}

impl SyntheticSource {
    pub fn new(label: &str, resolution: (u32, u32)) -> Self {
        debug!(
            "Synthetic source '{}' created at {}x{}",
            label, resolution.0, resolution.1
        );
        Self {
            label: label.to_string(),
            width: resolution.0,
            height: resolution.1,
            frame_counter: 0,
            closed: false,
        }
    }

    fn label_seed(&self) -> u8 {
        self.label.bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<FrameData, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }

        let frame_id = self.frame_counter;
        self.frame_counter += 1;

        let width = self.width as usize;
        let height = self.height as usize;
        let mut data = vec![0u8; width * height * 3];

        let seed = self.label_seed();
        let base = (
            seed.wrapping_add((frame_id % 256) as u8) / 2,
            96u8,
            seed.wrapping_sub((frame_id % 256) as u8) / 2,
        );
        let bar_x = (frame_id as usize * 8) % width.max(1);
        let band_rows = (height / 12).max(1);

        for y in 0..height {
            for x in 0..width {
                let offset = (y * width + x) * 3;
                if y < band_rows {
                    // Header band striped by the label seed
                    let stripe = ((x / 16) as u8).wrapping_mul(seed) % 64;
                    data[offset] = 160 + stripe / 2;
                    data[offset + 1] = 160 + stripe / 2;
                    data[offset + 2] = 180;
                } else if x >= bar_x && x < bar_x + 12 {
                    data[offset] = 220;
                    data[offset + 1] = 220;
                    data[offset + 2] = 220;
                } else {
                    data[offset] = base.0;
                    data[offset + 1] = base.1;
                    data[offset + 2] = base.2;
                }
            }
        }

        Ok(FrameData::new(
            frame_id,
            SystemTime::now(),
            data,
            self.width,
            self.height,
            FrameFormat::Rgb24,
        ))
    }

    fn close(&mut self) {
        if !self.closed {
            debug!("Synthetic source '{}' closed", self.label);
            self.closed = true;
        }
    }
}
