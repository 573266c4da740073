//! ONNX Runtime extractor backend: a lightweight anchor-based face detector
//! plus an ArcFace-style recognition model producing the reference embeddings.
//!
//! Both models are plain ONNX sessions; no tracking, no landmarks.

use crate::detection::{BoundingBox, FaceCandidate, FaceExtractor};
use crate::error::ExtractorError;
use crate::frame::FrameData;
use image::RgbImage;
use std::path::Path;
use tracing::{debug, info};

/// Detection model input resolution.
const DET_INPUT_SIZE: u32 = 128;

/// Recognition model input resolution (square crop).
const REC_INPUT_SIZE: u32 = 112;

/// Detections below this raw confidence are discarded before NMS.
const DET_CONFIDENCE: f32 = 0.5;

/// NMS IoU threshold.
const NMS_IOU_THRESH: f32 = 0.3;

/// Number of anchors for the short-range detection model.
const NUM_ANCHORS: usize = 896;

pub struct OnnxFaceExtractor {
    det_session: ort::session::Session,
    rec_session: ort::session::Session,
    anchors: Vec<[f32; 2]>,
}

impl OnnxFaceExtractor {
    /// Load the detection and recognition models. Fatal at startup when
    /// either model is missing or malformed.
    pub fn new(detector_model: &Path, recognition_model: &Path) -> Result<Self, ExtractorError> {
        let det_session = ort::session::Session::builder()
            .and_then(|b| b.commit_from_file(detector_model))
            .map_err(|e| {
                ExtractorError::init(format!(
                    "failed to load detector model '{}': {}",
                    detector_model.display(),
                    e
                ))
            })?;

        let rec_session = ort::session::Session::builder()
            .and_then(|b| b.commit_from_file(recognition_model))
            .map_err(|e| {
                ExtractorError::init(format!(
                    "failed to load recognition model '{}': {}",
                    recognition_model.display(),
                    e
                ))
            })?;

        info!(
            "ONNX face extractor loaded ({} / {})",
            detector_model.display(),
            recognition_model.display()
        );

        Ok(Self {
            det_session,
            rec_session,
            anchors: generate_anchors(),
        })
    }

    fn detect_boxes(&mut self, img: &RgbImage) -> Result<Vec<RawDet>, ExtractorError> {
        let (fw, fh) = img.dimensions();
        let input = preprocess(img, DET_INPUT_SIZE);

        let input_value = ort::value::Tensor::from_array(input)
            .map_err(|e| ExtractorError::inference(e.to_string()))?;
        let outputs = self
            .det_session
            .run(ort::inputs![input_value])
            .map_err(|e| ExtractorError::inference(e.to_string()))?;

        // Two tensors: box regressors [1, N, 16] and raw scores [1, N, 1]
        if outputs.len() < 2 {
            return Err(ExtractorError::inference(format!(
                "detector expected 2 outputs, got {}",
                outputs.len()
            )));
        }

        let regressors = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| ExtractorError::inference(e.to_string()))?;
        let scores = outputs[1]
            .try_extract_array::<f32>()
            .map_err(|e| ExtractorError::inference(e.to_string()))?;
        let reg_data = regressors
            .as_slice()
            .ok_or_else(|| ExtractorError::inference("non-contiguous regressor output"))?;
        let score_data = scores
            .as_slice()
            .ok_or_else(|| ExtractorError::inference("non-contiguous score output"))?;

        let mut raw_dets = Vec::new();
        let num_anchors = self.anchors.len().min(score_data.len());

        for (i, &raw_score) in score_data.iter().enumerate().take(num_anchors) {
            let score = sigmoid(raw_score);
            if score < DET_CONFIDENCE {
                continue;
            }

            let anchor = &self.anchors[i];
            let reg_offset = i * 16;
            if reg_offset + 4 > reg_data.len() {
                break;
            }

            // Box center + size relative to the anchor
            let cx = anchor[0] + reg_data[reg_offset] / DET_INPUT_SIZE as f32;
            let cy = anchor[1] + reg_data[reg_offset + 1] / DET_INPUT_SIZE as f32;
            let w = reg_data[reg_offset + 2] / DET_INPUT_SIZE as f32;
            let h = reg_data[reg_offset + 3] / DET_INPUT_SIZE as f32;

            raw_dets.push(RawDet {
                x1: ((cx - w / 2.0) * fw as f32).max(0.0),
                y1: ((cy - h / 2.0) * fh as f32).max(0.0),
                x2: ((cx + w / 2.0) * fw as f32).min(fw as f32),
                y2: ((cy + h / 2.0) * fh as f32).min(fh as f32),
                score,
            });
        }

        Ok(nms(&mut raw_dets, NMS_IOU_THRESH))
    }

    fn embed_face(&mut self, img: &RgbImage, det: &RawDet) -> Result<Vec<f32>, ExtractorError> {
        let crop = crop_resize(img, det, REC_INPUT_SIZE);
        let input = preprocess(&crop, REC_INPUT_SIZE);

        let input_value = ort::value::Tensor::from_array(input)
            .map_err(|e| ExtractorError::inference(e.to_string()))?;
        let outputs = self
            .rec_session
            .run(ort::inputs![input_value])
            .map_err(|e| ExtractorError::inference(e.to_string()))?;

        let embedding = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| ExtractorError::inference(e.to_string()))?;
        let raw = embedding
            .as_slice()
            .ok_or_else(|| ExtractorError::inference("non-contiguous embedding output"))?;

        Ok(l2_normalize(raw))
    }
}

impl FaceExtractor for OnnxFaceExtractor {
    fn extract(&mut self, frame: &FrameData) -> Result<Vec<FaceCandidate>, ExtractorError> {
        let img = frame
            .to_rgb_image()
            .map_err(|e| ExtractorError::BadInput {
                details: e.to_string(),
            })?;

        let detections = self.detect_boxes(&img)?;
        debug!("Detector produced {} box(es)", detections.len());

        let mut candidates = Vec::with_capacity(detections.len());
        for det in &detections {
            let embedding = self.embed_face(&img, det)?;
            candidates.push(FaceCandidate {
                det_score: det.score,
                bbox: BoundingBox::new(det.x1, det.y1, det.x2, det.y2),
                embedding,
            });
        }

        Ok(candidates)
    }
}

#[derive(Clone, Debug)]
struct RawDet {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Resize to `size × size`, normalize to [0,1], NCHW float32.
fn preprocess(img: &RgbImage, size: u32) -> ndarray::Array4<f32> {
    let (src_w, src_h) = img.dimensions();
    let s = size as usize;
    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, s, s));

    for y in 0..s {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / s as f64) as u32).min(src_h - 1);
        for x in 0..s {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / s as f64) as u32).min(src_w - 1);
            let pixel = img.get_pixel(src_x, src_y);
            for c in 0..3 {
                tensor[[0, c, y, x]] = pixel[c] as f32 / 255.0;
            }
        }
    }

    tensor
}

/// Crop a detection box (with a small margin) and resize to a square.
fn crop_resize(img: &RgbImage, det: &RawDet, size: u32) -> RgbImage {
    let (fw, fh) = img.dimensions();
    let margin_x = (det.x2 - det.x1) * 0.1;
    let margin_y = (det.y2 - det.y1) * 0.1;

    let x1 = (det.x1 - margin_x).max(0.0) as u32;
    let y1 = (det.y1 - margin_y).max(0.0) as u32;
    let x2 = ((det.x2 + margin_x) as u32).min(fw).max(x1 + 1);
    let y2 = ((det.y2 + margin_y) as u32).min(fh).max(y1 + 1);

    let cropped = image::imageops::crop_imm(img, x1, y1, x2 - x1, y2 - y1).to_image();
    image::imageops::resize(&cropped, size, size, image::imageops::FilterType::Triangle)
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return raw.to_vec();
    }
    raw.iter().map(|v| v / norm).collect()
}

/// Anchors for the short-range detection model: 16×16 and 8×8 feature maps
/// with 2 and 6 anchors per cell.
fn generate_anchors() -> Vec<[f32; 2]> {
    let strides = [(8, 2), (16, 6)];
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, num) in &strides {
        let grid_size = DET_INPUT_SIZE as usize / stride;
        for y in 0..grid_size {
            for x in 0..grid_size {
                let cx = (x as f32 + 0.5) / grid_size as f32;
                let cy = (y as f32 + 0.5) / grid_size as f32;
                for _ in 0..num {
                    anchors.push([cx, cy]);
                }
            }
        }
    }

    anchors
}

fn nms(dets: &mut [RawDet], iou_thresh: f32) -> Vec<RawDet> {
    dets.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; dets.len()];

    for i in 0..dets.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(dets[i].clone());
        for j in (i + 1)..dets.len() {
            if !suppressed[j] && bbox_iou(&dets[i], &dets[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    keep
}

fn bbox_iou(a: &RawDet, b: &RawDet) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    inter / (area_a + area_b - inter)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape_and_range() {
        let img = RgbImage::from_pixel(200, 100, image::Rgb([255, 0, 128]));
        let tensor = preprocess(&img, 128);
        assert_eq!(tensor.shape(), &[1, 3, 128, 128]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 0.01);
        assert!(tensor[[0, 1, 0, 0]].abs() < 0.01);
    }

    #[test]
    fn test_generate_anchors_count() {
        // 16×16 grid × 2 anchors + 8×8 grid × 6 anchors = 512 + 384 = 896
        assert_eq!(generate_anchors().len(), NUM_ANCHORS);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let normalized = l2_normalize(&[3.0, 4.0]);
        let norm: f32 = normalized.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let mut dets = vec![
            RawDet {
                x1: 0.0,
                y1: 0.0,
                x2: 100.0,
                y2: 100.0,
                score: 0.9,
            },
            RawDet {
                x1: 5.0,
                y1: 5.0,
                x2: 105.0,
                y2: 105.0,
                score: 0.7,
            },
            RawDet {
                x1: 200.0,
                y1: 200.0,
                x2: 250.0,
                y2: 250.0,
                score: 0.8,
            },
        ];
        let kept = nms(&mut dets, 0.3);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_crop_resize_output_size() {
        let img = RgbImage::from_pixel(200, 200, image::Rgb([10, 20, 30]));
        let det = RawDet {
            x1: 50.0,
            y1: 50.0,
            x2: 150.0,
            y2: 150.0,
            score: 0.9,
        };
        let crop = crop_resize(&img, &det, REC_INPUT_SIZE);
        assert_eq!(crop.dimensions(), (REC_INPUT_SIZE, REC_INPUT_SIZE));
    }
}
