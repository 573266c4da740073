use crate::config::DetectionConfig;
use crate::error::ExtractorError;
use crate::frame::FrameData;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// Face bounding box in frame pixel coordinates (x1, y1) top-left,
/// (x2, y2) bottom-right
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

/// One detected face: detection score, location, and embedding vector
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    pub det_score: f32,
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

/// The opaque embedding-extraction capability: given a frame, return zero or
/// more detected faces, each with a score, a bounding box, and a fixed-length
/// embedding. Implementations may be stateful, hence `&mut self`.
pub trait FaceExtractor: Send {
    fn extract(&mut self, frame: &FrameData) -> Result<Vec<FaceCandidate>, ExtractorError>;
}

/// Discrete classification of a cosine-similarity score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceBand {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
    /// Either embedding missing or malformed
    Invalid,
}

impl ConfidenceBand {
    /// Band a similarity score. `Invalid` is never produced here; it is
    /// reserved for malformed comparison inputs.
    pub fn from_similarity(similarity: f32) -> Self {
        if similarity > 0.75 {
            ConfidenceBand::VeryHigh
        } else if similarity > 0.65 {
            ConfidenceBand::High
        } else if similarity > 0.55 {
            ConfidenceBand::Medium
        } else if similarity > 0.45 {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::VeryLow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::VeryHigh => "VERY_HIGH",
            ConfidenceBand::High => "HIGH",
            ConfidenceBand::Medium => "MEDIUM",
            ConfidenceBand::Low => "LOW",
            ConfidenceBand::VeryLow => "VERY_LOW",
            ConfidenceBand::Invalid => "INVALID_EMBEDDINGS",
        }
    }
}

impl fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the face quality gate
#[derive(Debug, Clone, PartialEq)]
pub enum QualityVerdict {
    Ok,
    LowScore { score: f32, threshold: f32 },
}

impl QualityVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, QualityVerdict::Ok)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            QualityVerdict::Ok => None,
            QualityVerdict::LowScore { score, threshold } => Some(format!(
                "Low detection score: {:.3} (threshold {:.3})",
                score, threshold
            )),
        }
    }
}

/// Cosine similarity with defensive validation.
///
/// Malformed input (empty vectors, length mismatch, non-finite components,
/// zero norm) degrades to similarity 0.0 with the `Invalid` band instead of
/// failing the caller.
pub fn compare_embeddings(a: &[f32], b: &[f32]) -> (f32, ConfidenceBand) {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return (0.0, ConfidenceBand::Invalid);
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        if !x.is_finite() || !y.is_finite() {
            return (0.0, ConfidenceBand::Invalid);
        }
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return (0.0, ConfidenceBand::Invalid);
    }

    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32;
    (similarity, ConfidenceBand::from_similarity(similarity))
}

/// Wraps the opaque extractor with quality gating and embedding comparison.
pub struct DetectionEngine {
    extractor: Mutex<Box<dyn FaceExtractor>>,
    quality_threshold: f32,
}

impl DetectionEngine {
    pub fn new(extractor: Box<dyn FaceExtractor>, config: &DetectionConfig) -> Self {
        Self {
            extractor: Mutex::new(extractor),
            quality_threshold: config.quality_threshold,
        }
    }

    /// Run the extractor on a frame
    pub fn detect(&self, frame: &FrameData) -> Result<Vec<FaceCandidate>, ExtractorError> {
        let candidates = self.extractor.lock().extract(frame)?;
        debug!("Detected {} face candidate(s)", candidates.len());
        Ok(candidates)
    }

    /// Pick the candidate with the maximum detection score. Only the single
    /// highest-confidence face per frame is evaluated downstream.
    pub fn select_best(candidates: Vec<FaceCandidate>) -> Option<FaceCandidate> {
        candidates.into_iter().max_by(|a, b| {
            a.det_score
                .partial_cmp(&b.det_score)
                .unwrap_or(Ordering::Equal)
        })
    }

    /// Gate a candidate on the configured minimum detection score
    pub fn validate_quality(&self, candidate: &FaceCandidate) -> QualityVerdict {
        if candidate.det_score < self.quality_threshold {
            QualityVerdict::LowScore {
                score: candidate.det_score,
                threshold: self.quality_threshold,
            }
        } else {
            QualityVerdict::Ok
        }
    }

    /// Compare two embeddings: cosine similarity plus confidence band
    pub fn compare(&self, a: &[f32], b: &[f32]) -> (f32, ConfidenceBand) {
        compare_embeddings(a, b)
    }

    pub fn quality_threshold(&self) -> f32 {
        self.quality_threshold
    }
}
