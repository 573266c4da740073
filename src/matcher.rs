use crate::config::MatcherConfig;
use crate::detection::{BoundingBox, ConfidenceBand, DetectionEngine, QualityVerdict};
use crate::error::{FacewatchError, Result};
use crate::frame::FrameData;
use crate::frame_slot::FrameSlot;
use image::Rgb;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::fs;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A watch-list entry supplied by the person registry collaborator
#[derive(Debug, Clone)]
pub struct Person {
    pub id: String,
    pub name: String,
    /// Reference embedding extracted at registration time
    pub embedding: Vec<f32>,
    /// Per-person similarity threshold override
    pub threshold: Option<f32>,
    pub last_seen_location: Option<String>,
}

/// A qualifying match between a video frame and a registered person.
/// Ownership passes to the detection sink as soon as it is emitted.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub id: String,
    pub person_id: String,
    pub person_name: String,
    pub stream_name: String,
    pub timestamp: SystemTime,
    pub similarity: f32,
    pub confidence: ConfidenceBand,
    pub bbox: BoundingBox,
}

/// Discriminated outcome of one pipeline run. Negative results are data, not
/// errors: callers inspect the variant instead of catching faults.
#[derive(Debug)]
pub enum MatchOutcome {
    /// The stream has not produced a frame yet
    NoFrame,
    /// A frame was analyzed but contained no detectable face
    NoFace,
    /// The best face failed the quality gate
    LowQuality { score: f32, threshold: f32 },
    /// The extractor itself failed; the run is abandoned without events
    ExtractorFailed { details: String },
    /// The frame was fully evaluated; zero or one event depending on a match
    Completed { events: Vec<DetectionEvent> },
}

impl MatchOutcome {
    pub fn events(self) -> Vec<DetectionEvent> {
        match self {
            MatchOutcome::Completed { events } => events,
            _ => Vec::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        match self {
            MatchOutcome::Completed { events } => events.len(),
            _ => 0,
        }
    }
}

/// Pulls the latest frame for a stream, runs the detection engine,
/// cross-references the watch list, and writes an annotated frame back for
/// downstream viewers.
pub struct MatchPipeline {
    engine: Arc<DetectionEngine>,
    config: MatcherConfig,
    label_font: Option<Font<'static>>,
}

impl MatchPipeline {
    pub fn new(engine: Arc<DetectionEngine>, config: MatcherConfig) -> Self {
        let label_font = match fs::read(&config.label_font_path) {
            Ok(bytes) => {
                let font = Font::try_from_vec(bytes);
                if font.is_none() {
                    warn!(
                        "Could not parse label font '{}', annotations will omit text",
                        config.label_font_path
                    );
                }
                font
            }
            Err(e) => {
                warn!(
                    "Label font '{}' unavailable ({}), annotations will omit text",
                    config.label_font_path, e
                );
                None
            }
        };

        Self {
            engine,
            config,
            label_font,
        }
    }

    /// Evaluate the stream's current frame against the watch list.
    ///
    /// Iterates persons in registry order; the first whose reference embedding
    /// clears the threshold wins and iteration stops. Only the single
    /// highest-scoring face in the frame is evaluated.
    pub fn run(
        &self,
        stream_name: &str,
        slot: &FrameSlot,
        persons: &[Person],
        threshold: f32,
    ) -> MatchOutcome {
        let Some(frame) = slot.get() else {
            return MatchOutcome::NoFrame;
        };

        let candidates = match self.engine.detect(&frame) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Face extraction failed on stream '{}': {}", stream_name, e);
                return MatchOutcome::ExtractorFailed {
                    details: e.to_string(),
                };
            }
        };

        let Some(best) = DetectionEngine::select_best(candidates) else {
            debug!("No face detected on stream '{}'", stream_name);
            return MatchOutcome::NoFace;
        };

        if let QualityVerdict::LowScore { score, threshold } = self.engine.validate_quality(&best)
        {
            debug!(
                "Face on stream '{}' rejected by quality gate ({:.3} < {:.3})",
                stream_name, score, threshold
            );
            return MatchOutcome::LowQuality { score, threshold };
        }

        let mut matched: Option<(String, String, f32, ConfidenceBand)> = None;
        for person in persons {
            let (similarity, band) = self.engine.compare(&person.embedding, &best.embedding);
            let effective = person.threshold.unwrap_or(threshold);
            if similarity > effective {
                matched = Some((person.id.clone(), person.name.clone(), similarity, band));
                break;
            }
        }

        let mut events = Vec::new();
        let label = match &matched {
            Some((person_id, person_name, similarity, band)) => {
                info!(
                    "Detection: {} at {} with {:.1}% confidence",
                    person_name,
                    stream_name,
                    similarity * 100.0
                );
                events.push(DetectionEvent {
                    id: Uuid::new_v4().to_string(),
                    person_id: person_id.clone(),
                    person_name: person_name.clone(),
                    stream_name: stream_name.to_string(),
                    timestamp: frame.timestamp,
                    similarity: *similarity,
                    confidence: *band,
                    bbox: best.bbox,
                });
                format!("{} ({:.1}%)", person_name, similarity * 100.0)
            }
            None => "Unknown".to_string(),
        };

        match self.annotate(&frame, &best.bbox, &label, matched.is_some()) {
            Ok(annotated) => slot.put(annotated),
            Err(e) => debug!("Annotation skipped for '{}': {}", stream_name, e),
        }

        MatchOutcome::Completed { events }
    }

    /// Render a bounding box and label onto a copy of the frame.
    fn annotate(
        &self,
        frame: &FrameData,
        bbox: &BoundingBox,
        label: &str,
        matched: bool,
    ) -> Result<FrameData> {
        let mut img = frame.to_rgb_image()?;
        let (width, height) = img.dimensions();
        if width < 4 || height < 4 {
            return Err(FacewatchError::component(
                "matcher",
                "frame too small to annotate",
            ));
        }

        let x1 = bbox.x1.clamp(0.0, (width - 1) as f32) as i32;
        let y1 = bbox.y1.clamp(0.0, (height - 1) as f32) as i32;
        let x2 = bbox.x2.clamp(0.0, (width - 1) as f32) as i32;
        let y2 = bbox.y2.clamp(0.0, (height - 1) as f32) as i32;
        let box_w = ((x2 - x1).max(1)) as u32;
        let box_h = ((y2 - y1).max(1)) as u32;

        let box_color = Rgb([0u8, 255u8, 0u8]);
        let label_color = if matched {
            Rgb([0u8, 255u8, 0u8])
        } else {
            Rgb([255u8, 0u8, 0u8])
        };

        draw_hollow_rect_mut(&mut img, Rect::at(x1, y1).of_size(box_w, box_h), box_color);
        if box_w > 2 && box_h > 2 {
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(x1 + 1, y1 + 1).of_size(box_w - 2, box_h - 2),
                box_color,
            );
        }

        if let Some(font) = &self.label_font {
            let scale = Scale::uniform(self.config.label_font_size);
            let text_y = (y1 - self.config.label_font_size as i32 - 4).max(0);
            draw_text_mut(&mut img, label_color, x1, text_y, scale, font, label);
        }

        Ok(FrameData::from_rgb_image(frame.id, frame.timestamp, img))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FacewatchConfig;
    use crate::detection::{FaceCandidate, FaceExtractor};
    use crate::error::ExtractorError;
    use crate::frame::FrameFormat;

    struct FixedExtractor(Vec<FaceCandidate>);

    impl FaceExtractor for FixedExtractor {
        fn extract(
            &mut self,
            _frame: &FrameData,
        ) -> std::result::Result<Vec<FaceCandidate>, ExtractorError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenExtractor;

    impl FaceExtractor for BrokenExtractor {
        fn extract(
            &mut self,
            _frame: &FrameData,
        ) -> std::result::Result<Vec<FaceCandidate>, ExtractorError> {
            Err(ExtractorError::inference("model exploded"))
        }
    }

    fn pipeline_with(extractor: Box<dyn FaceExtractor>) -> MatchPipeline {
        let config = FacewatchConfig::default();
        let engine = Arc::new(DetectionEngine::new(extractor, &config.detection));
        MatchPipeline::new(engine, config.matcher)
    }

    fn candidate(det_score: f32, embedding: Vec<f32>) -> FaceCandidate {
        FaceCandidate {
            det_score,
            bbox: BoundingBox::new(8.0, 8.0, 32.0, 32.0),
            embedding,
        }
    }

    fn slot_with_frame() -> FrameSlot {
        let slot = FrameSlot::new();
        slot.put(FrameData::new(
            7,
            SystemTime::now(),
            vec![60u8; 64 * 48 * 3],
            64,
            48,
            FrameFormat::Rgb24,
        ));
        slot
    }

    fn person(id: &str, name: &str, embedding: Vec<f32>, threshold: Option<f32>) -> Person {
        Person {
            id: id.into(),
            name: name.into(),
            embedding,
            threshold,
            last_seen_location: None,
        }
    }

    #[test]
    fn test_empty_slot_yields_no_frame() {
        let pipeline = pipeline_with(Box::new(FixedExtractor(Vec::new())));
        let slot = FrameSlot::new();
        let outcome = pipeline.run("Cam1", &slot, &[], 0.6);
        assert!(matches!(outcome, MatchOutcome::NoFrame));
    }

    #[test]
    fn test_no_face_detected() {
        let pipeline = pipeline_with(Box::new(FixedExtractor(Vec::new())));
        let slot = slot_with_frame();
        let outcome = pipeline.run("Cam1", &slot, &[], 0.6);
        assert!(matches!(outcome, MatchOutcome::NoFace));
    }

    #[test]
    fn test_low_quality_face_rejected() {
        let pipeline = pipeline_with(Box::new(FixedExtractor(vec![candidate(
            0.3,
            vec![1.0, 0.0],
        )])));
        let slot = slot_with_frame();
        let outcome = pipeline.run("Cam1", &slot, &[], 0.6);
        assert!(matches!(outcome, MatchOutcome::LowQuality { .. }));
    }

    #[test]
    fn test_extractor_failure_is_contained() {
        let pipeline = pipeline_with(Box::new(BrokenExtractor));
        let slot = slot_with_frame();
        let outcome = pipeline.run("Cam1", &slot, &[], 0.6);
        assert!(matches!(outcome, MatchOutcome::ExtractorFailed { .. }));
        assert_eq!(outcome.events().len(), 0);
    }

    #[test]
    fn test_qualifying_match_emits_one_event() {
        // Candidate embedding has cosine similarity 0.8 with the reference
        let pipeline = pipeline_with(Box::new(FixedExtractor(vec![candidate(
            0.9,
            vec![0.8, 0.6],
        )])));
        let slot = slot_with_frame();
        let persons = vec![person("p1", "Alice", vec![1.0, 0.0], Some(0.6))];

        let outcome = pipeline.run("Cam1", &slot, &persons, 0.6);
        let events = outcome.events();
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.person_id, "p1");
        assert_eq!(event.person_name, "Alice");
        assert_eq!(event.stream_name, "Cam1");
        assert_eq!(event.confidence, ConfidenceBand::VeryHigh);
        assert!(event.similarity > 0.79 && event.similarity < 0.81);
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_first_match_above_threshold_wins() {
        // The second person matches strictly better, the first still wins
        let pipeline = pipeline_with(Box::new(FixedExtractor(vec![candidate(
            0.9,
            vec![0.8, 0.6],
        )])));
        let slot = slot_with_frame();
        let persons = vec![
            person("p1", "Alice", vec![1.0, 0.0], None),
            person("p2", "Bob", vec![0.8, 0.6], None),
        ];

        let events = pipeline.run("Cam1", &slot, &persons, 0.6).events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].person_id, "p1");
    }

    #[test]
    fn test_below_threshold_completes_without_events() {
        let pipeline = pipeline_with(Box::new(FixedExtractor(vec![candidate(
            0.9,
            vec![0.0, 1.0],
        )])));
        let slot = slot_with_frame();
        let persons = vec![person("p1", "Alice", vec![1.0, 0.0], None)];

        let outcome = pipeline.run("Cam1", &slot, &persons, 0.6);
        assert!(matches!(outcome, MatchOutcome::Completed { .. }));
        assert_eq!(outcome.event_count(), 0);
    }

    #[test]
    fn test_annotated_frame_written_back() {
        let pipeline = pipeline_with(Box::new(FixedExtractor(vec![candidate(
            0.9,
            vec![0.8, 0.6],
        )])));
        let slot = slot_with_frame();
        let original = slot.get().unwrap();
        let persons = vec![person("p1", "Alice", vec![1.0, 0.0], None)];

        pipeline.run("Cam1", &slot, &persons, 0.6);

        let annotated = slot.get().unwrap();
        assert_eq!(annotated.id, original.id);
        assert_ne!(annotated.data, original.data);

        // Overwrite semantics still hold: the worker's next write supersedes
        slot.put(FrameData::new(
            8,
            SystemTime::now(),
            vec![10u8; 64 * 48 * 3],
            64,
            48,
            FrameFormat::Rgb24,
        ));
        assert_eq!(slot.get().unwrap().id, 8);
    }

    #[test]
    fn test_per_person_threshold_override() {
        // Similarity 0.8 fails a strict per-person threshold of 0.9
        let pipeline = pipeline_with(Box::new(FixedExtractor(vec![candidate(
            0.9,
            vec![0.8, 0.6],
        )])));
        let slot = slot_with_frame();
        let persons = vec![person("p1", "Alice", vec![1.0, 0.0], Some(0.9))];

        let outcome = pipeline.run("Cam1", &slot, &persons, 0.6);
        assert_eq!(outcome.event_count(), 0);
    }
}
