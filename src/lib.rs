pub mod config;
pub mod error;
pub mod frame;
pub mod frame_slot;
pub mod source;
pub mod stream;
pub mod worker;
pub mod registry;
pub mod detection;
pub mod matcher;
pub mod store;
pub mod service;

#[cfg(feature = "onnx")]
pub mod onnx_extractor;

pub use config::FacewatchConfig;
pub use error::{ExtractorError, FacewatchError, Result, SourceError};
pub use frame::{FrameData, FrameFormat};
pub use frame_slot::{FrameSlot, FrameSlotStatsSnapshot};
pub use source::{DefaultConnector, FrameSource, SourceConnector, StreamUri, SyntheticSource};
pub use stream::{StreamRecord, StreamState, StreamStatus};
pub use worker::StreamWorker;
pub use registry::StreamRegistry;
pub use detection::{
    compare_embeddings, BoundingBox, ConfidenceBand, DetectionEngine, FaceCandidate,
    FaceExtractor, QualityVerdict,
};
pub use matcher::{DetectionEvent, MatchOutcome, MatchPipeline, Person};
pub use store::{
    DetectionSink, JsonDetectionLog, JsonPersonDirectory, JsonStreamStore, PersonDirectory,
    StreamStore,
};
pub use service::{FacewatchService, FacewatchServiceBuilder};

#[cfg(feature = "onnx")]
pub use onnx_extractor::OnnxFaceExtractor;
