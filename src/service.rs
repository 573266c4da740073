use crate::config::FacewatchConfig;
use crate::detection::{DetectionEngine, FaceCandidate, FaceExtractor};
use crate::error::{ExtractorError, FacewatchError, Result};
use crate::frame::FrameData;
use crate::matcher::{MatchOutcome, MatchPipeline};
use crate::registry::StreamRegistry;
use crate::source::{DefaultConnector, SourceConnector};
use crate::store::{
    DetectionSink, JsonDetectionLog, JsonPersonDirectory, JsonStreamStore, PersonDirectory,
    StreamStore,
};
use crate::stream::StreamStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stands in for the extractor when detection is disabled; every inference
/// attempt reports the pipeline as unavailable.
struct DisabledExtractor;

impl FaceExtractor for DisabledExtractor {
    fn extract(&mut self, _frame: &FrameData) -> std::result::Result<Vec<FaceCandidate>, ExtractorError> {
        Err(ExtractorError::init("detection pipeline is disabled"))
    }
}

/// The assembled system: stream registry, detection engine, match pipeline,
/// and persistence collaborators behind one explicit init/shutdown lifecycle.
///
/// Constructed once and passed by reference to whatever consumes it; there is
/// no global instance.
pub struct FacewatchService {
    config: FacewatchConfig,
    registry: Arc<StreamRegistry>,
    pipeline: Arc<MatchPipeline>,
    persons: Arc<dyn PersonDirectory>,
    detections: Arc<dyn DetectionSink>,
    stream_store: Arc<dyn StreamStore>,
    scheduler: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl FacewatchService {
    pub fn builder() -> FacewatchServiceBuilder {
        FacewatchServiceBuilder::new()
    }

    /// Restore persisted streams into the registry without starting workers.
    pub async fn init(&self) -> Result<()> {
        match self.stream_store.load_streams().await {
            Ok(records) => {
                self.registry.restore(records).await;
            }
            Err(e) => {
                error!("Error loading stream database: {}", e);
            }
        }
        info!("Facewatch service initialized");
        Ok(())
    }

    /// Start monitoring every registered stream.
    pub fn start_all(&self) {
        for name in self.registry.stream_names() {
            self.registry.start_monitoring(&name);
        }
    }

    pub async fn add_stream(&self, name: &str, uri: &str, location: &str) -> bool {
        self.registry.add_stream(name, uri, location).await
    }

    pub fn start_monitoring(&self, name: &str) -> bool {
        self.registry.start_monitoring(name)
    }

    pub fn status(&self) -> HashMap<String, StreamStatus> {
        self.registry.status()
    }

    pub fn get_frame(&self, name: &str) -> Option<Vec<u8>> {
        self.registry.get_frame(name)
    }

    pub async fn remove_stream(&self, name: &str) -> bool {
        self.registry.remove_stream(name).await
    }

    /// Run the match pipeline once for a stream, recording any events to the
    /// detection sink. Sink failures are logged and never abort the run.
    pub async fn run_detection(&self, stream_name: &str) -> MatchOutcome {
        run_detection_pass(
            &self.registry,
            &self.pipeline,
            &self.persons,
            &self.detections,
            self.config.matcher.similarity_threshold,
            stream_name,
        )
        .await
    }

    /// Run the pipeline for every registered stream on the configured
    /// interval until shutdown. No-op when detection is disabled.
    pub fn start_scheduler(&self) {
        if !self.config.detection.enabled {
            info!("Detection disabled, scheduler not started");
            return;
        }

        let mut guard = self.scheduler.lock();
        if guard.is_some() {
            warn!("Detection scheduler is already running");
            return;
        }

        let registry = Arc::clone(&self.registry);
        let pipeline = Arc::clone(&self.pipeline);
        let persons = Arc::clone(&self.persons);
        let detections = Arc::clone(&self.detections);
        let threshold = self.config.matcher.similarity_threshold;
        let cancel = self.cancel.child_token();
        let interval = Duration::from_secs(self.config.matcher.detection_interval_secs);

        *guard = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Detection scheduler started ({:?} interval)", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }

                for name in registry.stream_names() {
                    let outcome = run_detection_pass(
                        &registry,
                        &pipeline,
                        &persons,
                        &detections,
                        threshold,
                        &name,
                    )
                    .await;
                    if outcome.event_count() > 0 {
                        debug!(
                            "Scheduled pass on '{}' produced {} event(s)",
                            name,
                            outcome.event_count()
                        );
                    }
                }
            }

            debug!("Detection scheduler stopped");
        }));
    }

    /// Stop the scheduler and every stream worker.
    pub async fn shutdown(&self) {
        info!("Beginning graceful shutdown");
        self.cancel.cancel();

        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("Detection scheduler did not stop within 5s");
            }
        }

        self.registry.stop_all().await;
        info!("Graceful shutdown completed");
    }

    pub fn config(&self) -> &FacewatchConfig {
        &self.config
    }
}

async fn run_detection_pass(
    registry: &StreamRegistry,
    pipeline: &MatchPipeline,
    persons: &Arc<dyn PersonDirectory>,
    detections: &Arc<dyn DetectionSink>,
    threshold: f32,
    stream_name: &str,
) -> MatchOutcome {
    let Some(slot) = registry.slot(stream_name) else {
        warn!("Detection requested for unknown stream: {}", stream_name);
        return MatchOutcome::NoFrame;
    };

    let watch_list = match persons.list_persons().await {
        Ok(watch_list) => watch_list,
        Err(e) => {
            error!("Failed to load person registry: {}", e);
            return MatchOutcome::Completed { events: Vec::new() };
        }
    };

    let outcome = pipeline.run(stream_name, &slot, &watch_list, threshold);

    if let MatchOutcome::Completed { events } = &outcome {
        for event in events {
            if let Err(e) = detections.record_detection(event).await {
                error!("Failed to persist detection {}: {}", event.id, e);
            }
        }
    }

    outcome
}

/// Builder wiring the service from its parts. Collaborators default to the
/// JSON flat-file implementations at the configured paths; the connector
/// defaults to the built-in backends.
pub struct FacewatchServiceBuilder {
    config: Option<FacewatchConfig>,
    connector: Option<Arc<dyn SourceConnector>>,
    extractor: Option<Box<dyn FaceExtractor>>,
    persons: Option<Arc<dyn PersonDirectory>>,
    detections: Option<Arc<dyn DetectionSink>>,
    stream_store: Option<Arc<dyn StreamStore>>,
}

impl FacewatchServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            connector: None,
            extractor: None,
            persons: None,
            detections: None,
            stream_store: None,
        }
    }

    pub fn config(mut self, config: FacewatchConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn extractor(mut self, extractor: Box<dyn FaceExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn person_directory(mut self, persons: Arc<dyn PersonDirectory>) -> Self {
        self.persons = Some(persons);
        self
    }

    pub fn detection_sink(mut self, detections: Arc<dyn DetectionSink>) -> Self {
        self.detections = Some(detections);
        self
    }

    pub fn stream_store(mut self, store: Arc<dyn StreamStore>) -> Self {
        self.stream_store = Some(store);
        self
    }

    pub fn build(self) -> Result<FacewatchService> {
        let config = self
            .config
            .ok_or_else(|| FacewatchError::system("Service configuration must be specified"))?;

        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None if !config.detection.enabled => Box::new(DisabledExtractor),
            None => {
                return Err(FacewatchError::system(
                    "Detection is enabled but no face extractor was provided",
                ))
            }
        };

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(DefaultConnector));
        let persons: Arc<dyn PersonDirectory> = self.persons.unwrap_or_else(|| {
            Arc::new(JsonPersonDirectory::new(&config.persistence.persons_file))
        });
        let detections: Arc<dyn DetectionSink> = self.detections.unwrap_or_else(|| {
            Arc::new(JsonDetectionLog::new(&config.persistence.detections_file))
        });
        let stream_store: Arc<dyn StreamStore> = self.stream_store.unwrap_or_else(|| {
            Arc::new(JsonStreamStore::new(&config.persistence.streams_file))
        });

        let engine = Arc::new(DetectionEngine::new(extractor, &config.detection));
        let pipeline = Arc::new(MatchPipeline::new(
            Arc::clone(&engine),
            config.matcher.clone(),
        ));
        let registry = Arc::new(StreamRegistry::new(
            config.stream.clone(),
            connector,
            Some(Arc::clone(&stream_store)),
        ));

        Ok(FacewatchService {
            config,
            registry,
            pipeline,
            persons,
            detections,
            stream_store,
            scheduler: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }
}

impl Default for FacewatchServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use crate::matcher::DetectionEvent;
    use crate::stream::StreamState;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct OneFaceExtractor;

    impl FaceExtractor for OneFaceExtractor {
        fn extract(
            &mut self,
            _frame: &FrameData,
        ) -> std::result::Result<Vec<FaceCandidate>, ExtractorError> {
            Ok(vec![FaceCandidate {
                det_score: 0.9,
                bbox: BoundingBox::new(8.0, 8.0, 32.0, 32.0),
                embedding: vec![0.8, 0.6],
            }])
        }
    }

    struct FailingSink;

    #[async_trait]
    impl DetectionSink for FailingSink {
        async fn record_detection(&self, _event: &DetectionEvent) -> Result<()> {
            Err(FacewatchError::system("sink offline"))
        }
    }

    fn test_config(dir: &TempDir) -> FacewatchConfig {
        let mut config = FacewatchConfig::default();
        config.stream.max_fps = 200;
        config.stream.resolution = (64, 48);
        config.persistence.streams_file = dir
            .path()
            .join("streams.json")
            .to_string_lossy()
            .into_owned();
        config.persistence.persons_file = dir
            .path()
            .join("persons.json")
            .to_string_lossy()
            .into_owned();
        config.persistence.detections_file = dir
            .path()
            .join("detections.json")
            .to_string_lossy()
            .into_owned();
        config
    }

    async fn write_watchlist(dir: &TempDir) {
        tokio::fs::write(
            dir.path().join("persons.json"),
            r#"{"p1": {"name": "Alice", "embedding": [1.0, 0.0], "created_at": "2024-01-01T00:00:00"}}"#,
        )
        .await
        .unwrap();
    }

    async fn wait_for_streaming(service: &FacewatchService, name: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = service.status();
                if status.get(name).map(|s| s.state) == Some(StreamState::Streaming)
                    && status.get(name).and_then(|s| s.last_update).is_some()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream never started streaming");
    }

    #[tokio::test]
    async fn test_detection_run_records_event() {
        let dir = TempDir::new().unwrap();
        write_watchlist(&dir).await;

        let service = FacewatchService::builder()
            .config(test_config(&dir))
            .extractor(Box::new(OneFaceExtractor))
            .build()
            .unwrap();

        assert!(service.add_stream("Cam1", "demo", "Lobby").await);
        wait_for_streaming(&service, "Cam1").await;

        let outcome = service.run_detection("Cam1").await;
        assert_eq!(outcome.event_count(), 1);

        let log = tokio::fs::read_to_string(dir.path().join("detections.json"))
            .await
            .unwrap();
        let records: Vec<serde_json::Value> = serde_json::from_str(&log).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["person_id"], "p1");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_abort_run() {
        let dir = TempDir::new().unwrap();
        write_watchlist(&dir).await;

        let service = FacewatchService::builder()
            .config(test_config(&dir))
            .extractor(Box::new(OneFaceExtractor))
            .detection_sink(Arc::new(FailingSink))
            .build()
            .unwrap();

        assert!(service.add_stream("Cam1", "demo", "Lobby").await);
        wait_for_streaming(&service, "Cam1").await;

        let outcome = service.run_detection("Cam1").await;
        assert_eq!(outcome.event_count(), 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_registers_without_starting() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let store = JsonStreamStore::new(&config.persistence.streams_file);
        store
            .save_streams(&[crate::stream::StreamRecord {
                name: "Cam1".into(),
                uri: "demo".into(),
                location: "Lobby".into(),
                added_date: None,
            }])
            .await
            .unwrap();

        let service = FacewatchService::builder()
            .config(config)
            .extractor(Box::new(OneFaceExtractor))
            .build()
            .unwrap();
        service.init().await.unwrap();

        let status = service.status();
        assert_eq!(status.get("Cam1").unwrap().state, StreamState::Probing);
        assert!(status.get("Cam1").unwrap().last_update.is_none());

        service.start_all();
        wait_for_streaming(&service, "Cam1").await;

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_stream_persists_table() {
        let dir = TempDir::new().unwrap();
        let service = FacewatchService::builder()
            .config(test_config(&dir))
            .extractor(Box::new(OneFaceExtractor))
            .build()
            .unwrap();

        assert!(service.add_stream("Cam1", "demo", "Lobby").await);

        let table = tokio::fs::read_to_string(dir.path().join("streams.json"))
            .await
            .unwrap();
        assert!(table.contains("Cam1"));
        assert!(table.contains("Lobby"));

        assert!(service.remove_stream("Cam1").await);
        let table = tokio::fs::read_to_string(dir.path().join("streams.json"))
            .await
            .unwrap();
        assert!(!table.contains("Cam1"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_enabled_detection_requires_extractor() {
        let dir = TempDir::new().unwrap();
        let result = FacewatchService::builder().config(test_config(&dir)).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disabled_detection_reports_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.detection.enabled = false;

        let service = FacewatchService::builder().config(config).build().unwrap();
        assert!(service.add_stream("Cam1", "demo", "Lobby").await);
        wait_for_streaming(&service, "Cam1").await;

        let outcome = service.run_detection("Cam1").await;
        assert!(matches!(outcome, MatchOutcome::ExtractorFailed { .. }));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduler_produces_events() {
        let dir = TempDir::new().unwrap();
        write_watchlist(&dir).await;

        let mut config = test_config(&dir);
        config.matcher.detection_interval_secs = 1;

        let service = FacewatchService::builder()
            .config(config)
            .extractor(Box::new(OneFaceExtractor))
            .build()
            .unwrap();

        assert!(service.add_stream("Cam1", "demo", "Lobby").await);
        wait_for_streaming(&service, "Cam1").await;
        service.start_scheduler();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(log) =
                    tokio::fs::read_to_string(dir.path().join("detections.json")).await
                {
                    if log.contains("Alice") {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("scheduler never recorded a detection");

        service.shutdown().await;
    }
}
