use crate::config::StreamConfig;
use crate::frame_slot::FrameSlot;
use crate::source::{FrameSource, SourceConnector, StreamUri};
use crate::stream::{StreamShared, StreamState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Owns one stream's connection lifecycle: open, read at the capped rate into
/// the frame slot, reconnect with fixed backoff on failure, stop when the
/// attempt budget is exhausted or the registry cancels it.
pub struct StreamWorker {
    name: String,
    uri: StreamUri,
    settings: StreamConfig,
    connector: Arc<dyn SourceConnector>,
    slot: Arc<FrameSlot>,
    shared: Arc<StreamShared>,
    cancel: CancellationToken,
}

enum LoopExit {
    Cancelled,
    ErrorsExceeded,
}

impl StreamWorker {
    pub fn new(
        name: &str,
        uri: StreamUri,
        settings: StreamConfig,
        connector: Arc<dyn SourceConnector>,
        slot: Arc<FrameSlot>,
        shared: Arc<StreamShared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.to_string(),
            uri,
            settings,
            connector,
            slot,
            shared,
            cancel,
        }
    }

    /// Run until cancelled or the reconnect budget is spent. Always leaves the
    /// stream in the Stopped state and the source connection released.
    pub async fn run(self) {
        debug!("Worker for '{}' started ({})", self.name, self.uri);

        // Failed opens in a row; reset on every successful open. The initial
        // open while Probing counts against the same budget.
        let mut failed_attempts: u32 = 0;

        'lifecycle: loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connector.connect(&self.uri, &self.settings) {
                Ok(mut source) => {
                    failed_attempts = 0;
                    self.shared.reset_errors();
                    self.shared.set_state(StreamState::Streaming);

                    let exit = self.streaming_loop(source.as_mut()).await;
                    source.close();

                    match exit {
                        LoopExit::Cancelled => break 'lifecycle,
                        LoopExit::ErrorsExceeded => {
                            warn!(
                                "Stream '{}' exceeded {} consecutive read errors, reconnecting",
                                self.name, self.settings.error_threshold
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!("Stream '{}' failed to open source: {}", self.name, e);
                }
            }

            failed_attempts += 1;
            self.shared.record_reconnect_attempt();

            if failed_attempts >= self.settings.max_reconnect_attempts {
                error!(
                    "Stream '{}' gave up after {} reconnect attempts",
                    self.name, failed_attempts
                );
                self.shared.set_state(StreamState::Stopped);
                return;
            }

            self.shared.set_state(StreamState::Reconnecting);
            trace!(
                "Stream '{}' backing off {}s before reconnect attempt {}",
                self.name,
                self.settings.reconnect_interval_secs,
                failed_attempts + 1
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break 'lifecycle,
                _ = tokio::time::sleep(Duration::from_secs(self.settings.reconnect_interval_secs)) => {}
            }
        }

        self.shared.set_state(StreamState::Stopped);
        debug!("Worker for '{}' exited", self.name);
    }

    /// Read frames at the capped rate until cancelled or the consecutive
    /// error threshold is exceeded.
    async fn streaming_loop(&self, source: &mut dyn FrameSource) -> LoopExit {
        let frame_interval =
            Duration::from_millis((1000 / self.settings.max_fps.max(1) as u64).max(1));
        let mut interval_timer = tokio::time::interval(frame_interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                _ = interval_timer.tick() => {}
            }

            match source.read_frame() {
                Ok(frame) => {
                    let timestamp = frame.timestamp;
                    trace!(
                        "Stream '{}' captured frame {} ({}x{})",
                        self.name,
                        frame.id,
                        frame.width,
                        frame.height
                    );
                    self.slot.put(frame);
                    self.shared.record_frame(timestamp);
                }
                Err(e) => {
                    let errors = self.shared.record_error();
                    warn!(
                        "Stream '{}' read error ({} consecutive): {}",
                        self.name, errors, e
                    );
                    if errors > self.settings.error_threshold {
                        return LoopExit::ErrorsExceeded;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FacewatchConfig;
    use crate::error::SourceError;
    use crate::frame::{FrameData, FrameFormat};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::SystemTime;
    use tokio::time::timeout;

    #[derive(Clone, Copy)]
    enum ConnectOutcome {
        Refuse,
        /// Source succeeds for the given number of reads, then fails every read
        FailAfter(u32),
        Healthy,
    }

    struct ScriptedSource {
        reads_before_fail: Option<u32>,
        reads: u32,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<FrameData, SourceError> {
            if let Some(limit) = self.reads_before_fail {
                if self.reads >= limit {
                    return Err(SourceError::read("scripted failure"));
                }
            }
            self.reads += 1;
            Ok(FrameData::new(
                self.reads as u64,
                SystemTime::now(),
                vec![0u8; 12],
                2,
                2,
                FrameFormat::Rgb24,
            ))
        }
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<ConnectOutcome>>,
        fallback: ConnectOutcome,
    }

    impl ScriptedConnector {
        fn new(script: Vec<ConnectOutcome>, fallback: ConnectOutcome) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
            })
        }
    }

    impl SourceConnector for ScriptedConnector {
        fn connect(
            &self,
            uri: &StreamUri,
            _settings: &StreamConfig,
        ) -> Result<Box<dyn FrameSource>, SourceError> {
            let outcome = self.script.lock().pop_front().unwrap_or(self.fallback);
            match outcome {
                ConnectOutcome::Refuse => Err(SourceError::connect(
                    uri.to_string(),
                    "scripted refusal".to_string(),
                )),
                ConnectOutcome::FailAfter(reads) => Ok(Box::new(ScriptedSource {
                    reads_before_fail: Some(reads),
                    reads: 0,
                })),
                ConnectOutcome::Healthy => Ok(Box::new(ScriptedSource {
                    reads_before_fail: None,
                    reads: 0,
                })),
            }
        }
    }

    fn fast_settings() -> StreamConfig {
        let mut settings = FacewatchConfig::default().stream;
        settings.max_fps = 1000;
        settings.error_threshold = 3;
        settings.reconnect_interval_secs = 0;
        settings.max_reconnect_attempts = 4;
        settings
    }

    fn spawn_worker(
        connector: Arc<dyn SourceConnector>,
        settings: StreamConfig,
    ) -> (
        Arc<FrameSlot>,
        Arc<StreamShared>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let slot = Arc::new(FrameSlot::new());
        let shared = Arc::new(StreamShared::new("cam"));
        let cancel = CancellationToken::new();
        let worker = StreamWorker::new(
            "cam",
            StreamUri::Demo,
            settings,
            connector,
            Arc::clone(&slot),
            Arc::clone(&shared),
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run());
        (slot, shared, cancel, handle)
    }

    async fn wait_for_state(shared: &StreamShared, wanted: StreamState) {
        timeout(Duration::from_secs(5), async {
            while shared.state() != wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("stream never reached {:?}", wanted));
    }

    #[tokio::test]
    async fn test_healthy_source_streams_into_slot() {
        let connector = ScriptedConnector::new(vec![], ConnectOutcome::Healthy);
        let (slot, shared, cancel, handle) = spawn_worker(connector, fast_settings());

        wait_for_state(&shared, StreamState::Streaming).await;
        timeout(Duration::from_secs(5), async {
            while !slot.has_frame() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no frame arrived");

        assert!(shared.last_update().is_some());

        cancel.cancel();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(shared.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_source_stops_after_attempt_budget() {
        let settings = fast_settings();
        let max_attempts = settings.max_reconnect_attempts;
        let connector = ScriptedConnector::new(vec![], ConnectOutcome::Refuse);
        let (slot, shared, _cancel, handle) = spawn_worker(connector, settings);

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert_eq!(shared.state(), StreamState::Stopped);
        assert_eq!(shared.reconnect_attempts(), max_attempts);
        assert!(!slot.has_frame());

        // Terminal: no spontaneous revival
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shared.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_error_threshold_triggers_reconnect_and_recovery() {
        let connector = ScriptedConnector::new(
            vec![ConnectOutcome::FailAfter(0)],
            ConnectOutcome::Healthy,
        );
        let (slot, shared, cancel, handle) = spawn_worker(connector, fast_settings());

        // First source fails every read, the replacement streams normally
        wait_for_state(&shared, StreamState::Streaming).await;
        timeout(Duration::from_secs(5), async {
            while !slot.has_frame() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recovered source produced no frame");

        assert!(shared.reconnect_attempts() >= 1);
        assert_eq!(shared.error_count(), 0);

        cancel.cancel();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_exits_promptly() {
        let mut settings = fast_settings();
        settings.reconnect_interval_secs = 60;
        let connector = ScriptedConnector::new(vec![], ConnectOutcome::Refuse);
        let (_slot, shared, cancel, handle) = spawn_worker(connector, settings);

        wait_for_state(&shared, StreamState::Reconnecting).await;
        cancel.cancel();

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(shared.state(), StreamState::Stopped);
    }
}
