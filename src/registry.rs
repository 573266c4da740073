use crate::config::StreamConfig;
use crate::frame::{encode_jpeg, placeholder_jpeg};
use crate::frame_slot::FrameSlot;
use crate::source::{probe_source, SourceConnector, StreamUri};
use crate::store::StreamStore;
use crate::stream::{StreamRecord, StreamShared, StreamState, StreamStatus};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct WorkerHandle {
    handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

struct StreamEntry {
    record: StreamRecord,
    uri: StreamUri,
    slot: Arc<FrameSlot>,
    shared: Arc<StreamShared>,
    worker: Option<WorkerHandle>,
}

/// Tracks named streams, their configuration, and their workers' lifecycle.
///
/// The name→stream map is guarded by a single registry lock; each frame slot
/// is guarded independently, so contention on one stream never affects
/// another. At most one live worker exists per stream name: workers are only
/// spawned under the registry write lock after checking the previous handle.
pub struct StreamRegistry {
    settings: StreamConfig,
    connector: Arc<dyn SourceConnector>,
    store: Option<Arc<dyn StreamStore>>,
    streams: RwLock<HashMap<String, StreamEntry>>,
    root_cancel: CancellationToken,
}

impl StreamRegistry {
    pub fn new(
        settings: StreamConfig,
        connector: Arc<dyn SourceConnector>,
        store: Option<Arc<dyn StreamStore>>,
    ) -> Self {
        Self {
            settings,
            connector,
            store,
            streams: RwLock::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Register a new stream and start monitoring it.
    ///
    /// Network sources are probed (open + one frame read, bounded timeout)
    /// before being accepted; local capture devices and demo sources skip the
    /// probe. Returns false on duplicate names, a full registry, or probe
    /// failure, leaving existing streams untouched.
    pub async fn add_stream(&self, name: &str, uri: &str, location: &str) -> bool {
        self.add_stream_inner(name, uri, location, true, true).await
    }

    async fn add_stream_inner(
        &self,
        name: &str,
        uri: &str,
        location: &str,
        probe: bool,
        start: bool,
    ) -> bool {
        info!("Attempting to add stream: {}", name);

        if name.trim().is_empty() {
            warn!("Rejecting stream with empty name");
            return false;
        }

        {
            let streams = self.streams.read();
            if streams.contains_key(name) {
                warn!("Stream {} already exists", name);
                return false;
            }
            if streams.len() >= self.settings.max_streams {
                warn!(
                    "Stream cap reached ({}), rejecting {}",
                    self.settings.max_streams, name
                );
                return false;
            }
        }

        let parsed = StreamUri::parse(uri);

        if probe && !parsed.is_local() {
            let result = probe_source(
                Arc::clone(&self.connector),
                parsed.clone(),
                self.settings.clone(),
                Duration::from_secs(self.settings.probe_timeout_secs),
            )
            .await;

            if let Err(e) = result {
                error!("Failed to connect to stream source: {}", e);
                return false;
            }
        }

        {
            let mut streams = self.streams.write();
            // Re-check under the write lock: a concurrent add may have won
            if streams.contains_key(name) {
                warn!("Stream {} already exists", name);
                return false;
            }
            if streams.len() >= self.settings.max_streams {
                warn!(
                    "Stream cap reached ({}), rejecting {}",
                    self.settings.max_streams, name
                );
                return false;
            }

            let mut entry = StreamEntry {
                record: StreamRecord {
                    name: name.to_string(),
                    uri: parsed.to_string(),
                    location: location.to_string(),
                    added_date: Some(Utc::now().to_rfc3339()),
                },
                uri: parsed,
                slot: Arc::new(FrameSlot::new()),
                shared: Arc::new(StreamShared::new(name)),
                worker: None,
            };

            if start {
                self.spawn_worker_locked(&mut entry);
            }

            streams.insert(name.to_string(), entry);
        }

        self.persist().await;

        info!(
            "Successfully added stream: {} at location: {}",
            name, location
        );
        true
    }

    /// Repopulate the registry from persisted records without starting
    /// workers or probing sources. Used once at startup.
    pub async fn restore(&self, records: Vec<StreamRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            if self
                .add_stream_inner(&record.name, &record.uri, &record.location, false, false)
                .await
            {
                restored += 1;
            }
        }
        info!("Restored {} streams from store", restored);
        restored
    }

    /// Start monitoring a registered stream. Idempotent: a stream with a live
    /// worker is left alone. Also restarts streams that previously stopped.
    pub fn start_monitoring(&self, name: &str) -> bool {
        let mut streams = self.streams.write();
        let Some(entry) = streams.get_mut(name) else {
            warn!("Cannot monitor unknown stream: {}", name);
            return false;
        };

        if let Some(worker) = &entry.worker {
            if !worker.handle.is_finished() {
                debug!("Stream {} is already being monitored", name);
                return true;
            }
        }

        self.spawn_worker_locked(entry);
        info!("Started monitoring stream: {}", name);
        true
    }

    /// Must be called with the registry write lock held: the lock serializes
    /// spawns, upholding the one-worker-per-stream invariant.
    fn spawn_worker_locked(&self, entry: &mut StreamEntry) {
        let cancel = self.root_cancel.child_token();
        entry.shared.set_state(StreamState::Probing);
        entry.shared.reset_errors();

        let worker = crate::worker::StreamWorker::new(
            &entry.record.name,
            entry.uri.clone(),
            self.settings.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&entry.slot),
            Arc::clone(&entry.shared),
            cancel.clone(),
        );

        let handle = tokio::spawn(worker.run());
        entry.worker = Some(WorkerHandle { handle, cancel });
    }

    /// Read-only snapshot of every stream's state, safe under concurrent
    /// worker mutation.
    pub fn status(&self) -> HashMap<String, StreamStatus> {
        let streams = self.streams.read();
        streams
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    StreamStatus {
                        uri: entry.record.uri.clone(),
                        location: entry.record.location.clone(),
                        state: entry.shared.state(),
                        last_update: entry.shared.last_update(),
                        error_count: entry.shared.error_count(),
                        reconnect_attempts: entry.shared.reconnect_attempts(),
                    },
                )
            })
            .collect()
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    /// Latest frame for a stream as JPEG bytes. A registered stream with no
    /// frame yet yields a generated placeholder, never an error; only unknown
    /// names return `None`.
    pub fn get_frame(&self, name: &str) -> Option<Vec<u8>> {
        let frame = {
            let streams = self.streams.read();
            let entry = streams.get(name)?;
            entry.slot.get()
        };

        let (width, height) = self.settings.resolution;
        match frame {
            Some(frame) => match encode_jpeg(&frame) {
                Ok(jpeg) => Some(jpeg),
                Err(e) => {
                    error!("Frame encoding failed for {}: {}", name, e);
                    placeholder_jpeg(width, height).ok()
                }
            },
            None => placeholder_jpeg(width, height).ok(),
        }
    }

    /// Frame slot handle for pipeline consumers
    pub fn slot(&self, name: &str) -> Option<Arc<FrameSlot>> {
        self.streams.read().get(name).map(|e| Arc::clone(&e.slot))
    }

    /// Stop a stream's worker and drop the registration.
    pub async fn remove_stream(&self, name: &str) -> bool {
        let entry = {
            let mut streams = self.streams.write();
            streams.remove(name)
        };

        let Some(entry) = entry else {
            warn!("Cannot remove unknown stream: {}", name);
            return false;
        };

        if let Some(worker) = entry.worker {
            worker.cancel.cancel();
            self.join_worker(name, worker.handle).await;
        }

        self.persist().await;
        info!("Removed stream: {}", name);
        true
    }

    /// Signal every worker to exit and wait (bounded per-worker timeout) for
    /// each to release its connection. Workers that miss the deadline are
    /// logged as resource leaks, never force-killed.
    pub async fn stop_all(&self) {
        info!("Stopping all stream monitoring");
        self.root_cancel.cancel();

        let handles: Vec<(String, tokio::task::JoinHandle<()>)> = {
            let mut streams = self.streams.write();
            streams
                .iter_mut()
                .filter_map(|(name, entry)| {
                    entry.worker.take().map(|w| (name.clone(), w.handle))
                })
                .collect()
        };

        for (name, handle) in handles {
            self.join_worker(&name, handle).await;
        }

        info!("All stream monitoring stopped");
    }

    async fn join_worker(&self, name: &str, handle: tokio::task::JoinHandle<()>) {
        let deadline = Duration::from_secs(self.settings.join_timeout_secs);
        match timeout(deadline, handle).await {
            Ok(Ok(())) => debug!("Worker for '{}' joined", name),
            Ok(Err(e)) => error!("Worker for '{}' panicked: {}", name, e),
            Err(_) => warn!(
                "Worker for '{}' did not exit within {:?}, leaking it",
                name, deadline
            ),
        }
    }

    fn records_snapshot(&self) -> Vec<StreamRecord> {
        let streams = self.streams.read();
        let mut records: Vec<StreamRecord> =
            streams.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            let records = self.records_snapshot();
            if let Err(e) = store.save_streams(&records).await {
                error!("Failed to persist stream table: {}", e);
            }
        }
    }
}
