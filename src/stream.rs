use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;
use tracing::info;

/// Lifecycle state of a monitored stream.
///
/// Transitions are monotone within one connection attempt
/// (Probing → Streaming → {Streaming | Reconnecting}); Stopped is terminal
/// until an explicit restart through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Probing,
    Streaming,
    Reconnecting,
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Probing => "probing",
            StreamState::Streaming => "streaming",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Persisted description of a registered stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub name: String,
    #[serde(alias = "url")]
    pub uri: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_date: Option<String>,
}

/// State shared between one stream's worker and registry status queries.
///
/// The worker is the only writer; status queries take read-only snapshots.
pub struct StreamShared {
    name: String,
    state: RwLock<StreamState>,
    error_count: AtomicU32,
    reconnect_attempts: AtomicU32,
    last_update: RwLock<Option<SystemTime>>,
}

impl StreamShared {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(StreamState::Probing),
            error_count: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            last_update: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    pub fn set_state(&self, next: StreamState) {
        let mut state = self.state.write();
        if *state != next {
            info!("Stream '{}' state: {} -> {}", self.name, *state, next);
            *state = next;
        }
    }

    /// Record a successfully captured frame: refresh the timestamp and clear
    /// the consecutive-error counter.
    pub fn record_frame(&self, timestamp: SystemTime) {
        *self.last_update.write() = Some(timestamp);
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// Record a read failure, returning the new consecutive-error count
    pub fn record_error(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_errors(&self) {
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// Record a reconnect attempt, returning the cumulative count
    pub fn record_reconnect_attempt(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        *self.last_update.read()
    }
}

/// Read-only status snapshot of one stream, safe to take while its worker runs
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub uri: String,
    pub location: String,
    pub state: StreamState,
    pub last_update: Option<SystemTime>,
    pub error_count: u32,
    pub reconnect_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_probing() {
        let shared = StreamShared::new("cam");
        assert_eq!(shared.state(), StreamState::Probing);
        assert_eq!(shared.error_count(), 0);
        assert!(shared.last_update().is_none());
    }

    #[test]
    fn test_record_frame_clears_errors() {
        let shared = StreamShared::new("cam");
        assert_eq!(shared.record_error(), 1);
        assert_eq!(shared.record_error(), 2);

        shared.record_frame(SystemTime::now());
        assert_eq!(shared.error_count(), 0);
        assert!(shared.last_update().is_some());
    }

    #[test]
    fn test_reconnect_attempts_accumulate() {
        let shared = StreamShared::new("cam");
        assert_eq!(shared.record_reconnect_attempt(), 1);
        assert_eq!(shared.record_reconnect_attempt(), 2);
        assert_eq!(shared.reconnect_attempts(), 2);
    }

    #[test]
    fn test_stream_record_accepts_legacy_url_key() {
        let record: StreamRecord =
            serde_json::from_str(r#"{"name":"Cam1","url":"rtsp://x","location":"Lobby"}"#)
                .unwrap();
        assert_eq!(record.uri, "rtsp://x");
    }
}
