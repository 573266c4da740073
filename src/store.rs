use crate::error::Result;
use crate::matcher::{DetectionEvent, Person};
use crate::stream::StreamRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Watch-list supplier. Read-only to the core; queried once per pipeline run.
#[async_trait]
pub trait PersonDirectory: Send + Sync {
    async fn list_persons(&self) -> Result<Vec<Person>>;
}

/// Detection event consumer. Fire-and-forget from the core's perspective:
/// persist failures are logged by the caller and never abort a pipeline run.
#[async_trait]
pub trait DetectionSink: Send + Sync {
    async fn record_detection(&self, event: &DetectionEvent) -> Result<()>;
}

/// Stream table persistence: loaded once at startup, saved after every
/// successful add or remove.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn load_streams(&self) -> Result<Vec<StreamRecord>>;
    async fn save_streams(&self, records: &[StreamRecord]) -> Result<()>;
}

async fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> Result<T> {
    match fs::read_to_string(path).await {
        Ok(content) if !content.trim().is_empty() => Ok(serde_json::from_str(&content)?),
        Ok(_) => Ok(T::default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No database file at {}, starting fresh", path.display());
            Ok(T::default())
        }
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).await?;
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersonRecord {
    name: String,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    last_seen_location: Option<String>,
    #[serde(default)]
    last_seen_time: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

/// Person directory backed by a single JSON file keyed by person id.
pub struct JsonPersonDirectory {
    path: PathBuf,
}

impl JsonPersonDirectory {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl PersonDirectory for JsonPersonDirectory {
    async fn list_persons(&self) -> Result<Vec<Person>> {
        let records: HashMap<String, PersonRecord> = read_json_or_default(&self.path).await?;

        let mut entries: Vec<(String, PersonRecord)> = records
            .into_iter()
            .filter(|(id, record)| {
                if record.embedding.is_empty() {
                    warn!("Person {} has no reference embedding, skipping", id);
                    false
                } else {
                    true
                }
            })
            .collect();

        // Registration order: creation timestamp, then id for stability
        entries.sort_by(|(id_a, a), (id_b, b)| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| id_a.cmp(id_b))
        });

        Ok(entries
            .into_iter()
            .map(|(id, record)| Person {
                id,
                name: record.name,
                embedding: record.embedding,
                threshold: record.threshold,
                last_seen_location: record.last_seen_location,
            })
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamFileRecord {
    #[serde(alias = "url")]
    uri: String,
    location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    added_date: Option<String>,
}

/// Stream table backed by a single JSON file keyed by stream name.
pub struct JsonStreamStore {
    path: PathBuf,
}

impl JsonStreamStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl StreamStore for JsonStreamStore {
    async fn load_streams(&self) -> Result<Vec<StreamRecord>> {
        let records: BTreeMap<String, StreamFileRecord> =
            read_json_or_default(&self.path).await?;

        let streams: Vec<StreamRecord> = records
            .into_iter()
            .map(|(name, record)| StreamRecord {
                name,
                uri: record.uri,
                location: record.location,
                added_date: record.added_date,
            })
            .collect();

        info!("Loaded {} streams from database", streams.len());
        Ok(streams)
    }

    async fn save_streams(&self, records: &[StreamRecord]) -> Result<()> {
        let table: BTreeMap<String, StreamFileRecord> = records
            .iter()
            .map(|record| {
                (
                    record.name.clone(),
                    StreamFileRecord {
                        uri: record.uri.clone(),
                        location: record.location.clone(),
                        added_date: record.added_date.clone(),
                    },
                )
            })
            .collect();

        write_json(&self.path, &table).await?;
        info!("Saved {} streams to database", table.len());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DetectionRecord {
    id: String,
    person_id: String,
    person_name: String,
    stream_name: String,
    timestamp: String,
    similarity: f32,
    confidence: String,
    bbox: [f32; 4],
}

/// Append-style detection log backed by a single JSON array file.
pub struct JsonDetectionLog {
    path: PathBuf,
}

impl JsonDetectionLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl DetectionSink for JsonDetectionLog {
    async fn record_detection(&self, event: &DetectionEvent) -> Result<()> {
        let mut records: Vec<DetectionRecord> = read_json_or_default(&self.path).await?;

        records.push(DetectionRecord {
            id: event.id.clone(),
            person_id: event.person_id.clone(),
            person_name: event.person_name.clone(),
            stream_name: event.stream_name.clone(),
            timestamp: DateTime::<Utc>::from(event.timestamp).to_rfc3339(),
            similarity: event.similarity,
            confidence: event.confidence.to_string(),
            bbox: [event.bbox.x1, event.bbox.y1, event.bbox.x2, event.bbox.y2],
        });

        write_json(&self.path, &records).await?;
        debug!("Recorded detection {} for {}", event.id, event.person_name);
        Ok(())
    }
}
