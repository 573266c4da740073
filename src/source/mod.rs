mod synthetic;
#[cfg(all(feature = "rtsp", target_os = "linux"))]
mod rtsp;

pub use synthetic::SyntheticSource;

use crate::config::StreamConfig;
use crate::error::SourceError;
use crate::frame::FrameData;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Parsed stream source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUri {
    /// Built-in demo source producing a synthetic test pattern
    Demo,
    /// Local capture device by index
    Device(u32),
    /// Network stream (rtsp://, http://, ...)
    Network(String),
}

impl StreamUri {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("demo") {
            return StreamUri::Demo;
        }
        if let Ok(index) = trimmed.parse::<u32>() {
            return StreamUri::Device(index);
        }
        if let Some(index) = trimmed
            .strip_prefix("device:")
            .and_then(|rest| rest.parse::<u32>().ok())
        {
            return StreamUri::Device(index);
        }
        StreamUri::Network(trimmed.to_string())
    }

    /// Local sources (demo pattern, capture devices) skip the connectivity probe
    pub fn is_local(&self) -> bool {
        matches!(self, StreamUri::Demo | StreamUri::Device(_))
    }
}

impl fmt::Display for StreamUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamUri::Demo => write!(f, "demo"),
            StreamUri::Device(index) => write!(f, "device:{}", index),
            StreamUri::Network(url) => write!(f, "{}", url),
        }
    }
}

/// An open video connection owned by exactly one stream worker.
///
/// `read_frame` may block for the duration of one frame interval or the
/// backend's own read timeout, never indefinitely.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<FrameData, SourceError>;

    /// Release the underlying connection handle. Idempotent.
    fn close(&mut self) {}
}

/// Factory seam for opening video connections, one per stream worker.
pub trait SourceConnector: Send + Sync {
    fn connect(
        &self,
        uri: &StreamUri,
        settings: &StreamConfig,
    ) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Built-in connector covering demo sources, local capture devices, and
/// (with the `rtsp` feature on Linux) network streams.
pub struct DefaultConnector;

impl SourceConnector for DefaultConnector {
    fn connect(
        &self,
        uri: &StreamUri,
        settings: &StreamConfig,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        match uri {
            StreamUri::Demo => Ok(Box::new(SyntheticSource::new("demo", settings.resolution))),
            StreamUri::Device(index) => {
                #[cfg(all(feature = "rtsp", target_os = "linux"))]
                {
                    rtsp::GstSource::open_device(*index, settings)
                        .map(|s| Box::new(s) as Box<dyn FrameSource>)
                }
                #[cfg(not(all(feature = "rtsp", target_os = "linux")))]
                {
                    warn!(
                        "Capture backend not compiled in, device {} served by synthetic source",
                        index
                    );
                    Ok(Box::new(SyntheticSource::new(
                        &format!("device:{}", index),
                        settings.resolution,
                    )))
                }
            }
            StreamUri::Network(url) => {
                #[cfg(all(feature = "rtsp", target_os = "linux"))]
                {
                    rtsp::GstSource::open_network(url, settings)
                        .map(|s| Box::new(s) as Box<dyn FrameSource>)
                }
                #[cfg(not(all(feature = "rtsp", target_os = "linux")))]
                {
                    Err(SourceError::Unsupported {
                        uri: url.clone(),
                        details: "network capture requires the `rtsp` feature on Linux"
                            .to_string(),
                    })
                }
            }
        }
    }
}

/// Connectivity probe: open the source and read one frame within `timeout`.
///
/// Runs the blocking open/read on the blocking pool; a probe that outlives the
/// timeout is abandoned (its connection closes when the blocking task finishes)
/// and reported as a timeout.
pub async fn probe_source(
    connector: Arc<dyn SourceConnector>,
    uri: StreamUri,
    settings: StreamConfig,
    timeout: Duration,
) -> Result<(), SourceError> {
    let uri_str = uri.to_string();
    debug!("Probing stream source: {}", uri_str);

    let probe_uri = uri_str.clone();
    let handle = tokio::task::spawn_blocking(move || -> Result<(), SourceError> {
        let mut source = connector.connect(&uri, &settings)?;
        let result = source.read_frame().map(|_| ());
        source.close();
        result
    });

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(()))) => {
            debug!("Probe succeeded for {}", uri_str);
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(SourceError::Probe {
            uri: probe_uri,
            details: e.to_string(),
        }),
        Ok(Err(join_err)) => Err(SourceError::Probe {
            uri: probe_uri,
            details: format!("probe task failed: {}", join_err),
        }),
        Err(_) => {
            warn!(
                "Probe for {} exceeded {:?}, abandoning the in-flight attempt",
                probe_uri, timeout
            );
            Err(SourceError::ProbeTimeout {
                uri: probe_uri,
                timeout,
            })
        }
    }
}
