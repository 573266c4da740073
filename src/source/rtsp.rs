//! GStreamer-backed capture for network streams and local V4L2 devices.
//!
//! Pipelines decode to fixed-resolution RGB with a single leaky appsink
//! buffer, so a stalled consumer drops frames at the sink instead of
//! building a backlog inside the decoder.

use crate::config::StreamConfig;
use crate::error::SourceError;
use crate::frame::{FrameData, FrameFormat};
use crate::source::FrameSource;
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// One open GStreamer pipeline, owned by a single stream worker.
pub struct GstSource {
    pipeline: Pipeline,
    appsink: AppSink,
    uri: String,
    frame_counter: u64,
    closed: bool,
}

impl GstSource {
    /// Open a network stream (rtsp://, http://, ...).
    pub fn open_network(url: &str, settings: &StreamConfig) -> Result<Self, SourceError> {
        let (width, height) = settings.resolution;
        let pipeline_desc = format!(
            "uridecodebin uri={} ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! videorate ! \
             video/x-raw,framerate={}/1 ! \
             appsink name=sink sync=false max-buffers=1 drop=true",
            url, width, height, settings.max_fps
        );
        Self::open(url, &pipeline_desc)
    }

    /// Open a local capture device by index.
    pub fn open_device(index: u32, settings: &StreamConfig) -> Result<Self, SourceError> {
        let (width, height) = settings.resolution;
        let pipeline_desc = format!(
            "v4l2src device=/dev/video{} ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! videorate ! \
             video/x-raw,framerate={}/1 ! \
             appsink name=sink sync=false max-buffers=1 drop=true",
            index, width, height, settings.max_fps
        );
        Self::open(&format!("device:{}", index), &pipeline_desc)
    }

    fn open(uri: &str, pipeline_desc: &str) -> Result<Self, SourceError> {
        gstreamer::init().map_err(|e| SourceError::Connect {
            uri: uri.to_string(),
            details: format!("GStreamer init failed: {}", e),
        })?;

        info!("Creating GStreamer pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(pipeline_desc)
            .map_err(|e| SourceError::Connect {
                uri: uri.to_string(),
                details: format!("Failed to create pipeline: {}", e),
            })?
            .downcast::<Pipeline>()
            .map_err(|_| SourceError::Connect {
                uri: uri.to_string(),
                details: "Failed to downcast to Pipeline".to_string(),
            })?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| SourceError::Connect {
                uri: uri.to_string(),
                details: "Pipeline has no appsink".to_string(),
            })?
            .downcast::<AppSink>()
            .map_err(|_| SourceError::Connect {
                uri: uri.to_string(),
                details: "Failed to downcast to AppSink".to_string(),
            })?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| SourceError::Connect {
                uri: uri.to_string(),
                details: format!("Failed to start pipeline: {}", e),
            })?;

        debug!("GStreamer pipeline started for {}", uri);

        Ok(Self {
            pipeline,
            appsink,
            uri: uri.to_string(),
            frame_counter: 0,
            closed: false,
        })
    }
}

impl FrameSource for GstSource {
    fn read_frame(&mut self) -> Result<FrameData, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_seconds(5))
            .ok_or_else(|| SourceError::read(format!("No sample from {} within 5s", self.uri)))?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| SourceError::decode("No buffer in sample".to_string()))?;

        let caps = sample
            .caps()
            .ok_or_else(|| SourceError::decode("No caps in sample".to_string()))?;

        let video_info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| SourceError::decode(format!("Failed to get video info: {}", e)))?;

        let map = buffer
            .map_readable()
            .map_err(|e| SourceError::decode(format!("Failed to map buffer: {}", e)))?;

        let frame_id = self.frame_counter;
        self.frame_counter += 1;

        Ok(FrameData::new(
            frame_id,
            SystemTime::now(),
            map.as_slice().to_vec(),
            video_info.width(),
            video_info.height(),
            FrameFormat::Rgb24,
        ))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            warn!("Failed to stop pipeline for {}: {}", self.uri, e);
        } else {
            debug!("GStreamer pipeline stopped for {}", self.uri);
        }
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        self.close();
    }
}
