use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FacewatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream source error: {0}")]
    Source(#[from] SourceError),

    #[error("Face extractor error: {0}")]
    Extractor(#[from] ExtractorError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl FacewatchError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by video source backends. Connectivity and decode failures
/// are recovered inside the stream worker; they never escape to callers.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect to '{uri}': {details}")]
    Connect { uri: String, details: String },

    #[error("Connectivity probe failed for '{uri}': {details}")]
    Probe { uri: String, details: String },

    #[error("Connectivity probe timed out for '{uri}' after {timeout:?}")]
    ProbeTimeout { uri: String, timeout: Duration },

    #[error("Frame read failed: {details}")]
    Read { details: String },

    #[error("Frame decode failed: {details}")]
    Decode { details: String },

    #[error("No backend available for '{uri}': {details}")]
    Unsupported { uri: String, details: String },

    #[error("Source is closed")]
    Closed,
}

impl SourceError {
    pub fn connect<S: Into<String>>(uri: S, details: S) -> Self {
        Self::Connect {
            uri: uri.into(),
            details: details.into(),
        }
    }

    pub fn read<S: Into<String>>(details: S) -> Self {
        Self::Read {
            details: details.into(),
        }
    }

    pub fn decode<S: Into<String>>(details: S) -> Self {
        Self::Decode {
            details: details.into(),
        }
    }
}

/// Errors raised by the opaque embedding extractor. Initialization failures
/// are fatal at service startup; inference failures surface as a typed
/// pipeline outcome rather than aborting the caller.
#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("Extractor initialization failed: {details}")]
    Init { details: String },

    #[error("Inference failed: {details}")]
    Inference { details: String },

    #[error("Unsupported input frame: {details}")]
    BadInput { details: String },
}

impl ExtractorError {
    pub fn init<S: Into<String>>(details: S) -> Self {
        Self::Init {
            details: details.into(),
        }
    }

    pub fn inference<S: Into<String>>(details: S) -> Self {
        Self::Inference {
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FacewatchError>;
