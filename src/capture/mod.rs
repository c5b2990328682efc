mod service;
mod source;

pub use service::{CaptureCommand, CaptureHandle, CaptureService};
pub use source::{FrameSource, SourceStream, SyntheticConfig, SyntheticSource};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Screen,
    Camera,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Screen => write!(f, "screen"),
            MediaType::Camera => write!(f, "camera"),
        }
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "screen" => Ok(MediaType::Screen),
            "camera" => Ok(MediaType::Camera),
            other => anyhow::bail!("Unknown media type: {:?} (expected screen or camera)", other),
        }
    }
}

/// Encoded recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl Blob {
    pub fn webm(bytes: Vec<u8>) -> Self {
        Self {
            mime: "video/webm".to_string(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("permission to capture the {0} was denied")]
    PermissionDenied(MediaType),
    #[error("no capture in progress")]
    NotStarted,
    #[error("a capture is already in progress")]
    AlreadyRecording,
    #[error("capture service has stopped")]
    ServiceStopped,
    #[error("capture device error: {0}")]
    Device(String),
}

/// A live capture stream as seen by observers.
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    pub media_type: MediaType,
    ended: watch::Receiver<bool>,
}

impl MediaStreamHandle {
    pub(crate) fn new(media_type: MediaType, ended: watch::Receiver<bool>) -> Self {
        Self { media_type, ended }
    }

    /// Resolves when the stream ends. Returns true when the source ended it
    /// (the user stopped sharing), false when it was closed by a stop.
    pub async fn ended(&self) -> bool {
        let mut ended = self.ended.clone();
        ended.wait_for(|ended| *ended).await.is_ok()
    }
}

/// Narrow capability the recording lifecycle drives.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn start_recording(&self) -> Result<(), CaptureError>;

    async fn pause_recording(&self) -> Result<(), CaptureError>;

    async fn resume_recording(&self) -> Result<(), CaptureError>;

    async fn stop_recording(&self) -> Result<Blob, CaptureError>;

    /// Resolves once a stream is attached, even if it was attached before
    /// the call. `None` if the recorder went away first.
    async fn get_stream(&self) -> Option<MediaStreamHandle>;
}
