use super::{CaptureError, MediaType};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// An open capture stream.
///
/// Chunks arrive on `chunks`. Dropping the stream stops the producer.
pub struct SourceStream {
    pub chunks: mpsc::Receiver<Vec<u8>>,
    pub ended: watch::Receiver<bool>,
    producer: JoinHandle<()>,
}

impl Drop for SourceStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Something that can be asked for a capture stream, subject to consent.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, media_type: MediaType) -> Result<SourceStream, CaptureError>;
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub chunk_interval: Duration,
    pub chunk_size: usize,
    /// When false every request is treated as a denied consent prompt
    pub grant_permission: bool,
    /// End the stream on its own after this long, as if the user stopped sharing
    pub max_duration: Option<Duration>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            chunk_interval: Duration::from_millis(100),
            chunk_size: 4096,
            grant_permission: true,
            max_duration: None,
        }
    }
}

/// Produces test-pattern chunks at a fixed rate.
pub struct SyntheticSource {
    config: SyntheticConfig,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    async fn produce(
        config: SyntheticConfig,
        tx: mpsc::Sender<Vec<u8>>,
        ended: watch::Sender<bool>,
    ) {
        let deadline = config.max_duration.map(|d| Instant::now() + d);
        let mut ticker = tokio::time::interval(config.chunk_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick is immediate
        ticker.tick().await;

        let mut frame: u8 = 0;
        loop {
            ticker.tick().await;

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                tracing::info!("Synthetic stream ended by source");
                ended.send_replace(true);
                break;
            }

            if tx.send(vec![frame; config.chunk_size]).await.is_err() {
                break;
            }
            frame = frame.wrapping_add(1);
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn open(&self, media_type: MediaType) -> Result<SourceStream, CaptureError> {
        if !self.config.grant_permission {
            tracing::warn!("Consent for {} capture denied", media_type);
            return Err(CaptureError::PermissionDenied(media_type));
        }
        if self.config.chunk_interval.is_zero() {
            return Err(CaptureError::Device("chunk interval must be non-zero".to_string()));
        }

        let (tx, chunks) = mpsc::channel(100);
        let (ended_tx, ended) = watch::channel(false);
        let producer = tokio::spawn(Self::produce(self.config.clone(), tx, ended_tx));

        tracing::info!("Synthetic {} capture started", media_type);
        Ok(SourceStream {
            chunks,
            ended,
            producer,
        })
    }
}
