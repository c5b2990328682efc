use super::source::{FrameSource, SourceStream};
use super::{Blob, CaptureError, MediaStreamHandle, MediaType, Recorder};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub enum CaptureCommand {
    Start(oneshot::Sender<Result<(), CaptureError>>),
    Pause,
    Resume,
    Stop(oneshot::Sender<Result<Blob, CaptureError>>),
}

/// Owns the capture device for one recorder page.
///
/// This service:
/// - Opens the frame source on start (which may be refused)
/// - Collects chunks while not paused
/// - Drains what is left and hands back one blob on stop
pub struct CaptureService {
    media_type: MediaType,
    source: Arc<dyn FrameSource>,
    cmd_rx: mpsc::Receiver<CaptureCommand>,
    stream: Option<SourceStream>,
    stream_tx: watch::Sender<Option<MediaStreamHandle>>,
    buffer: Vec<u8>,
    capturing: bool,
    paused: bool,
}

impl CaptureService {
    pub fn new(media_type: MediaType, source: Arc<dyn FrameSource>) -> (Self, CaptureHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (stream_tx, stream_rx) = watch::channel(None);

        let service = Self {
            media_type,
            source,
            cmd_rx,
            stream: None,
            stream_tx,
            buffer: Vec::new(),
            capturing: false,
            paused: false,
        };
        (
            service,
            CaptureHandle {
                tx: cmd_tx,
                stream: stream_rx,
            },
        )
    }

    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                chunk = next_chunk(&mut self.stream), if self.capturing => match chunk {
                    Some(chunk) if !self.paused => self.buffer.extend_from_slice(&chunk),
                    Some(_) => {}
                    None => {
                        tracing::info!("Capture stream closed by source");
                        self.capturing = false;
                    }
                },
            }
        }
        tracing::debug!("Capture service finished");
    }

    async fn handle_command(&mut self, cmd: CaptureCommand) {
        match cmd {
            CaptureCommand::Start(reply) => {
                let _ = reply.send(self.start().await);
            }

            CaptureCommand::Pause => {
                if self.stream.is_some() {
                    self.paused = true;
                    tracing::info!("Capture paused");
                } else {
                    tracing::warn!("Pause requested with no capture in progress");
                }
            }

            CaptureCommand::Resume => {
                if self.stream.is_some() {
                    self.paused = false;
                    tracing::info!("Capture resumed");
                } else {
                    tracing::warn!("Resume requested with no capture in progress");
                }
            }

            CaptureCommand::Stop(reply) => {
                let _ = reply.send(self.stop());
            }
        }
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let stream = self.source.open(self.media_type).await?;
        self.stream_tx.send_replace(Some(MediaStreamHandle::new(
            self.media_type,
            stream.ended.clone(),
        )));
        self.stream = Some(stream);
        self.buffer.clear();
        self.capturing = true;
        self.paused = false;

        tracing::info!("Capture started ({})", self.media_type);
        Ok(())
    }

    fn stop(&mut self) -> Result<Blob, CaptureError> {
        let Some(mut stream) = self.stream.take() else {
            return Err(CaptureError::NotStarted);
        };

        // Drain chunks the source produced before the stop
        while let Ok(chunk) = stream.chunks.try_recv() {
            if !self.paused {
                self.buffer.extend_from_slice(&chunk);
            }
        }
        drop(stream);

        self.stream_tx.send_replace(None);
        self.capturing = false;
        self.paused = false;

        let blob = Blob::webm(std::mem::take(&mut self.buffer));
        tracing::info!("Capture stopped ({} bytes)", blob.len());
        Ok(blob)
    }
}

async fn next_chunk(stream: &mut Option<SourceStream>) -> Option<Vec<u8>> {
    match stream {
        Some(stream) => stream.chunks.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle for communicating with the CaptureService
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<CaptureCommand>,
    stream: watch::Receiver<Option<MediaStreamHandle>>,
}

impl CaptureHandle {
    async fn command(&self, cmd: CaptureCommand) -> Result<(), CaptureError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| CaptureError::ServiceStopped)
    }
}

#[async_trait]
impl Recorder for CaptureHandle {
    async fn start_recording(&self) -> Result<(), CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.command(CaptureCommand::Start(reply)).await?;
        rx.await.map_err(|_| CaptureError::ServiceStopped)?
    }

    async fn pause_recording(&self) -> Result<(), CaptureError> {
        self.command(CaptureCommand::Pause).await
    }

    async fn resume_recording(&self) -> Result<(), CaptureError> {
        self.command(CaptureCommand::Resume).await
    }

    async fn stop_recording(&self) -> Result<Blob, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.command(CaptureCommand::Stop(reply)).await?;
        rx.await.map_err(|_| CaptureError::ServiceStopped)?
    }

    async fn get_stream(&self) -> Option<MediaStreamHandle> {
        let mut stream = self.stream.clone();
        let attached = stream.wait_for(Option::is_some).await.ok()?;
        Option::clone(&attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SyntheticConfig, SyntheticSource};
    use std::time::Duration;

    fn spawn(config: SyntheticConfig) -> CaptureHandle {
        let (service, handle) =
            CaptureService::new(MediaType::Screen, Arc::new(SyntheticSource::new(config)));
        tokio::spawn(service.run());
        handle
    }

    fn config() -> SyntheticConfig {
        SyntheticConfig {
            chunk_interval: Duration::from_millis(100),
            chunk_size: 10,
            grant_permission: true,
            max_duration: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_produces_blob() {
        let recorder = spawn(config());

        recorder.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        let blob = recorder.stop_recording().await.unwrap();

        assert_eq!(blob.mime, "video/webm");
        assert_eq!(blob.len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_chunks_are_dropped() {
        let recorder = spawn(config());

        recorder.start_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        recorder.pause_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        recorder.resume_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let blob = recorder.stop_recording().await.unwrap();

        // Two chunks before the pause, two after the resume
        assert_eq!(blob.len(), 40);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let recorder = spawn(config());
        assert!(matches!(
            recorder.stop_recording().await,
            Err(CaptureError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let recorder = spawn(config());
        recorder.start_recording().await.unwrap();
        assert!(matches!(
            recorder.start_recording().await,
            Err(CaptureError::AlreadyRecording)
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_propagates() {
        let recorder = spawn(SyntheticConfig {
            grant_permission: false,
            ..config()
        });
        assert!(matches!(
            recorder.start_recording().await,
            Err(CaptureError::PermissionDenied(MediaType::Screen))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_stream_after_start_and_source_end() {
        let recorder = spawn(SyntheticConfig {
            max_duration: Some(Duration::from_millis(250)),
            ..config()
        });

        recorder.start_recording().await.unwrap();
        let stream = recorder.get_stream().await.unwrap();
        assert_eq!(stream.media_type, MediaType::Screen);
        assert!(stream.ended().await);
    }
}
