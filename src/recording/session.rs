use super::state_machine::{RecordingEvent, RecordingState, RecordingStateMachine};
use crate::bus::{HandlerOutcome, HandlerToken, MessageBus};
use crate::capture::{CaptureError, MediaStreamHandle, Recorder};
use crate::context::Context;
use crate::messages::{MessageType, Response};
use crate::storage::{VideoId, VideoStore};
use crate::store::StoreError;
use anyhow::{Context as _, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// How far a session has got. Only a `Waiting` session can take a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Waiting,
    Capturing,
    Saving,
}

/// Recorder page side of a recording. Once capture is underway this is the
/// only context issuing transitions.
pub struct CaptureSession {
    bus: MessageBus,
    machine: RecordingStateMachine,
    recorder: Arc<dyn Recorder>,
    videos: Arc<dyn VideoStore>,
    phase: watch::Sender<SessionPhase>,
}

impl CaptureSession {
    pub fn new(
        context: &Context,
        recorder: Arc<dyn Recorder>,
        videos: Arc<dyn VideoStore>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            bus: context.bus().clone(),
            machine: RecordingStateMachine::new(context)?,
            recorder,
            videos,
            phase: watch::channel(SessionPhase::Waiting).0,
        })
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Drive one recording from PENDING back to IDLE.
    ///
    /// Returns the saved video, or `None` when nothing was recorded (consent
    /// denied, page closed before starting).
    pub async fn run(self, mut unload: oneshot::Receiver<()>) -> Result<Option<VideoId>> {
        self.machine.ready().await;

        let (state_tx, mut states) = mpsc::unbounded_channel();
        let subscription = self.machine.on(move |state| {
            let _ = state_tx.send(state);
        });
        let tokens = self.register_handlers();

        let result = self.drive(&mut states, &mut unload).await;

        subscription.unsubscribe();
        for token in &tokens {
            self.bus.unregister(token);
        }
        result
    }

    fn register_handlers(&self) -> Vec<HandlerToken> {
        [
            (MessageType::StopRecording, RecordingEvent::Stop),
            (MessageType::PauseRecording, RecordingEvent::Pause),
            (MessageType::ResumeRecording, RecordingEvent::Resume),
        ]
        .into_iter()
        .map(|(message, event)| {
            let machine = self.machine.clone();
            self.bus
                .on_runtime_message(message, move |_, _, responder| {
                    let state = machine.transition(event)?;
                    responder.send_response(Response::ok_with(json!({ "recordingState": state })));
                    Ok(HandlerOutcome::Done)
                })
        })
        .collect()
    }

    async fn drive(
        &self,
        states: &mut mpsc::UnboundedReceiver<RecordingState>,
        unload: &mut oneshot::Receiver<()>,
    ) -> Result<Option<VideoId>> {
        let mut started = false;
        let mut capture_paused = false;
        let mut unloaded = false;
        let mut stream: Option<MediaStreamHandle> = None;
        let mut state = self.machine.current_state();

        loop {
            match state {
                RecordingState::Pending if !started => {
                    if !self.acquire(unload).await? {
                        return Ok(None);
                    }
                    started = true;
                    self.phase.send_replace(SessionPhase::Capturing);
                    stream = self.recorder.get_stream().await;
                }
                RecordingState::Recording | RecordingState::Paused if !started => {
                    tracing::warn!("Found {} with no capture on this page, stopping it", state);
                    self.fire(RecordingEvent::Stop);
                }
                RecordingState::Stopped if !started => self.fire(RecordingEvent::Idle),
                RecordingState::Recording if capture_paused => {
                    self.recorder.resume_recording().await?;
                    capture_paused = false;
                }
                RecordingState::Paused if !capture_paused => {
                    self.recorder.pause_recording().await?;
                    capture_paused = true;
                }
                RecordingState::Stopped => return self.finalize().await,
                RecordingState::Pending => {
                    // A new request came in before this capture saw its stop
                    tracing::info!("New recording requested, saving this one first");
                    return self.finalize().await;
                }
                RecordingState::Idle if started => {
                    tracing::warn!("Recording was reset elsewhere, discarding capture");
                    let _ = self.recorder.stop_recording().await;
                    return Ok(None);
                }
                _ => {}
            }

            tokio::select! {
                next = states.recv() => match next {
                    Some(next) => state = next,
                    None => return Ok(None),
                },

                ended = stream_ended(&stream) => {
                    stream = None;
                    if ended && self.machine.current_state().is_active() {
                        tracing::info!("Capture stream ended, stopping recording");
                        self.fire(RecordingEvent::Stop);
                    }
                }

                _ = &mut *unload, if !unloaded => {
                    unloaded = true;
                    if !started {
                        return Ok(None);
                    }
                    if self.machine.current_state().is_active() {
                        tracing::info!("Recorder page unloading, stopping recording");
                        self.fire(RecordingEvent::Stop);
                    }
                }
            }
        }
    }

    /// Ask for the stream and settle the pending request. Returns false when
    /// the request ended without a recording.
    async fn acquire(&self, unload: &mut oneshot::Receiver<()>) -> Result<bool> {
        match self.recorder.start_recording().await {
            Ok(()) => {
                let unloaded = !matches!(unload.try_recv(), Err(oneshot::error::TryRecvError::Empty));
                // The request may have been withdrawn while consent was pending
                if unloaded || self.machine.current_state() != RecordingState::Pending {
                    tracing::info!("Recording abandoned while waiting for the stream");
                    let _ = self.recorder.stop_recording().await;
                    if self.machine.current_state() == RecordingState::Pending {
                        self.fire(RecordingEvent::Cancel);
                    }
                    return Ok(false);
                }

                if self.machine.transition(RecordingEvent::Confirm).is_err() {
                    let _ = self.recorder.stop_recording().await;
                    return Ok(false);
                }
                Ok(true)
            }
            Err(CaptureError::PermissionDenied(media_type)) => {
                tracing::info!("Permission to capture {} denied, cancelling", media_type);
                self.fire(RecordingEvent::Cancel);
                Ok(false)
            }
            Err(e) => {
                self.fire(RecordingEvent::Cancel);
                Err(e).context("Failed to start capture")
            }
        }
    }

    async fn finalize(&self) -> Result<Option<VideoId>> {
        self.phase.send_replace(SessionPhase::Saving);
        let saved = match self.recorder.stop_recording().await {
            Ok(blob) if blob.is_empty() => {
                tracing::warn!("Recording produced no data, nothing to save");
                Ok(None)
            }
            Ok(blob) => self.videos.add_video(&blob).await.map(Some),
            Err(e) => Err(e).context("Failed to stop capture"),
        };

        // Back to IDLE even if saving failed, unless the next recording is already pending
        match self.machine.current_state() {
            RecordingState::Stopped => self.fire(RecordingEvent::Idle),
            state => tracing::info!("Leaving {} to the next recorder page", state),
        }

        let saved = saved.context("Failed to save recording")?;
        if let Some(id) = saved {
            tracing::info!("Recording saved as video {}", id);
        }
        Ok(saved)
    }

    fn fire(&self, event: RecordingEvent) {
        // Illegal moves are already logged by the machine
        let _ = self.machine.transition(event);
    }
}

async fn stream_ended(stream: &Option<MediaStreamHandle>) -> bool {
    match stream {
        Some(stream) => stream.ended().await,
        None => std::future::pending().await,
    }
}
