use super::background::StatusReport;
use crate::bus::{HandlerOutcome, HandlerToken, MessageBus, Target};
use crate::capture::MediaType;
use crate::context::Context;
use crate::messages::{Message, MessageType, Response};
use anyhow::{Result, anyhow, bail};
use serde_json::{Map, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Popup buttons. Every action is a request to whichever context handles it.
#[derive(Clone)]
pub struct RecordingControls {
    bus: MessageBus,
}

impl RecordingControls {
    pub fn new(context: &Context) -> Self {
        Self {
            bus: context.bus().clone(),
        }
    }

    pub async fn start(&self, media_type: MediaType) -> Result<Response> {
        let mut payload = Map::new();
        payload.insert("mediaType".to_string(), json!(media_type));
        self.request(Message::with_payload(MessageType::StartRecording, payload))
            .await
    }

    pub async fn stop(&self) -> Result<Response> {
        self.request(Message::new(MessageType::StopRecording)).await
    }

    pub async fn pause(&self) -> Result<Response> {
        self.request(Message::new(MessageType::PauseRecording)).await
    }

    pub async fn resume(&self) -> Result<Response> {
        self.request(Message::new(MessageType::ResumeRecording)).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let response = self.request(Message::new(MessageType::GetStatus)).await?;
        if !response.success {
            bail!(
                "Status request failed: {}",
                response.error.unwrap_or_default()
            );
        }
        let data = response
            .data
            .ok_or_else(|| anyhow!("Status response carried no data"))?;
        Ok(serde_json::from_value(data)?)
    }

    async fn request(&self, message: Message) -> Result<Response> {
        let kind = message.kind;
        self.bus
            .send(message, Target::Broadcast)
            .await
            .ok_or_else(|| anyhow!("No context answered {:?}", kind))
    }
}

/// Content-script overlay that shows the recorder popup on request.
pub struct ContentOverlay {
    bus: MessageBus,
    token: HandlerToken,
    visible: Arc<AtomicBool>,
}

impl ContentOverlay {
    pub fn new(context: &Context) -> Self {
        let bus = context.bus().clone();
        let visible = Arc::new(AtomicBool::new(false));

        let shown = visible.clone();
        let tab = context.sender().tab.as_ref().map(|tab| tab.id);
        let token = bus.on_runtime_message(MessageType::ShowRecorderPopup, move |_, _, responder| {
            shown.store(true, Ordering::SeqCst);
            tracing::info!("Recorder popup shown in tab {:?}", tab);
            responder.send_response(Response::ok());
            Ok(HandlerOutcome::Done)
        });

        Self {
            bus,
            token,
            visible,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn hide(&self) {
        self.visible.store(false, Ordering::SeqCst);
    }

    /// Tell the background this page is alive and get the current status back.
    pub async fn report_status(&self) -> Result<StatusReport> {
        let mut payload = Map::new();
        payload.insert("overlayVisible".to_string(), json!(self.is_visible()));
        let response = self
            .bus
            .send(
                Message::with_payload(MessageType::ReportStatus, payload),
                Target::Broadcast,
            )
            .await
            .ok_or_else(|| anyhow!("Background did not answer the status report"))?;

        if !response.success {
            bail!("Status report refused: {}", response.error.unwrap_or_default());
        }
        let data = response
            .data
            .ok_or_else(|| anyhow!("Status report carried no data"))?;
        Ok(serde_json::from_value(data)?)
    }

    pub fn dispose(self) {
        self.bus.unregister(&self.token);
    }
}
