use super::badge::{Badge, format_badge_text};
use super::state_machine::{RecordingEvent, RecordingState, RecordingStateMachine};
use crate::bus::{HandlerOutcome, HandlerToken, MessageBus, TabStatus, Target};
use crate::capture::MediaType;
use crate::context::{Context, TabInfo};
use crate::messages::{Message, MessageType, Response};
use crate::store::{Store, StoreOptions, StoreState, Subscription};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};

pub const TIME_KEY: &str = "recordingTime";

/// Persisted shape under [`TIME_KEY`], in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingTime {
    pub recording_time: u64,
}

impl StoreState for RecordingTime {}

/// Answer to `GET_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub recording_state: RecordingState,
    pub recording_time: u64,
    pub recording: bool,
}

/// Opens (or focuses) the dedicated recorder page.
#[async_trait]
pub trait PageLauncher: Send + Sync {
    async fn open_recorder(&self, media_type: MediaType) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BackgroundSettings {
    pub timer_interval: Duration,
    pub badge_color: String,
    pub recorder_page: String,
    pub default_media: MediaType,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            timer_interval: Duration::from_secs(1),
            badge_color: "#FF0000".to_string(),
            recorder_page: "recorder.html".to_string(),
            default_media: MediaType::Screen,
        }
    }
}

pub struct BackgroundOrchestrator {
    bus: MessageBus,
    machine: RecordingStateMachine,
    time: Store<RecordingTime>,
    settings: BackgroundSettings,
    tokens: Vec<HandlerToken>,
    subscriptions: Vec<Subscription>,
    timer: JoinHandle<()>,
}

impl BackgroundOrchestrator {
    pub async fn start(
        context: &Context,
        launcher: Arc<dyn PageLauncher>,
        badge: Arc<dyn Badge>,
        settings: BackgroundSettings,
    ) -> Result<Self> {
        let machine = RecordingStateMachine::new(context)?;
        let time = context.store(StoreOptions::persisted(TIME_KEY), RecordingTime::default)?;
        machine.ready().await;
        time.ready().await;

        let bus = context.bus().clone();
        let mut subscriptions = Vec::new();

        badge.set_text(&format_badge_text(time.get_state().recording_time));
        subscriptions.push(time.subscribe({
            let badge = badge.clone();
            move |time: &RecordingTime| badge.set_text(&format_badge_text(time.recording_time))
        }));

        let (state_tx, state_rx) = mpsc::unbounded_channel();
        // Pick up a recording that was running before a restart
        let _ = state_tx.send(machine.current_state());
        subscriptions.push(machine.on({
            let badge = badge.clone();
            let time = time.clone();
            let color = settings.badge_color.clone();
            move |state| {
                match state {
                    RecordingState::Recording => badge.set_background_color(&color),
                    RecordingState::Idle => reset_time(&time),
                    _ => {}
                }
                let _ = state_tx.send(state);
            }
        }));

        let timer = tokio::spawn(run_timer(
            state_rx,
            machine.clone(),
            time.clone(),
            settings.timer_interval,
        ));

        let mut orchestrator = Self {
            bus,
            machine,
            time,
            settings,
            tokens: Vec::new(),
            subscriptions,
            timer,
        };
        orchestrator.register_handlers(launcher);

        tracing::info!(
            "Background ready, recording state {}",
            orchestrator.machine.current_state()
        );
        Ok(orchestrator)
    }

    fn register_handlers(&mut self, launcher: Arc<dyn PageLauncher>) {
        let machine = self.machine.clone();
        let default_media = self.settings.default_media;
        self.tokens.push(self.bus.on_runtime_message(
            MessageType::StartRecording,
            move |message, _, responder| {
                let media_type = match message.payload_str("mediaType") {
                    Some(raw) => raw.parse()?,
                    None => default_media,
                };
                machine.transition(RecordingEvent::Start)?;

                let machine = machine.clone();
                let launcher = launcher.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    match launcher.open_recorder(media_type).await {
                        Ok(()) => {
                            responder.send_response(Response::ok_with(json!({
                                "mediaType": media_type
                            })));
                        }
                        Err(e) => {
                            tracing::error!("Failed to open recorder page: {:#}", e);
                            if machine.current_state() == RecordingState::Pending
                                && let Err(e) = machine.transition(RecordingEvent::Cancel)
                            {
                                tracing::error!(
                                    "Failed to cancel recording after launch failure: {}",
                                    e
                                );
                            }
                            responder.send_response(Response::failure(format!("{:#}", e)));
                        }
                    }
                });
                Ok(HandlerOutcome::KeepChannelOpen)
            },
        ));

        let (machine, time) = (self.machine.clone(), self.time.clone());
        self.tokens.push(
            self.bus
                .on_runtime_message(MessageType::GetStatus, move |_, _, responder| {
                    let report = serde_json::to_value(status_report(&machine, &time))?;
                    responder.send_response(Response::ok_with(report));
                    Ok(HandlerOutcome::Done)
                }),
        );

        let (machine, time) = (self.machine.clone(), self.time.clone());
        self.tokens.push(self.bus.on_tab_message(
            MessageType::ReportStatus,
            move |message, sender, responder| {
                let tab = sender.tab.as_ref().map(|tab| tab.id);
                tracing::debug!("Tab {:?} reported {:?}", tab, message.payload);
                let report = serde_json::to_value(status_report(&machine, &time))?;
                responder.send_response(Response::ok_with(report));
                Ok(HandlerOutcome::Done)
            },
        ));

        let recorder_page = self.settings.recorder_page.clone();
        self.tokens
            .push(self.bus.on_tab_update(TabStatus::Complete, move |update| {
                if update.tab.url.contains(&recorder_page) {
                    tracing::info!(
                        "Recorder tab {} finished loading: {}",
                        update.tab_id,
                        update.tab.url
                    );
                }
                Ok(())
            }));
    }

    pub fn state_machine(&self) -> &RecordingStateMachine {
        &self.machine
    }

    /// Toolbar button. While a recording is live the page that owns the
    /// capture is asked to stop; otherwise the tab's content script is asked
    /// to show the recorder popup.
    pub async fn handle_action_click(&self, tab: &TabInfo) -> Result<()> {
        let state = self.machine.current_state();

        if state.is_active() {
            let response = self
                .bus
                .send(Message::new(MessageType::StopRecording), Target::Broadcast)
                .await;
            match response {
                Some(response) if response.success => tracing::info!("Recording stop requested"),
                Some(response) => {
                    tracing::warn!("Recorder refused to stop: {:?}", response.error)
                }
                None => {
                    // Nobody owns the capture any more
                    tracing::warn!("No recorder answered, stopping from background");
                    self.machine.transition(RecordingEvent::Stop)?;
                }
            }
            return Ok(());
        }

        if tab.url.starts_with("chrome://") || tab.url.starts_with("chrome-extension://") {
            tracing::info!("Cannot show the recorder popup on {}", tab.url);
            return Ok(());
        }

        match self
            .bus
            .send_to_tab(tab.id, Message::new(MessageType::ShowRecorderPopup))
            .await
        {
            Some(response) if response.success => {}
            Some(response) => tracing::warn!("Tab {} refused popup: {:?}", tab.id, response.error),
            None => tracing::warn!("No content script in tab {}", tab.id),
        }
        Ok(())
    }

    pub async fn shutdown(self) {
        for token in &self.tokens {
            self.bus.unregister(token);
        }
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        self.timer.abort();

        self.machine.flush().await;
        self.time.flush().await;
        tracing::info!("Background stopped");
    }
}

fn status_report(machine: &RecordingStateMachine, time: &Store<RecordingTime>) -> StatusReport {
    let state = machine.current_state();
    StatusReport {
        recording_state: state,
        recording_time: time.get_state().recording_time,
        recording: state.is_active(),
    }
}

fn reset_time(time: &Store<RecordingTime>) {
    if time.get_state().recording_time == 0 {
        return;
    }
    if let Err(e) = time.replace(RecordingTime::default()) {
        tracing::error!("Failed to reset recording time: {}", e);
    }
}

async fn run_timer(
    mut states: mpsc::UnboundedReceiver<RecordingState>,
    machine: RecordingStateMachine,
    time: Store<RecordingTime>,
    period: Duration,
) {
    let mut ticker: Option<Interval> = None;

    loop {
        tokio::select! {
            biased;

            state = states.recv() => match state {
                Some(RecordingState::Recording) => {
                    if ticker.is_none() {
                        ticker = Some(tokio::time::interval_at(Instant::now() + period, period));
                        tracing::debug!("Recording timer started");
                    }
                }
                Some(RecordingState::Pending) => {}
                Some(RecordingState::Idle) => {
                    ticker = None;
                    reset_time(&time);
                }
                Some(_) => {
                    if ticker.take().is_some() {
                        tracing::debug!("Recording timer stopped");
                    }
                }
                None => break,
            },

            _ = next_tick(&mut ticker), if ticker.is_some() => {
                if machine.current_state() == RecordingState::Recording {
                    let result = time.update(|time| RecordingTime {
                        recording_time: time.recording_time + 1,
                    });
                    if let Err(e) = result {
                        tracing::error!("Failed to advance recording time: {}", e);
                    }
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
