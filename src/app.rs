use crate::bus::{Router, TabChange, TabStatus, TabUpdate};
use crate::capture::{CaptureService, MediaType, SyntheticConfig, SyntheticSource};
use crate::config::Config;
use crate::context::{Context, ContextKind, TabId, TabInfo};
use crate::messages::Response;
use crate::recording::{
    BackgroundOrchestrator, CaptureSession, ContentOverlay, LogBadge, PageLauncher,
    RecordingControls, SessionPhase,
};
use crate::storage::{FileBackend, FileVideoStore, StorageArea, VideoStore};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

const FIRST_RECORDER_TAB: TabId = 100;
const PAGE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A line typed on stdin, standing in for popup and toolbar clicks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start(Option<MediaType>),
    Pause,
    Resume,
    Stop,
    Status,
    Click,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_lowercase();
        let argument = words.next();

        let parsed = match command.as_str() {
            "start" => Command::Start(argument.map(str::parse::<MediaType>).transpose()?),
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "stop" => Command::Stop,
            "status" => Command::Status,
            "click" => Command::Click,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(anyhow!("Unknown command: {:?} (try help)", other)),
        };
        Ok(parsed)
    }
}

struct RecorderPage {
    context: Context,
    unload: Option<oneshot::Sender<()>>,
    phase: watch::Receiver<SessionPhase>,
    session: JoinHandle<()>,
}

/// Opens recorder pages as new extension contexts, each owning a capture
/// service and running one capture session.
pub struct RecorderPageLauncher {
    router: Arc<Router>,
    recorder_page: String,
    source: SyntheticConfig,
    videos: Arc<dyn VideoStore>,
    next_tab: AtomicU32,
    pages: Mutex<Vec<RecorderPage>>,
}

impl RecorderPageLauncher {
    pub fn new(
        router: Arc<Router>,
        recorder_page: String,
        source: SyntheticConfig,
        videos: Arc<dyn VideoStore>,
    ) -> Self {
        Self {
            router,
            recorder_page,
            source,
            videos,
            next_tab: AtomicU32::new(FIRST_RECORDER_TAB),
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Tear down pages whose session has finished. Returns how many are still open.
    fn reap(&self) -> usize {
        let mut pages = self.pages.lock();
        let (finished, open): (Vec<_>, Vec<_>) =
            pages.drain(..).partition(|page| page.session.is_finished());
        *pages = open;

        for page in finished {
            page.context.teardown();
        }
        pages.len()
    }

    /// Unload every open page and wait for its session to wrap up.
    pub async fn close_all(&self) {
        let pages = std::mem::take(&mut *self.pages.lock());

        for mut page in pages {
            if let Some(unload) = page.unload.take() {
                let _ = unload.send(());
            }
            close_page(page).await;
        }
    }

    /// A page that already captured cannot take another request. Let it
    /// save what it has and close before a fresh page is opened.
    async fn close_finishing(&self) {
        let finishing: Vec<RecorderPage> = {
            let mut pages = self.pages.lock();
            let (finishing, waiting): (Vec<_>, Vec<_>) = pages
                .drain(..)
                .partition(|page| *page.phase.borrow() != SessionPhase::Waiting);
            *pages = waiting;
            finishing
        };

        for page in finishing {
            tracing::info!(
                "Waiting for recorder page {} to finish its recording",
                page.context.id()
            );
            close_page(page).await;
        }
    }

    fn tab_event(&self, tab: &TabInfo, status: TabStatus) {
        self.router.tab_updated(TabUpdate {
            tab_id: tab.id,
            change: TabChange {
                status: Some(status),
                url: Some(tab.url.clone()),
            },
            tab: tab.clone(),
        });
    }
}

#[async_trait]
impl PageLauncher for RecorderPageLauncher {
    async fn open_recorder(&self, media_type: MediaType) -> Result<()> {
        self.close_finishing().await;
        if self.reap() > 0 {
            tracing::info!("Recorder page already open, reusing it");
            return Ok(());
        }

        let tab = TabInfo {
            id: self.next_tab.fetch_add(1, Ordering::Relaxed),
            url: format!(
                "chrome-extension://tabcast/{}?mediaType={}",
                self.recorder_page, media_type
            ),
        };
        self.tab_event(&tab, TabStatus::Loading);

        let context = Context::spawn(&self.router, ContextKind::ExtensionPage, Some(tab.clone()));
        let source = Arc::new(SyntheticSource::new(self.source.clone()));
        let (service, recorder) = CaptureService::new(media_type, source);
        tokio::spawn(service.run());

        let session = CaptureSession::new(&context, Arc::new(recorder), self.videos.clone())?;
        let phase = session.phase();
        let (unload, unload_rx) = oneshot::channel();
        let session = tokio::spawn(async move {
            match session.run(unload_rx).await {
                Ok(Some(id)) => tracing::info!("Recorder page done, saved video {}", id),
                Ok(None) => tracing::info!("Recorder page done without a recording"),
                Err(e) => tracing::error!("Recorder page failed: {:#}", e),
            }
        });

        self.pages.lock().push(RecorderPage {
            context,
            unload: Some(unload),
            phase,
            session,
        });
        self.tab_event(&tab, TabStatus::Complete);
        Ok(())
    }
}

async fn close_page(mut page: RecorderPage) {
    if tokio::time::timeout(PAGE_CLOSE_TIMEOUT, &mut page.session)
        .await
        .is_err()
    {
        tracing::warn!("Recorder page {} did not close in time", page.context.id());
        page.session.abort();
    }
    page.context.teardown();
}

pub struct App {
    config: Config,
    background: Context,
    orchestrator: BackgroundOrchestrator,
    launcher: Arc<RecorderPageLauncher>,
    popup: Context,
    controls: RecordingControls,
    content: Context,
    overlay: ContentOverlay,
    active_tab: TabInfo,
    videos: Arc<FileVideoStore>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let storage = StorageArea::new(Arc::new(FileBackend::new(config.storage_dir()?)));
        let router = Router::new(storage, config.response_timeout());
        let videos = Arc::new(FileVideoStore::new(config.videos_dir()?));

        let launcher = Arc::new(RecorderPageLauncher::new(
            router.clone(),
            config.recorder_page.clone(),
            config.synthetic_source(),
            videos.clone(),
        ));

        let background = Context::spawn(&router, ContextKind::Background, None);
        let orchestrator = BackgroundOrchestrator::start(
            &background,
            launcher.clone(),
            Arc::new(LogBadge),
            config.background_settings(),
        )
        .await?;

        let active_tab = TabInfo {
            id: 1,
            url: "https://example.com/".to_string(),
        };
        let content = Context::spawn(&router, ContextKind::ContentScript, Some(active_tab.clone()));
        let overlay = ContentOverlay::new(&content);
        match overlay.report_status().await {
            Ok(report) => tracing::info!(
                "Content script in tab {} attached, recording state {}",
                active_tab.id,
                report.recording_state
            ),
            Err(e) => tracing::warn!("Content script could not reach the background: {:#}", e),
        }

        let popup = Context::spawn(&router, ContextKind::ExtensionPage, None);
        let controls = RecordingControls::new(&popup);

        tracing::info!("Ready! Type help for commands");

        Ok(Self {
            config,
            background,
            orchestrator,
            launcher,
            popup,
            controls,
            content,
            overlay,
            active_tab,
            videos,
        })
    }

    pub async fn run(self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tracing::debug!("Main loop: waiting for event");
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match line.parse::<Command>() {
                        Ok(Command::Quit) => break,
                        Ok(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                tracing::error!("Error handling {:?}: {:#}", command, e);
                            }
                        }
                        Err(e) => tracing::warn!("{}", e),
                    },
                    Ok(None) => {
                        tracing::info!("Input closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Failed to read input: {}", e);
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
        tracing::info!("Tabcast shutdown complete");
        Ok(())
    }

    async fn handle_command(&self, command: Command) -> Result<()> {
        match command {
            Command::Start(media_type) => {
                let media_type = media_type.unwrap_or(self.config.media_type);
                log_response("Start", &self.controls.start(media_type).await?);
                self.overlay.hide();
            }
            Command::Pause => log_response("Pause", &self.controls.pause().await?),
            Command::Resume => log_response("Resume", &self.controls.resume().await?),
            Command::Stop => log_response("Stop", &self.controls.stop().await?),
            Command::Status => {
                let status = self.controls.status().await?;
                tracing::info!(
                    "State {}, {}s recorded",
                    status.recording_state,
                    status.recording_time
                );
                if let Some(url) = self.videos.get_latest_video().await? {
                    tracing::info!("Latest video: {}", url);
                }
            }
            Command::Click => {
                self.orchestrator
                    .handle_action_click(&self.active_tab)
                    .await?;
                if self.overlay.is_visible() {
                    tracing::info!("Recorder popup open, type start [screen|camera]");
                }
            }
            Command::Help => tracing::info!(
                "Commands: start [screen|camera], pause, resume, stop, status, click, quit"
            ),
            Command::Quit => {}
        }
        Ok(())
    }

    pub async fn shutdown(self) {
        // Pages first so an active recording is stopped and saved
        self.launcher.close_all().await;
        self.orchestrator.shutdown().await;

        self.overlay.dispose();
        self.content.teardown();
        self.popup.teardown();
        self.background.teardown();
    }
}

fn log_response(action: &str, response: &Response) {
    if response.success {
        tracing::info!("{} accepted", action);
    } else {
        tracing::warn!(
            "{} refused: {}",
            action,
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
}
