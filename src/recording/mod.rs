pub mod background;
pub mod badge;
pub mod controls;
pub mod session;
pub mod state_machine;

pub use background::{
    BackgroundOrchestrator, BackgroundSettings, PageLauncher, RecordingTime, StatusReport,
};
pub use badge::{Badge, LogBadge};
pub use controls::{ContentOverlay, RecordingControls};
pub use session::{CaptureSession, SessionPhase};
pub use state_machine::{
    RecordingEvent, RecordingState, RecordingStateMachine, RecordingStatus, TransitionError,
    next_state,
};
