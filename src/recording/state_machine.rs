use crate::context::Context;
use crate::store::{Store, StoreError, StoreOptions, StoreState, Subscription};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const STATE_KEY: &str = "recordingState";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingState {
    #[default]
    Idle,
    /// Consent requested, no stream yet
    Pending,
    Recording,
    Paused,
    Stopped,
}

impl RecordingState {
    pub const ALL: [RecordingState; 5] = [
        RecordingState::Idle,
        RecordingState::Pending,
        RecordingState::Recording,
        RecordingState::Paused,
        RecordingState::Stopped,
    ];

    /// Recording or paused, i.e. a capture device is held.
    pub fn is_active(self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Idle => "IDLE",
            RecordingState::Pending => "PENDING",
            RecordingState::Recording => "RECORDING",
            RecordingState::Paused => "PAUSED",
            RecordingState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingEvent {
    Start,
    Confirm,
    Cancel,
    Pause,
    Resume,
    Stop,
    Idle,
}

impl RecordingEvent {
    pub const ALL: [RecordingEvent; 7] = [
        RecordingEvent::Start,
        RecordingEvent::Confirm,
        RecordingEvent::Cancel,
        RecordingEvent::Pause,
        RecordingEvent::Resume,
        RecordingEvent::Stop,
        RecordingEvent::Idle,
    ];
}

impl fmt::Display for RecordingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingEvent::Start => "START",
            RecordingEvent::Confirm => "CONFIRM",
            RecordingEvent::Cancel => "CANCEL",
            RecordingEvent::Pause => "PAUSE",
            RecordingEvent::Resume => "RESUME",
            RecordingEvent::Stop => "STOP",
            RecordingEvent::Idle => "IDLE",
        };
        f.write_str(name)
    }
}

/// The transition table. `None` marks an illegal move.
pub fn next_state(state: RecordingState, event: RecordingEvent) -> Option<RecordingState> {
    use RecordingEvent as E;
    use RecordingState as S;

    match (state, event) {
        (S::Idle, E::Start) => Some(S::Pending),
        (S::Pending, E::Confirm) => Some(S::Recording),
        (S::Pending, E::Cancel) => Some(S::Idle),
        (S::Recording, E::Pause) => Some(S::Paused),
        (S::Recording, E::Stop) => Some(S::Stopped),
        (S::Paused, E::Resume) => Some(S::Recording),
        (S::Paused, E::Stop) => Some(S::Stopped),
        (S::Stopped, E::Start) => Some(S::Pending),
        (S::Stopped, E::Idle) => Some(S::Idle),
        _ => None,
    }
}

/// Persisted shape under [`STATE_KEY`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub recording_state: RecordingState,
}

impl StoreState for RecordingStatus {}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("recording state has not been loaded yet")]
    NotReady,
    #[error("illegal transition {event} from {state}")]
    Illegal {
        state: RecordingState,
        event: RecordingEvent,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One context's view of the shared recording state.
#[derive(Clone)]
pub struct RecordingStateMachine {
    store: Store<RecordingStatus>,
}

impl RecordingStateMachine {
    pub fn new(context: &Context) -> Result<Self, StoreError> {
        let store = context.store(StoreOptions::persisted(STATE_KEY), RecordingStatus::default)?;
        Ok(Self { store })
    }

    /// Wait until the persisted state has been loaded. Transitions fail
    /// with [`TransitionError::NotReady`] before that.
    pub async fn ready(&self) {
        self.store.ready().await;
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_ready()
    }

    pub fn current_state(&self) -> RecordingState {
        self.store.get_state().recording_state
    }

    pub fn transition(&self, event: RecordingEvent) -> Result<RecordingState, TransitionError> {
        if !self.store.is_ready() {
            tracing::warn!("Transition {} attempted before state was loaded", event);
            return Err(TransitionError::NotReady);
        }

        let result = self.store.try_update(|status| {
            let state = status.recording_state;
            next_state(state, event)
                .map(|next| RecordingStatus {
                    recording_state: next,
                })
                .ok_or(TransitionError::Illegal { state, event })
        });

        match result {
            Ok(status) => {
                tracing::info!("Recording state -> {} ({})", status.recording_state, event);
                Ok(status.recording_state)
            }
            Err(e) => {
                tracing::warn!("{}", e);
                Err(e)
            }
        }
    }

    /// Called with the current state after every change, local or remote.
    pub fn on(&self, listener: impl Fn(RecordingState) + Send + Sync + 'static) -> Subscription {
        self.store
            .subscribe(move |status: &RecordingStatus| listener(status.recording_state))
    }

    /// Wait for queued state writes to reach storage.
    pub async fn flush(&self) {
        self.store.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Router;
    use crate::context::ContextKind;
    use crate::storage::{MemoryBackend, StorageArea, StorageBackend};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct CountingBackend {
        inner: MemoryBackend,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for CountingBackend {
        async fn load(&self, key: &str) -> anyhow::Result<Option<Value>> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, value: &Value) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(key, value).await
        }
    }

    async fn machine_with_counter() -> (Context, RecordingStateMachine, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend {
            inner: MemoryBackend::new(),
            saves: AtomicUsize::new(0),
        });
        let router = Router::new(StorageArea::new(backend.clone()), Duration::from_secs(1));
        let context = Context::spawn(&router, ContextKind::Background, None);
        let machine = RecordingStateMachine::new(&context).unwrap();
        machine.ready().await;
        (context, machine, backend)
    }

    /// Drive the machine to `state` with legal events only.
    fn reach(machine: &RecordingStateMachine, state: RecordingState) {
        use RecordingEvent as E;
        let path: &[E] = match state {
            RecordingState::Idle => &[],
            RecordingState::Pending => &[E::Start],
            RecordingState::Recording => &[E::Start, E::Confirm],
            RecordingState::Paused => &[E::Start, E::Confirm, E::Pause],
            RecordingState::Stopped => &[E::Start, E::Confirm, E::Stop],
        };
        for event in path {
            machine.transition(*event).unwrap();
        }
        assert_eq!(machine.current_state(), state);
    }

    #[test]
    fn test_table_has_nine_legal_moves() {
        let legal = RecordingState::ALL
            .iter()
            .flat_map(|s| RecordingEvent::ALL.iter().map(move |e| (*s, *e)))
            .filter(|(s, e)| next_state(*s, *e).is_some())
            .count();
        assert_eq!(legal, 9);
    }

    #[tokio::test]
    async fn test_illegal_transitions_change_nothing() {
        for state in RecordingState::ALL {
            for event in RecordingEvent::ALL {
                if next_state(state, event).is_some() {
                    continue;
                }
                let (_context, machine, backend) = machine_with_counter().await;
                reach(&machine, state);
                machine.flush().await;
                let writes = backend.saves.load(Ordering::SeqCst);

                let result = machine.transition(event);
                machine.flush().await;

                assert!(
                    matches!(result, Err(TransitionError::Illegal { .. })),
                    "{} from {}",
                    event,
                    state
                );
                assert_eq!(machine.current_state(), state);
                assert_eq!(backend.saves.load(Ordering::SeqCst), writes);
            }
        }
    }

    #[tokio::test]
    async fn test_legal_transitions_write_once() {
        for state in RecordingState::ALL {
            for event in RecordingEvent::ALL {
                let Some(expected) = next_state(state, event) else {
                    continue;
                };
                let (_context, machine, backend) = machine_with_counter().await;
                reach(&machine, state);
                machine.flush().await;
                let writes = backend.saves.load(Ordering::SeqCst);

                assert_eq!(machine.transition(event).unwrap(), expected);
                machine.flush().await;

                assert_eq!(machine.current_state(), expected);
                assert_eq!(backend.saves.load(Ordering::SeqCst), writes + 1);
            }
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (_context, machine, _) = machine_with_counter().await;
        use RecordingEvent as E;
        use RecordingState as S;

        assert_eq!(machine.current_state(), S::Idle);
        assert_eq!(machine.transition(E::Start).unwrap(), S::Pending);
        assert_eq!(machine.transition(E::Confirm).unwrap(), S::Recording);
        assert_eq!(machine.transition(E::Pause).unwrap(), S::Paused);
        assert_eq!(machine.transition(E::Resume).unwrap(), S::Recording);
        assert_eq!(machine.transition(E::Stop).unwrap(), S::Stopped);
        assert_eq!(machine.transition(E::Idle).unwrap(), S::Idle);
    }

    #[tokio::test]
    async fn test_cancel_then_confirm_is_illegal() {
        let (_context, machine, _) = machine_with_counter().await;

        machine.transition(RecordingEvent::Start).unwrap();
        assert_eq!(
            machine.transition(RecordingEvent::Cancel).unwrap(),
            RecordingState::Idle
        );
        assert!(machine.transition(RecordingEvent::Confirm).is_err());
        assert_eq!(machine.current_state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_transition_before_ready_is_refused() {
        let router = Router::new(StorageArea::in_memory(), Duration::from_secs(1));
        let context = Context::spawn(&router, ContextKind::ExtensionPage, None);
        let machine = RecordingStateMachine::new(&context).unwrap();

        // The initial load runs on a spawned task that has not been polled yet
        assert!(!machine.is_ready());
        assert!(matches!(
            machine.transition(RecordingEvent::Start),
            Err(TransitionError::NotReady)
        ));

        machine.ready().await;
        assert!(machine.transition(RecordingEvent::Start).is_ok());
    }

    #[tokio::test]
    async fn test_other_contexts_see_transitions() {
        let router = Router::new(StorageArea::in_memory(), Duration::from_secs(1));
        let background = Context::spawn(&router, ContextKind::Background, None);
        let page = Context::spawn(&router, ContextKind::ExtensionPage, None);

        let owner = RecordingStateMachine::new(&background).unwrap();
        let observer = RecordingStateMachine::new(&page).unwrap();
        owner.ready().await;
        observer.ready().await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        observer.on(move |state| {
            let _ = seen_tx.send(state);
        });

        owner.transition(RecordingEvent::Start).unwrap();
        owner.transition(RecordingEvent::Confirm).unwrap();

        assert_eq!(seen_rx.recv().await, Some(RecordingState::Pending));
        assert_eq!(seen_rx.recv().await, Some(RecordingState::Recording));
        assert_eq!(observer.current_state(), RecordingState::Recording);
    }

    #[test]
    fn test_persisted_shape() {
        let status = RecordingStatus {
            recording_state: RecordingState::Paused,
        };
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            serde_json::json!({"recordingState": "PAUSED"})
        );
    }
}
