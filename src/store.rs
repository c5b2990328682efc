//! Typed, change-notifying state backed by the shared storage area.
//!
//! A store keeps an in-memory snapshot that is updated synchronously by the
//! owning context and persisted in the background by a single writer task.
//! Changes written by other contexts arrive through the storage area and are
//! applied only when they differ from the current snapshot.

use crate::context::ContextId;
use crate::storage::{StorageArea, StorageChange};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("store {key} already exists with a different state type")]
    TypeMismatch { key: String },
    #[error("partial state for {key} must be a JSON object")]
    NotAnObject { key: String },
    #[error("failed to convert state for {key}: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// State that can live in a [`Store`].
///
/// Members marked `#[serde(skip)]` never reach storage; implement
/// `restore_transient` to carry them over from the previous value whenever
/// the snapshot is rebuilt from JSON.
pub trait StoreState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn restore_transient(&mut self, _previous: &Self) {}
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub key: String,
    pub persist: bool,
}

impl StoreOptions {
    pub fn persisted(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            persist: true,
        }
    }

    pub fn in_memory(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            persist: false,
        }
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum WriterCommand {
    Save(Value),
    Flush(oneshot::Sender<()>),
}

struct StoreInner<T> {
    key: String,
    context: ContextId,
    snapshot: RwLock<Arc<T>>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_listener: AtomicU64,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    // Own writes queued whose change has not come back from storage yet
    in_flight: Arc<AtomicUsize>,
    ready: watch::Receiver<bool>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Handle returned by [`Store::subscribe`]. Dropping it keeps the listener;
/// call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }
}

impl<T: StoreState> Store<T> {
    /// Build a store with the initializer's defaults.
    ///
    /// For persisted stores the stored value is loaded in the background and
    /// merged over the defaults; await [`Store::ready`] before relying on it.
    pub fn new(
        area: Arc<StorageArea>,
        context: ContextId,
        options: StoreOptions,
        initializer: impl FnOnce() -> T,
    ) -> Result<Self, StoreError> {
        if !is_valid_key(&options.key) {
            return Err(StoreError::InvalidKey(options.key));
        }

        let (ready_tx, ready_rx) = watch::channel(!options.persist);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let writer = options.persist.then(|| {
            spawn_writer(
                area.clone(),
                options.key.clone(),
                context,
                in_flight.clone(),
            )
        });

        let inner = Arc::new(StoreInner {
            key: options.key.clone(),
            context,
            snapshot: RwLock::new(Arc::new(initializer())),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            writer,
            in_flight,
            ready: ready_rx,
            sync_task: Mutex::new(None),
        });

        if options.persist {
            // Subscribe before the initial load so no change slips between them
            let changes = area.watch();
            let task = tokio::spawn(sync_from_storage(
                Arc::downgrade(&inner),
                area,
                options.key,
                context,
                changes,
                ready_tx,
            ));
            *inner.sync_task.lock() = Some(task);
        }

        Ok(Self { inner })
    }

    /// Resolves once the persisted value (if any) has been applied.
    pub async fn ready(&self) {
        let mut ready = self.inner.ready.clone();
        if ready.wait_for(|loaded| *loaded).await.is_err() {
            tracing::warn!("Store {} stopped before it finished loading", self.inner.key);
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Last known snapshot. Two calls without a write in between return the same `Arc`.
    pub fn get_state(&self) -> Arc<T> {
        self.inner.snapshot.read().clone()
    }

    /// Shallow-merge `partial` (a JSON object) over the current snapshot.
    pub fn set_state(&self, partial: impl Serialize) -> Result<Arc<T>, StoreError> {
        let key = &self.inner.key;
        let patch = match serde_json::to_value(partial) {
            Ok(Value::Object(patch)) => patch,
            Ok(_) => return Err(StoreError::NotAnObject { key: key.clone() }),
            Err(source) => {
                return Err(StoreError::Serde {
                    key: key.clone(),
                    source,
                });
            }
        };

        self.try_update(|current| {
            let mut merged = to_json(key, current)?;
            merge_shallow(&mut merged, patch);
            from_json(key, merged)
        })
    }

    pub fn update(&self, updater: impl FnOnce(&T) -> T) -> Result<Arc<T>, StoreError> {
        self.try_update(|current| Ok(updater(current)))
    }

    pub fn replace(&self, value: T) -> Result<Arc<T>, StoreError> {
        self.try_update(|_| Ok(value))
    }

    /// Compute the next snapshot from the current one; an `Err` leaves the
    /// snapshot untouched and writes nothing.
    pub fn try_update<E>(&self, next: impl FnOnce(&T) -> Result<T, E>) -> Result<Arc<T>, E>
    where
        E: From<StoreError>,
    {
        let state = {
            let mut snapshot = self.inner.snapshot.write();
            let mut next = next(&snapshot)?;
            next.restore_transient(&snapshot);

            let value = to_json(&self.inner.key, &next)?;
            let state = Arc::new(next);
            *snapshot = state.clone();

            // Queued under the snapshot lock so storage sees writes in snapshot order
            if let Some(writer) = &self.inner.writer {
                self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                if writer.send(WriterCommand::Save(value)).is_err() {
                    release(&self.inner.in_flight);
                    tracing::error!("Writer for store {} has stopped", self.inner.key);
                }
            }
            state
        };

        self.inner.notify(&state);
        Ok(state)
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let store = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Mutex::new(Some(Box::new(move || {
                if let Some(store) = store.upgrade() {
                    store.listeners.lock().retain(|(other, _)| *other != id);
                }
            }))),
        }
    }

    /// Wait until every write queued so far has reached storage.
    pub async fn flush(&self) {
        let Some(writer) = &self.inner.writer else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if writer.send(WriterCommand::Flush(reply)).is_ok() {
            let _ = done.await;
        }
    }
}

impl<T: StoreState> StoreInner<T> {
    fn notify(&self, state: &T) {
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(state);
        }
    }

    /// Merge a value written elsewhere over the snapshot. Returns whether
    /// anything changed.
    fn apply_external(&self, incoming: Value) -> Result<bool, StoreError> {
        let Value::Object(incoming) = incoming else {
            return Err(StoreError::NotAnObject {
                key: self.key.clone(),
            });
        };

        let state = {
            let mut snapshot = self.snapshot.write();
            let current = to_json(&self.key, &**snapshot)?;
            let mut merged = current.clone();
            merge_shallow(&mut merged, incoming);
            if merged == current {
                return Ok(false);
            }

            let mut next: T = from_json(&self.key, merged)?;
            next.restore_transient(&snapshot);
            let next = Arc::new(next);
            *snapshot = next.clone();
            next
        };

        self.notify(&state);
        Ok(true)
    }
}

impl<T> Drop for StoreInner<T> {
    fn drop(&mut self) {
        if let Some(task) = self.sync_task.get_mut().take() {
            task.abort();
        }
    }
}

fn spawn_writer(
    area: Arc<StorageArea>,
    key: String,
    context: ContextId,
    in_flight: Arc<AtomicUsize>,
) -> mpsc::UnboundedSender<WriterCommand> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCommand::Save(value) => {
                    // The snapshot stays as it is even if this fails
                    if let Err(e) = area.set(&key, value, context).await {
                        // No change will come back for this write
                        release(&in_flight);
                        tracing::error!("Failed to persist store {}: {:#}", key, e);
                    }
                }
                WriterCommand::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
    });

    tx
}

async fn sync_from_storage<T: StoreState>(
    store: Weak<StoreInner<T>>,
    area: Arc<StorageArea>,
    key: String,
    context: ContextId,
    mut changes: broadcast::Receiver<StorageChange>,
    ready: watch::Sender<bool>,
) {
    reload(&store, &area, &key).await;
    ready.send_replace(true);

    loop {
        match changes.recv().await {
            Ok(change) => {
                if change.key != key {
                    continue;
                }
                let Some(inner) = store.upgrade() else {
                    break;
                };
                if change.origin == context {
                    // Only our newest write settles the snapshot to what storage holds
                    if release(&inner.in_flight) > 0 {
                        continue;
                    }
                } else if inner.in_flight.load(Ordering::SeqCst) > 0 {
                    // A write of ours lands after this one and replaces it
                    continue;
                }
                match inner.apply_external(change.new_value) {
                    Ok(true) => tracing::debug!("Store {} updated by {}", key, change.origin),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Ignoring change to {}: {}", key, e),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} storage changes, reloading {}", skipped, key);
                // Skip the stale backlog, storage already holds the outcome
                changes = changes.resubscribe();
                if let Some(inner) = store.upgrade() {
                    inner.in_flight.store(0, Ordering::SeqCst);
                }
                reload(&store, &area, &key).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn reload<T: StoreState>(store: &Weak<StoreInner<T>>, area: &StorageArea, key: &str) {
    match area.get(key).await {
        Ok(Some(value)) => {
            if let Some(inner) = store.upgrade()
                && let Err(e) = inner.apply_external(value)
            {
                tracing::warn!("Stored value for {} is unusable, keeping defaults: {}", key, e);
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("Failed to load {}, keeping defaults: {:#}", key, e),
    }
}

/// Count one own write as settled. Returns how many are still outstanding.
fn release(in_flight: &AtomicUsize) -> usize {
    let previous = in_flight
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
        .unwrap_or_else(|n| n);
    previous.saturating_sub(1)
}

fn merge_shallow(target: &mut Value, patch: Map<String, Value>) {
    match target {
        Value::Object(fields) => fields.extend(patch),
        other => *other = Value::Object(patch),
    }
}

fn to_json<T: Serialize>(key: &str, state: &T) -> Result<Value, StoreError> {
    serde_json::to_value(state).map_err(|source| StoreError::Serde {
        key: key.to_string(),
        source,
    })
}

fn from_json<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Serde {
        key: key.to_string(),
        source,
    })
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StorageBackend};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Prefs {
        volume: u32,
        label: String,
        #[serde(skip)]
        session_tag: Option<String>,
    }

    impl StoreState for Prefs {
        fn restore_transient(&mut self, previous: &Self) {
            if self.session_tag.is_none() {
                self.session_tag = previous.session_tag.clone();
            }
        }
    }

    fn defaults() -> Prefs {
        Prefs {
            volume: 5,
            label: "default".to_string(),
            session_tag: Some("initializer".to_string()),
        }
    }

    #[tokio::test]
    async fn test_get_state_is_stable_between_writes() {
        let area = StorageArea::in_memory();
        let store = Store::new(area, ContextId::new(1), StoreOptions::persisted("prefs"), defaults)
            .unwrap();
        store.ready().await;

        let a = store.get_state();
        let b = store.get_state();
        assert!(Arc::ptr_eq(&a, &b));

        store.set_state(json!({"volume": 6})).unwrap();
        assert!(!Arc::ptr_eq(&a, &store.get_state()));
    }

    #[tokio::test]
    async fn test_set_state_merges_shallowly() {
        let area = StorageArea::in_memory();
        let store = Store::new(area, ContextId::new(1), StoreOptions::persisted("prefs"), defaults)
            .unwrap();
        store.ready().await;

        store.set_state(json!({"volume": 9})).unwrap();
        let state = store.get_state();
        assert_eq!(state.volume, 9);
        assert_eq!(state.label, "default");
        assert_eq!(state.session_tag.as_deref(), Some("initializer"));

        store.set_state(json!({"label": "loud"})).unwrap();
        let state = store.get_state();
        assert_eq!(state.volume, 9);
        assert_eq!(state.label, "loud");
    }

    #[tokio::test]
    async fn test_set_state_rejects_non_objects_and_bad_fields() {
        let area = StorageArea::in_memory();
        let store = Store::new(area, ContextId::new(1), StoreOptions::in_memory("prefs"), defaults)
            .unwrap();

        assert!(matches!(
            store.set_state(json!(3)),
            Err(StoreError::NotAnObject { .. })
        ));
        assert!(matches!(
            store.set_state(json!({"volume": "loud"})),
            Err(StoreError::Serde { .. })
        ));
        assert_eq!(store.get_state().volume, 5);
    }

    #[tokio::test]
    async fn test_persisted_value_wins_over_defaults() {
        let area = StorageArea::in_memory();
        area.set("prefs", json!({"volume": 2}), ContextId::new(9))
            .await
            .unwrap();

        let store = Store::new(area, ContextId::new(1), StoreOptions::persisted("prefs"), defaults)
            .unwrap();
        store.ready().await;

        let state = store.get_state();
        assert_eq!(state.volume, 2);
        assert_eq!(state.label, "default");
        assert_eq!(state.session_tag.as_deref(), Some("initializer"));
    }

    #[tokio::test]
    async fn test_writes_reach_other_contexts_but_not_the_writer() {
        let area = StorageArea::in_memory();
        let writer = Store::new(
            area.clone(),
            ContextId::new(1),
            StoreOptions::persisted("prefs"),
            defaults,
        )
        .unwrap();
        let reader = Store::new(
            area.clone(),
            ContextId::new(2),
            StoreOptions::persisted("prefs"),
            defaults,
        )
        .unwrap();
        writer.ready().await;
        reader.ready().await;

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        reader.subscribe(move |prefs: &Prefs| {
            let _ = seen_tx.send(prefs.volume);
        });

        let writer_calls = Arc::new(AtomicUsize::new(0));
        let calls = writer_calls.clone();
        writer.subscribe(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        writer.set_state(json!({"volume": 11})).unwrap();
        assert_eq!(writer.get_state().volume, 11);

        assert_eq!(seen_rx.recv().await, Some(11));
        assert_eq!(reader.get_state().volume, 11);

        writer.flush().await;
        tokio::task::yield_now().await;
        // One synchronous local notification, no echo from storage
        assert_eq!(writer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_racing_writers_settle_on_the_stored_value() {
        let area = StorageArea::in_memory();
        let first = Store::new(
            area.clone(),
            ContextId::new(1),
            StoreOptions::persisted("prefs"),
            defaults,
        )
        .unwrap();
        let second = Store::new(
            area.clone(),
            ContextId::new(2),
            StoreOptions::persisted("prefs"),
            defaults,
        )
        .unwrap();
        first.ready().await;
        second.ready().await;

        first.set_state(json!({"volume": 1})).unwrap();
        second.set_state(json!({"volume": 2})).unwrap();
        first.flush().await;
        second.flush().await;

        let stored = area.get("prefs").await.unwrap().unwrap();
        let stored = stored["volume"].as_u64().unwrap() as u32;

        tokio::time::timeout(Duration::from_secs(1), async {
            while first.get_state().volume != stored || second.get_state().volume != stored {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Nothing left in the pipe can move them apart again
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.get_state().volume, stored);
        assert_eq!(second.get_state().volume, stored);
    }

    #[tokio::test]
    async fn test_lagging_store_reloads_from_storage() {
        let area = StorageArea::in_memory();
        let store = Store::new(
            area.clone(),
            ContextId::new(1),
            StoreOptions::persisted("prefs"),
            defaults,
        )
        .unwrap();
        store.ready().await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // More changes than the channel holds, without giving the store a chance to run
        tokio::task::unconstrained(async {
            for volume in 0..300 {
                area.set("prefs", json!({"volume": volume}), ContextId::new(9))
                    .await
                    .unwrap();
            }
        })
        .await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while store.get_state().volume != 299 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get_state().volume, 299);
        assert_eq!(store.get_state().label, "default");
        // One reload, not a replay of the backlog
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_identical_external_value_is_not_reapplied() {
        let area = StorageArea::in_memory();
        let store = Store::new(
            area.clone(),
            ContextId::new(1),
            StoreOptions::persisted("prefs"),
            defaults,
        )
        .unwrap();
        store.ready().await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let before = store.get_state();
        let same = json!({"volume": 5, "label": "default"});
        assert!(!store.inner.apply_external(same).unwrap());
        assert!(Arc::ptr_eq(&before, &store.get_state()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let area = StorageArea::in_memory();
        let store = Store::new(area, ContextId::new(1), StoreOptions::in_memory("prefs"), defaults)
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_state(json!({"volume": 1})).unwrap();
        subscription.unsubscribe();
        subscription.unsubscribe();
        store.set_state(json!({"volume": 2})).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("recordingState"));
        assert!(is_valid_key("recording-time_2"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("../escape"));
    }

    struct FailingBackend;

    #[async_trait]
    impl StorageBackend for FailingBackend {
        async fn load(&self, _key: &str) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }

        async fn save(&self, _key: &str, _value: &Value) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    #[tokio::test]
    async fn test_write_failure_keeps_snapshot() {
        let area = StorageArea::new(Arc::new(FailingBackend));
        let store = Store::new(area, ContextId::new(1), StoreOptions::persisted("prefs"), defaults)
            .unwrap();
        store.ready().await;

        store.set_state(json!({"volume": 42})).unwrap();
        store.flush().await;

        assert_eq!(store.get_state().volume, 42);
    }

    #[tokio::test]
    async fn test_flush_waits_for_persistence() {
        let backend = Arc::new(MemoryBackend::new());
        let area = StorageArea::new(backend.clone());
        let store = Store::new(area, ContextId::new(1), StoreOptions::persisted("prefs"), defaults)
            .unwrap();
        store.ready().await;

        store.set_state(json!({"label": "saved"})).unwrap();
        store.flush().await;

        assert_eq!(
            backend.load("prefs").await.unwrap(),
            Some(json!({"volume": 5, "label": "saved"}))
        );
    }
}
