use crate::bus::{Event, MessageBus, Router};
use crate::storage::StorageArea;
use crate::store::{Store, StoreError, StoreOptions, StoreState};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Long-lived background process
    Background,
    /// Popup, recorder page, editor
    ExtensionPage,
    /// Script injected into a web page
    ContentScript,
}

pub type TabId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
}

/// Origin of a message, as seen by the receiving context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSender {
    pub context: ContextId,
    pub kind: ContextKind,
    pub tab: Option<TabInfo>,
}

/// One isolated participant. Owns a message bus, the loop draining its inbox
/// and at most one store per storage key.
pub struct Context {
    sender: MessageSender,
    router: Arc<Router>,
    bus: MessageBus,
    stores: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    event_loop: JoinHandle<()>,
}

impl Context {
    /// Attach a new context to the router and start its event loop.
    pub fn spawn(router: &Arc<Router>, kind: ContextKind, tab: Option<TabInfo>) -> Self {
        let (sender, inbox) = router.attach(kind, tab);
        let bus = MessageBus::new(sender.clone(), router.clone());
        let event_loop = tokio::spawn(run_event_loop(bus.clone(), inbox));

        tracing::info!(context = %sender.context, ?kind, "Context started");

        Self {
            sender,
            router: router.clone(),
            bus,
            stores: Mutex::new(HashMap::new()),
            event_loop,
        }
    }

    pub fn id(&self) -> ContextId {
        self.sender.context
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn storage(&self) -> &Arc<StorageArea> {
        self.router.storage()
    }

    /// The store for `options.key` in this context, created on first use.
    ///
    /// Later calls for the same key return the same store and ignore the
    /// initializer.
    pub fn store<T: StoreState>(
        &self,
        options: StoreOptions,
        initializer: impl FnOnce() -> T,
    ) -> Result<Store<T>, StoreError> {
        let mut stores = self.stores.lock();

        if let Some(existing) = stores.get(&options.key) {
            return existing
                .downcast_ref::<Store<T>>()
                .cloned()
                .ok_or(StoreError::TypeMismatch { key: options.key });
        }

        let key = options.key.clone();
        let store = Store::new(self.storage().clone(), self.id(), options, initializer)?;
        stores.insert(key, Box::new(store.clone()));
        Ok(store)
    }

    /// Dispose every handler, detach from the router and stop the event loop.
    pub fn teardown(self) {
        self.router.detach(self.id());
        self.bus.dispose();
        self.event_loop.abort();
        self.stores.lock().clear();

        tracing::info!(context = %self.sender.context, "Context torn down");
    }
}

async fn run_event_loop(bus: MessageBus, mut inbox: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = inbox.recv().await {
        bus.dispatch(event);
    }
    tracing::debug!(context = %bus.context().context, "Event loop finished");
}
