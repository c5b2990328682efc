//! Typed messaging between contexts.
//!
//! Each context owns one [`MessageBus`]. Handlers register against a
//! `(kind, key)` pair; the first registration for a pair installs its
//! listener, and every handler on a matching listener runs, in registration
//! order, for each event.

mod handler;
mod responder;
mod router;

pub use handler::{
    ConnectHandler, HandlerKind, HandlerOutcome, HandlerRegistration, HandlerToken, MatchKey,
    RuntimeMessageHandler, TabMessageHandler, TabUpdateHandler,
};
pub use responder::Responder;
pub use router::{Port, Router, TabChange, TabStatus, TabUpdate};

use crate::context::{ContextId, ContextKind, MessageSender, TabId};
use crate::messages::{Message, MessageType, Response};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Where a message goes. Neither variant ever delivers back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Broadcast,
    Context(ContextId),
}

pub struct Envelope {
    pub message: Message,
    pub sender: MessageSender,
    pub responder: Responder,
}

/// Everything that can arrive in a context's inbox.
pub enum Event {
    Message(Envelope),
    Connect(Port),
    TabUpdated(TabUpdate),
}

struct Listener {
    kind: HandlerKind,
    key: MatchKey,
    handlers: Vec<(u64, HandlerRegistration)>,
}

struct BusInner {
    sender: MessageSender,
    router: Arc<Router>,
    listeners: Mutex<Vec<Listener>>,
    next_handler: AtomicU64,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(sender: MessageSender, router: Arc<Router>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sender,
                router,
                listeners: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The identity this bus sends as.
    pub fn context(&self) -> &MessageSender {
        &self.inner.sender
    }

    pub fn register_handler(&self, registration: HandlerRegistration) -> HandlerToken {
        let kind = registration.kind();
        let key = registration.match_key();
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);

        let mut listeners = self.inner.listeners.lock();
        match listeners.iter_mut().find(|l| l.kind == kind && l.key == key) {
            Some(listener) => listener.handlers.push((id, registration)),
            None => {
                tracing::debug!(
                    "{} installed {:?} listener for {:?}",
                    self.inner.sender.context,
                    kind,
                    key
                );
                listeners.push(Listener {
                    kind,
                    key: key.clone(),
                    handlers: vec![(id, registration)],
                });
            }
        }

        HandlerToken { kind, key, id }
    }

    pub fn on_runtime_message<F>(&self, message: MessageType, handler: F) -> HandlerToken
    where
        F: Fn(&Message, &MessageSender, &Responder) -> Result<HandlerOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(HandlerRegistration::runtime_message(message, handler))
    }

    pub fn on_tab_message<F>(&self, message: MessageType, handler: F) -> HandlerToken
    where
        F: Fn(&Message, &MessageSender, &Responder) -> Result<HandlerOutcome>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(HandlerRegistration::tab_message(message, handler))
    }

    pub fn on_connect<F>(&self, port: &str, handler: F) -> HandlerToken
    where
        F: Fn(&Port) -> Result<()> + Send + Sync + 'static,
    {
        self.register_handler(HandlerRegistration::connect(port, handler))
    }

    pub fn on_tab_update<F>(&self, status: TabStatus, handler: F) -> HandlerToken
    where
        F: Fn(&TabUpdate) -> Result<()> + Send + Sync + 'static,
    {
        self.register_handler(HandlerRegistration::tab_update(status, handler))
    }

    /// Remove one registration. Safe to call again; returns whether anything was removed.
    pub fn unregister(&self, token: &HandlerToken) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let Some(index) = listeners
            .iter()
            .position(|l| l.kind == token.kind && l.key == token.key)
        else {
            return false;
        };

        let listener = &mut listeners[index];
        let before = listener.handlers.len();
        listener.handlers.retain(|(id, _)| *id != token.id);
        let removed = listener.handlers.len() != before;

        if listener.handlers.is_empty() {
            tracing::debug!(
                "{} removed {:?} listener for {:?}",
                self.inner.sender.context,
                token.kind,
                token.key
            );
            listeners.remove(index);
        }
        removed
    }

    /// Drop every handler. Events arriving afterwards are ignored.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.listeners.lock().clear();
    }

    /// Request/response. `None` means no context answered within the
    /// response timeout, which callers treat as a normal outcome.
    pub async fn send(&self, message: Message, target: Target) -> Option<Response> {
        let kind = message.kind;
        let (responder, reply) = Responder::channel();
        let reached = self
            .inner
            .router
            .deliver(&self.inner.sender, message, target, &responder);
        // Only the receivers may keep the slot alive
        drop(responder);

        if reached == 0 {
            tracing::debug!("No context received {:?}", kind);
            return None;
        }

        match tokio::time::timeout(self.inner.router.response_timeout(), reply).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => {
                tracing::debug!("{:?} was dropped without a response", kind);
                None
            }
            Err(_) => {
                tracing::warn!("Timed out waiting for a response to {:?}", kind);
                None
            }
        }
    }

    /// Request/response addressed to the content script in `tab_id`.
    pub async fn send_to_tab(&self, tab_id: TabId, message: Message) -> Option<Response> {
        let context = self.inner.router.find_tab(tab_id)?;
        self.send(message, Target::Context(context)).await
    }

    /// Fire-and-forget. Returns how many contexts it reached.
    pub fn post(&self, message: Message, target: Target) -> usize {
        let (responder, _reply) = Responder::channel();
        self.inner
            .router
            .deliver(&self.inner.sender, message, target, &responder)
    }

    pub fn connect(&self, name: &str, target: ContextId) -> Option<Port> {
        self.inner
            .router
            .open_port(self.inner.sender.context, name, target)
    }

    /// Run every matching handler for one inbox event.
    pub fn dispatch(&self, event: Event) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            if let Event::Message(envelope) = event {
                envelope.responder.finish_dispatch(false);
            }
            return;
        }

        match event {
            Event::Message(envelope) => self.dispatch_message(envelope),
            Event::Connect(port) => {
                let key = MatchKey::Port(port.name().to_string());
                for (id, registration) in self.matching(HandlerKind::Connect, &key) {
                    if let HandlerRegistration::Connect { handler, .. } = registration
                        && self.is_registered(HandlerKind::Connect, &key, id)
                        && let Err(e) = handler.handle_connect(&port)
                    {
                        tracing::warn!("Connect handler for {:?} failed: {:#}", port.name(), e);
                    }
                }
            }
            Event::TabUpdated(update) => {
                let Some(status) = update.change.status else {
                    return;
                };
                let key = MatchKey::Tab(status);
                for (id, registration) in self.matching(HandlerKind::TabUpdate, &key) {
                    if let HandlerRegistration::TabUpdate { handler, .. } = registration
                        && self.is_registered(HandlerKind::TabUpdate, &key, id)
                        && let Err(e) = handler.handle_tab_update(&update)
                    {
                        tracing::warn!("Tab update handler for tab {} failed: {:#}", update.tab_id, e);
                    }
                }
            }
        }
    }

    fn dispatch_message(&self, envelope: Envelope) {
        let Envelope {
            message,
            sender,
            responder,
        } = envelope;
        let key = MatchKey::Message(message.kind);

        let mut handlers = self.matching(HandlerKind::RuntimeMessage, &key);
        let from_tab = sender.kind == ContextKind::ContentScript && sender.tab.is_some();
        if from_tab {
            handlers.extend(self.matching(HandlerKind::TabMessage, &key));
        }

        let mut keep_open = false;
        for (id, registration) in handlers {
            if !self.is_registered(registration.kind(), &key, id) {
                continue;
            }

            let outcome = match &registration {
                HandlerRegistration::RuntimeMessage { handler, .. } => {
                    handler.handle_runtime_message(&message, &sender, &responder)
                }
                HandlerRegistration::TabMessage { handler, .. } => {
                    handler.handle_tab_message(&message, &sender, &responder)
                }
                _ => continue,
            };

            match outcome {
                Ok(HandlerOutcome::KeepChannelOpen) => keep_open = true,
                Ok(HandlerOutcome::Done) => {}
                Err(e) => {
                    tracing::warn!("Handler for {:?} failed: {:#}", message.kind, e);
                    responder.send_response(Response::failure(format!("{:#}", e)));
                }
            }
        }

        responder.finish_dispatch(keep_open);
    }

    fn matching(&self, kind: HandlerKind, key: &MatchKey) -> Vec<(u64, HandlerRegistration)> {
        self.inner
            .listeners
            .lock()
            .iter()
            .find(|l| l.kind == kind && &l.key == key)
            .map(|l| l.handlers.clone())
            .unwrap_or_default()
    }

    // A handler may unregister another one while the fan-out is running
    fn is_registered(&self, kind: HandlerKind, key: &MatchKey, id: u64) -> bool {
        self.inner
            .listeners
            .lock()
            .iter()
            .any(|l| l.kind == kind && &l.key == key && l.handlers.iter().any(|(h, _)| *h == id))
    }
}
