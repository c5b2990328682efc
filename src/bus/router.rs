use super::responder::Responder;
use super::{Envelope, Event, Target};
use crate::context::{ContextId, ContextKind, MessageSender, TabId, TabInfo};
use crate::messages::Message;
use crate::storage::StorageArea;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabChange {
    pub status: Option<TabStatus>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabUpdate {
    pub tab_id: TabId,
    pub change: TabChange,
    pub tab: TabInfo,
}

/// One end of a long-lived channel between two contexts.
#[derive(Clone)]
pub struct Port {
    name: String,
    peer: ContextId,
    tx: mpsc::UnboundedSender<Value>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>,
}

impl Port {
    fn pair(name: &str, a: ContextId, b: ContextId) -> (Port, Port) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_end = Port {
            name: name.to_string(),
            peer: b,
            tx: a_tx,
            rx: Arc::new(tokio::sync::Mutex::new(a_rx)),
        };
        let b_end = Port {
            name: name.to_string(),
            peer: a,
            tx: b_tx,
            rx: Arc::new(tokio::sync::Mutex::new(b_rx)),
        };
        (a_end, b_end)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> ContextId {
        self.peer
    }

    /// Returns false once the other end is gone.
    pub fn post(&self, message: Value) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Next message from the other end, `None` after it disconnected.
    pub async fn recv(&self) -> Option<Value> {
        self.rx.lock().await.recv().await
    }
}

struct Attached {
    sender: MessageSender,
    inbox: mpsc::UnboundedSender<Event>,
}

/// Delivers events between attached contexts, standing in for the browser runtime.
pub struct Router {
    storage: Arc<StorageArea>,
    response_timeout: Duration,
    next_id: AtomicU64,
    contexts: Mutex<Vec<Attached>>,
}

impl Router {
    pub fn new(storage: Arc<StorageArea>, response_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            storage,
            response_timeout,
            next_id: AtomicU64::new(1),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn storage(&self) -> &Arc<StorageArea> {
        &self.storage
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn attach(
        &self,
        kind: ContextKind,
        tab: Option<TabInfo>,
    ) -> (MessageSender, mpsc::UnboundedReceiver<Event>) {
        let context = ContextId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (inbox, rx) = mpsc::unbounded_channel();
        let sender = MessageSender { context, kind, tab };

        self.contexts.lock().push(Attached {
            sender: sender.clone(),
            inbox,
        });
        (sender, rx)
    }

    pub fn detach(&self, context: ContextId) {
        self.contexts.lock().retain(|c| c.sender.context != context);
    }

    pub fn contexts(&self) -> Vec<MessageSender> {
        self.contexts.lock().iter().map(|c| c.sender.clone()).collect()
    }

    /// The content script running in `tab_id`, if one is attached.
    pub fn find_tab(&self, tab_id: TabId) -> Option<ContextId> {
        self.contexts
            .lock()
            .iter()
            .find(|c| {
                c.sender.kind == ContextKind::ContentScript
                    && c.sender.tab.as_ref().is_some_and(|tab| tab.id == tab_id)
            })
            .map(|c| c.sender.context)
    }

    /// Queue `message` for every context matching `target`, never the sender
    /// itself. Returns how many contexts it reached.
    pub fn deliver(
        &self,
        from: &MessageSender,
        message: Message,
        target: Target,
        responder: &Responder,
    ) -> usize {
        let inboxes = self.inboxes(from.context, target);
        responder.expect(inboxes.len());

        let mut reached = 0;
        for inbox in inboxes {
            let envelope = Envelope {
                message: message.clone(),
                sender: from.clone(),
                responder: responder.clone(),
            };
            if inbox.send(Event::Message(envelope)).is_ok() {
                reached += 1;
            } else {
                responder.abandon();
            }
        }

        tracing::debug!(
            "{:?} from {} reached {} context(s)",
            message.kind,
            from.context,
            reached
        );
        reached
    }

    /// Open a port to `target`; `None` when that context is not attached.
    pub fn open_port(&self, from: ContextId, name: &str, target: ContextId) -> Option<Port> {
        if from == target {
            return None;
        }
        let inbox = self.inboxes(from, Target::Context(target)).pop()?;
        let (local, remote) = Port::pair(name, from, target);
        inbox.send(Event::Connect(remote)).ok()?;

        tracing::debug!("Port {:?} opened from {} to {}", name, from, target);
        Some(local)
    }

    /// Fan a tab change out to every attached context.
    pub fn tab_updated(&self, update: TabUpdate) -> usize {
        let contexts = self.contexts.lock();
        contexts
            .iter()
            .filter(|c| c.inbox.send(Event::TabUpdated(update.clone())).is_ok())
            .count()
    }

    fn inboxes(&self, from: ContextId, target: Target) -> Vec<mpsc::UnboundedSender<Event>> {
        self.contexts
            .lock()
            .iter()
            .filter(|c| c.sender.context != from)
            .filter(|c| match target {
                Target::Broadcast => true,
                Target::Context(id) => c.sender.context == id,
            })
            .map(|c| c.inbox.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageType;

    fn router() -> Arc<Router> {
        Router::new(StorageArea::in_memory(), Duration::from_millis(200))
    }

    #[test]
    fn test_ids_are_unique_and_detach_forgets() {
        let router = router();
        let (a, _a_rx) = router.attach(ContextKind::Background, None);
        let (b, _b_rx) = router.attach(ContextKind::ExtensionPage, None);
        assert_ne!(a.context, b.context);

        router.detach(a.context);
        let left: Vec<_> = router.contexts().into_iter().map(|c| c.context).collect();
        assert_eq!(left, vec![b.context]);
    }

    #[test]
    fn test_find_tab_only_matches_content_scripts() {
        let router = router();
        let tab = TabInfo {
            id: 7,
            url: "https://example.com".to_string(),
        };
        let (_page, _page_rx) = router.attach(ContextKind::ExtensionPage, Some(tab.clone()));
        assert_eq!(router.find_tab(7), None);

        let (content, _content_rx) = router.attach(ContextKind::ContentScript, Some(tab));
        assert_eq!(router.find_tab(7), Some(content.context));
        assert_eq!(router.find_tab(8), None);
    }

    #[test]
    fn test_deliver_skips_sender_and_closed_inboxes() {
        let router = router();
        let (from, mut from_rx) = router.attach(ContextKind::ExtensionPage, None);
        let (_open, mut open_rx) = router.attach(ContextKind::Background, None);
        let (_closed, closed_rx) = router.attach(ContextKind::ContentScript, None);
        drop(closed_rx);

        let (responder, _reply) = Responder::channel();
        let reached = router.deliver(
            &from,
            Message::new(MessageType::GetStatus),
            Target::Broadcast,
            &responder,
        );

        assert_eq!(reached, 1);
        assert!(open_rx.try_recv().is_ok());
        assert!(from_rx.try_recv().is_err());
    }

    #[test]
    fn test_open_port_requires_attached_peer() {
        let router = router();
        let (a, _a_rx) = router.attach(ContextKind::ExtensionPage, None);
        assert!(router.open_port(a.context, "recorder", ContextId::new(99)).is_none());
        assert!(router.open_port(a.context, "recorder", a.context).is_none());
    }
}
