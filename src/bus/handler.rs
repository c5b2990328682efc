use super::responder::Responder;
use super::router::{Port, TabStatus, TabUpdate};
use crate::context::MessageSender;
use crate::messages::{Message, MessageType};
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    RuntimeMessage,
    TabMessage,
    Connect,
    TabUpdate,
}

/// What a handler is registered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchKey {
    Message(MessageType),
    Port(String),
    Tab(TabStatus),
}

/// Returned by request handlers. `KeepChannelOpen` promises a later
/// `Responder::send_response` from a clone of the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    KeepChannelOpen,
}

pub trait RuntimeMessageHandler: Send + Sync {
    fn handle_runtime_message(
        &self,
        message: &Message,
        sender: &MessageSender,
        responder: &Responder,
    ) -> Result<HandlerOutcome>;
}

impl<F> RuntimeMessageHandler for F
where
    F: Fn(&Message, &MessageSender, &Responder) -> Result<HandlerOutcome> + Send + Sync,
{
    fn handle_runtime_message(
        &self,
        message: &Message,
        sender: &MessageSender,
        responder: &Responder,
    ) -> Result<HandlerOutcome> {
        self(message, sender, responder)
    }
}

/// Same shape as a runtime handler, but only invoked for messages sent from
/// a content script running in a tab.
pub trait TabMessageHandler: Send + Sync {
    fn handle_tab_message(
        &self,
        message: &Message,
        sender: &MessageSender,
        responder: &Responder,
    ) -> Result<HandlerOutcome>;
}

impl<F> TabMessageHandler for F
where
    F: Fn(&Message, &MessageSender, &Responder) -> Result<HandlerOutcome> + Send + Sync,
{
    fn handle_tab_message(
        &self,
        message: &Message,
        sender: &MessageSender,
        responder: &Responder,
    ) -> Result<HandlerOutcome> {
        self(message, sender, responder)
    }
}

pub trait ConnectHandler: Send + Sync {
    fn handle_connect(&self, port: &Port) -> Result<()>;
}

impl<F> ConnectHandler for F
where
    F: Fn(&Port) -> Result<()> + Send + Sync,
{
    fn handle_connect(&self, port: &Port) -> Result<()> {
        self(port)
    }
}

pub trait TabUpdateHandler: Send + Sync {
    fn handle_tab_update(&self, update: &TabUpdate) -> Result<()>;
}

impl<F> TabUpdateHandler for F
where
    F: Fn(&TabUpdate) -> Result<()> + Send + Sync,
{
    fn handle_tab_update(&self, update: &TabUpdate) -> Result<()> {
        self(update)
    }
}

/// A handler together with the kind and key it listens on.
#[derive(Clone)]
pub enum HandlerRegistration {
    RuntimeMessage {
        message: MessageType,
        handler: Arc<dyn RuntimeMessageHandler>,
    },
    TabMessage {
        message: MessageType,
        handler: Arc<dyn TabMessageHandler>,
    },
    Connect {
        port: String,
        handler: Arc<dyn ConnectHandler>,
    },
    TabUpdate {
        status: TabStatus,
        handler: Arc<dyn TabUpdateHandler>,
    },
}

impl HandlerRegistration {
    pub fn runtime_message(message: MessageType, handler: impl RuntimeMessageHandler + 'static) -> Self {
        Self::RuntimeMessage {
            message,
            handler: Arc::new(handler),
        }
    }

    pub fn tab_message(message: MessageType, handler: impl TabMessageHandler + 'static) -> Self {
        Self::TabMessage {
            message,
            handler: Arc::new(handler),
        }
    }

    pub fn connect(port: impl Into<String>, handler: impl ConnectHandler + 'static) -> Self {
        Self::Connect {
            port: port.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn tab_update(status: TabStatus, handler: impl TabUpdateHandler + 'static) -> Self {
        Self::TabUpdate {
            status,
            handler: Arc::new(handler),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::RuntimeMessage { .. } => HandlerKind::RuntimeMessage,
            Self::TabMessage { .. } => HandlerKind::TabMessage,
            Self::Connect { .. } => HandlerKind::Connect,
            Self::TabUpdate { .. } => HandlerKind::TabUpdate,
        }
    }

    pub fn match_key(&self) -> MatchKey {
        match self {
            Self::RuntimeMessage { message, .. } | Self::TabMessage { message, .. } => {
                MatchKey::Message(*message)
            }
            Self::Connect { port, .. } => MatchKey::Port(port.clone()),
            Self::TabUpdate { status, .. } => MatchKey::Tab(*status),
        }
    }
}

/// Identifies one registration for later removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerToken {
    pub kind: HandlerKind,
    pub key: MatchKey,
    pub(crate) id: u64,
}
