use crate::messages::Response;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Reply slot for one request, shared by every handler and context it reaches.
///
/// The first `send_response` wins. When the last reached context has
/// dispatched, nobody kept the channel open and nobody answered, the default
/// "no handler" failure is sent instead.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<Mutex<Slot>>,
}

struct Slot {
    reply: Option<oneshot::Sender<Response>>,
    pending: usize,
    dispatched: usize,
    kept_open: bool,
}

impl Responder {
    pub fn channel() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self {
            slot: Arc::new(Mutex::new(Slot {
                reply: Some(tx),
                pending: 0,
                dispatched: 0,
                kept_open: false,
            })),
        };
        (responder, rx)
    }

    /// Answer the request. Returns false if someone already did.
    pub fn send_response(&self, response: Response) -> bool {
        let Some(reply) = self.slot.lock().reply.take() else {
            tracing::debug!("Response already sent, discarding {:?}", response);
            return false;
        };
        // The caller may have timed out already
        let _ = reply.send(response);
        true
    }

    /// Register `contexts` more deliveries that will each report back.
    pub(crate) fn expect(&self, contexts: usize) {
        self.slot.lock().pending += contexts;
    }

    /// One context finished running its handlers.
    pub(crate) fn finish_dispatch(&self, keep_open: bool) {
        let mut slot = self.slot.lock();
        slot.pending = slot.pending.saturating_sub(1);
        slot.dispatched += 1;
        slot.kept_open |= keep_open;
        Self::settle(&mut slot);
    }

    /// A delivery never reached its context.
    pub(crate) fn abandon(&self) {
        let mut slot = self.slot.lock();
        slot.pending = slot.pending.saturating_sub(1);
        Self::settle(&mut slot);
    }

    fn settle(slot: &mut Slot) {
        if slot.pending > 0 || slot.dispatched == 0 || slot.kept_open {
            return;
        }
        if let Some(reply) = slot.reply.take() {
            let _ = reply.send(Response::no_handler());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_response_wins() {
        let (responder, mut rx) = Responder::channel();
        responder.expect(1);

        assert!(responder.send_response(Response::ok_with(serde_json::json!(1))));
        assert!(!responder.send_response(Response::ok_with(serde_json::json!(2))));
        responder.finish_dispatch(false);

        assert_eq!(rx.try_recv().unwrap(), Response::ok_with(serde_json::json!(1)));
    }

    #[test]
    fn test_default_waits_for_every_context() {
        let (responder, mut rx) = Responder::channel();
        responder.expect(2);

        responder.finish_dispatch(false);
        assert!(rx.try_recv().is_err());

        responder.finish_dispatch(false);
        assert_eq!(rx.try_recv().unwrap(), Response::no_handler());
    }

    #[test]
    fn test_keep_open_suppresses_default() {
        let (responder, mut rx) = Responder::channel();
        responder.expect(2);

        responder.finish_dispatch(true);
        responder.finish_dispatch(false);
        assert!(rx.try_recv().is_err());

        responder.send_response(Response::ok());
        assert_eq!(rx.try_recv().unwrap(), Response::ok());
    }

    #[test]
    fn test_abandoned_deliveries_send_nothing() {
        let (responder, mut rx) = Responder::channel();
        responder.expect(1);
        responder.abandon();

        assert!(rx.try_recv().is_err());
        drop(responder);
        assert!(rx.try_recv().is_err());
    }
}
