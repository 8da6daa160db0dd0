//! Per-connection dispatch of decoded frames.
//!
//! Every inbound [`Message`] goes to exactly one place: the pending request
//! registered under its transaction id, or otherwise the stream subscribers
//! of its response type. Anything else is an orphan and is discarded.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::link::proto::{Message, TransactionId};

/// Where a dispatched message ended up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// Resolved the pending request with the same transaction id.
    Resolved,
    /// Delivered to this many live stream subscribers.
    Streamed(usize),
    /// Claimed by nobody.
    Discarded,
}

/// Pending-request and subscription tables for one client instance.
#[derive(Debug, Default)]
pub struct MessageRouter {
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<Message>>>,
    subscriptions: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for the response carrying `transaction_id`.
    ///
    /// Returns `None` when a request with the same id is already pending; the
    /// existing registration is left untouched.
    pub fn register(&self, transaction_id: TransactionId) -> Option<oneshot::Receiver<Message>> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(&transaction_id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(transaction_id.clone(), tx);
        debug!(
            event = "request_registered",
            transaction_id = %transaction_id,
            pending = pending.len()
        );
        Some(rx)
    }

    /// Drops the pending entry for `transaction_id`, if still present.
    pub fn unregister(&self, transaction_id: &TransactionId) -> bool {
        lock(&self.pending).remove(transaction_id).is_some()
    }

    /// Drops every pending entry so their waiters observe a closed channel.
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!(event = "pending_requests_failed", count = drained.len());
        }
        drained.len()
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Adds a listener for messages tagged with `response_type`.
    pub fn subscribe(&self, response_type: impl Into<String>) -> Subscription {
        let response_type = response_type.into();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscriptions)
            .entry(response_type.clone())
            .or_default()
            .push(tx);
        Subscription { response_type, rx }
    }

    pub fn dispatch(&self, message: Message) -> Dispatch {
        if let Some(transaction_id) = message.transaction_id() {
            let waiter = lock(&self.pending).remove(transaction_id);
            if let Some(waiter) = waiter {
                let transaction_id = transaction_id.clone();
                if waiter.send(message).is_err() {
                    debug!(
                        event = "orphan_response_discarded",
                        transaction_id = %transaction_id,
                        reason = "waiter_gone"
                    );
                    return Dispatch::Discarded;
                }
                return Dispatch::Resolved;
            }
        }

        if let Some(response_type) = message.response_type() {
            let mut subscriptions = lock(&self.subscriptions);
            if let Some(listeners) = subscriptions.get_mut(response_type) {
                listeners.retain(|listener| listener.send(message.body.clone()).is_ok());
                let delivered = listeners.len();
                if delivered == 0 {
                    subscriptions.remove(response_type);
                } else {
                    return Dispatch::Streamed(delivered);
                }
            }
        }

        trace!(
            event = "orphan_response_discarded",
            transaction_id = ?message.transaction_id(),
            response_type = ?message.response_type()
        );
        Dispatch::Discarded
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receiving end of a stream subscription.
///
/// Yields message bodies in arrival order for as long as the client lives.
#[derive(Debug)]
pub struct Subscription {
    response_type: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    /// Receives the next raw body.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Receives the next body that decodes as `T`.
    ///
    /// Bodies that do not match the schema are logged and skipped.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let body = self.rx.recv().await?;
            match serde_json::from_value(body) {
                Ok(value) => return Some(value),
                Err(err) => warn!(
                    event = "telemetry_decode_failed",
                    response_type = %self.response_type,
                    error = %err
                ),
            }
        }
    }

    /// Converts into a typed subscription.
    pub fn typed<T: DeserializeOwned>(self) -> Telemetry<T> {
        Telemetry {
            inner: self,
            _marker: PhantomData,
        }
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

/// Subscription whose bodies decode into `T`.
#[derive(Debug)]
pub struct Telemetry<T> {
    inner: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Telemetry<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv_as().await
    }

    pub fn into_inner(self) -> Subscription {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Dispatch, MessageRouter};
    use crate::link::proto::{Headers, MagData, Message, TransactionId, MAG_DATA};

    fn message(id: Option<&str>, response_type: Option<&str>, body: serde_json::Value) -> Message {
        Message {
            headers: Headers {
                transaction_id: id.map(TransactionId::new),
                response_type: response_type.map(str::to_string),
            },
            body,
        }
    }

    #[tokio::test]
    async fn pending_request_claims_matching_message_before_subscribers() {
        let router = MessageRouter::new();
        let rx = router.register("t1".into()).expect("register");
        let mut mag = router.subscribe(MAG_DATA);

        let outcome = router.dispatch(message(
            Some("t1"),
            Some(MAG_DATA),
            json!({"heading": 10, "pitch": 0, "roll": 0}),
        ));
        assert_eq!(outcome, Dispatch::Resolved);
        assert_eq!(router.pending_requests(), 0);

        let response = rx.await.expect("response delivered");
        assert_eq!(response.body, json!({"heading": 10, "pitch": 0, "roll": 0}));
        assert!(mag.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn streaming_message_reaches_every_subscriber_in_order() {
        let router = MessageRouter::new();
        let mut first = router.subscribe(MAG_DATA);
        let mut second = router.subscribe(MAG_DATA).typed::<MagData>();

        for heading in [1, 2] {
            let outcome = router.dispatch(message(
                Some("unrelated"),
                Some(MAG_DATA),
                json!({"heading": heading, "pitch": 0, "roll": 0}),
            ));
            assert_eq!(outcome, Dispatch::Streamed(2));
        }

        assert_eq!(first.recv().await, Some(json!({"heading": 1, "pitch": 0, "roll": 0})));
        assert_eq!(first.recv().await, Some(json!({"heading": 2, "pitch": 0, "roll": 0})));
        assert_eq!(second.recv().await.map(|m| m.heading), Some(1.0));
        assert_eq!(second.recv().await.map(|m| m.heading), Some(2.0));
    }

    #[test]
    fn unclaimed_message_is_discarded() {
        let router = MessageRouter::new();
        let outcome = router.dispatch(message(Some("late"), None, json!(null)));
        assert_eq!(outcome, Dispatch::Discarded);
    }

    #[test]
    fn duplicate_registration_keeps_first_waiter() {
        let router = MessageRouter::new();
        let _first = router.register("dup".into()).expect("first registration");
        assert!(router.register("dup".into()).is_none());
        assert_eq!(router.pending_requests(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let router = MessageRouter::new();
        drop(router.subscribe(MAG_DATA));
        let outcome = router.dispatch(message(None, Some(MAG_DATA), json!({})));
        assert_eq!(outcome, Dispatch::Discarded);
    }

    #[tokio::test]
    async fn subscription_yields_bodies_as_a_stream() {
        use futures_util::StreamExt;

        let router = MessageRouter::new();
        let mut temps = router.subscribe("CPUTEMP");
        router.dispatch(message(None, Some("CPUTEMP"), json!({"temperature": 40.5})));
        assert_eq!(temps.next().await, Some(json!({"temperature": 40.5})));
    }

    #[tokio::test]
    async fn typed_telemetry_skips_bodies_that_do_not_decode() {
        let router = MessageRouter::new();
        let mut mag = router.subscribe(MAG_DATA).typed::<MagData>();
        router.dispatch(message(None, Some(MAG_DATA), json!({"heading": "north"})));
        router.dispatch(message(
            None,
            Some(MAG_DATA),
            json!({"heading": 3, "pitch": 4, "roll": 5}),
        ));
        assert_eq!(
            mag.recv().await,
            Some(MagData {
                heading: 3.0,
                pitch: 4.0,
                roll: 5.0
            })
        );
    }

    #[tokio::test]
    async fn fail_pending_closes_every_waiter() {
        let router = MessageRouter::new();
        let a = router.register("a".into()).expect("register a");
        let b = router.register("b".into()).expect("register b");
        assert_eq!(router.fail_pending(), 2);
        assert!(a.await.is_err());
        assert!(b.await.is_err());
    }
}
