//! Send a token and await the response carrying the same transaction id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::link::client::LinkError;
use crate::link::proto::{Message, TransactionId};
use crate::link::router::MessageRouter;
use crate::link::token::Token;

#[derive(Debug, Clone)]
pub struct RequestCorrelator {
    router: Arc<MessageRouter>,
    request_timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(router: Arc<MessageRouter>, request_timeout: Duration) -> Self {
        Self {
            router,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Registers the pending request for `token`.
    ///
    /// Must be called while the connection is known to be up so a concurrent
    /// close cannot slip between the state check and the registration.
    pub(crate) fn register(&self, token: &Token) -> Result<PendingRequest, LinkError> {
        let transaction_id = token.transaction_id().clone();
        let rx = self
            .router
            .register(transaction_id.clone())
            .ok_or_else(|| LinkError::DuplicateTransaction {
                transaction_id: transaction_id.clone(),
            })?;
        Ok(PendingRequest {
            router: Arc::clone(&self.router),
            transaction_id,
            rx: Some(rx),
            armed: true,
        })
    }

    /// Writes `bytes` once and waits for the correlated response.
    ///
    /// Settles exactly once: the response body, a timeout, or a closed
    /// connection. Whichever path loses finds its registration already gone.
    /// The sender is released as soon as the write is queued.
    pub(crate) async fn complete(
        &self,
        mut pending: PendingRequest,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        bytes: Vec<u8>,
    ) -> Result<Value, LinkError> {
        let transaction_id = pending.transaction_id.clone();

        let queued = outbound.send(bytes);
        drop(outbound);
        if queued.is_err() {
            return Err(LinkError::ConnectionClosed { transaction_id });
        }

        let Some(rx) = pending.rx.take() else {
            return Err(LinkError::ConnectionClosed { transaction_id });
        };

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => {
                pending.settled();
                debug!(event = "request_resolved", transaction_id = %transaction_id);
                Ok(message.body)
            }
            Ok(Err(_)) => {
                pending.settled();
                Err(LinkError::ConnectionClosed { transaction_id })
            }
            Err(_) => {
                drop(pending);
                warn!(
                    event = "request_timed_out",
                    transaction_id = %transaction_id,
                    timeout_ms = self.request_timeout.as_millis() as u64
                );
                Err(LinkError::Timeout { transaction_id })
            }
        }
    }
}

/// Registration guard for one in-flight request.
///
/// Dropping it before the response arrives removes the table entry, so a
/// timed-out or abandoned request leaves nothing behind and a late response is
/// treated as an orphan.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    router: Arc<MessageRouter>,
    transaction_id: TransactionId,
    rx: Option<oneshot::Receiver<Message>>,
    armed: bool,
}

impl PendingRequest {
    // The router already removed the entry when it delivered or drained it.
    fn settled(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.armed {
            self.router.unregister(&self.transaction_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::RequestCorrelator;
    use crate::link::client::LinkError;
    use crate::link::proto::{Headers, Message};
    use crate::link::router::{Dispatch, MessageRouter};
    use crate::link::token::Token;

    fn reply(token: &Token, body: serde_json::Value) -> Message {
        Message {
            headers: Headers {
                transaction_id: Some(token.transaction_id().clone()),
                response_type: None,
            },
            body,
        }
    }

    #[tokio::test]
    async fn response_resolves_request_and_clears_entry() {
        let router = Arc::new(MessageRouter::new());
        let correlator = RequestCorrelator::new(Arc::clone(&router), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let token = Token::new("ECHO", json!({"text": "ping"}));
        let pending = correlator.register(&token).expect("register");
        let bytes = token.to_bytes().expect("encode");

        let device = {
            let router = Arc::clone(&router);
            let token = token.clone();
            tokio::spawn(async move {
                let written = rx.recv().await.expect("one write");
                assert_eq!(written, token.to_bytes().expect("encode"));
                assert_eq!(
                    router.dispatch(reply(&token, json!({"text": "ping"}))),
                    Dispatch::Resolved
                );
                assert!(rx.try_recv().is_err());
            })
        };

        let body = correlator
            .complete(pending, tx, bytes)
            .await
            .expect("response");
        assert_eq!(body, json!({"text": "ping"}));
        assert_eq!(router.pending_requests(), 0);
        device.await.expect("device task");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_late_reply_is_orphaned() {
        let router = Arc::new(MessageRouter::new());
        let correlator = RequestCorrelator::new(Arc::clone(&router), Duration::from_millis(5000));
        let (tx, _rx) = mpsc::unbounded_channel();

        let token = Token::new("READMAG", json!(null));
        let pending = correlator.register(&token).expect("register");
        let err = correlator
            .complete(pending, tx, token.to_bytes().expect("encode"))
            .await
            .expect_err("no reply");

        match err {
            LinkError::Timeout { transaction_id } => {
                assert_eq!(&transaction_id, token.transaction_id())
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(router.pending_requests(), 0);
        assert_eq!(router.dispatch(reply(&token, json!(1))), Dispatch::Discarded);
    }

    #[tokio::test]
    async fn closed_outbound_queue_fails_without_waiting() {
        let router = Arc::new(MessageRouter::new());
        let correlator = RequestCorrelator::new(Arc::clone(&router), Duration::from_secs(60));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let token = Token::new("ECHO", json!(null));
        let pending = correlator.register(&token).expect("register");
        let err = correlator
            .complete(pending, tx, token.to_bytes().expect("encode"))
            .await
            .expect_err("queue closed");
        assert!(matches!(err, LinkError::ConnectionClosed { .. }));
        assert_eq!(router.pending_requests(), 0);
    }

    #[test]
    fn duplicate_transaction_id_is_rejected() {
        let router = Arc::new(MessageRouter::new());
        let correlator = RequestCorrelator::new(Arc::clone(&router), Duration::from_secs(5));
        let token = Token::with_transaction_id("same".into(), "ECHO", json!(null));

        let _first = correlator.register(&token).expect("first");
        let err = correlator.register(&token).expect_err("second");
        assert!(matches!(err, LinkError::DuplicateTransaction { .. }));
        assert_eq!(router.pending_requests(), 1);
    }

    #[tokio::test]
    async fn dropping_request_future_unregisters() {
        let router = Arc::new(MessageRouter::new());
        let correlator = RequestCorrelator::new(Arc::clone(&router), Duration::from_secs(60));
        let (tx, _rx) = mpsc::unbounded_channel();

        let token = Token::new("ECHO", json!(null));
        let pending = correlator.register(&token).expect("register");
        let bytes = token.to_bytes().expect("encode");
        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            correlator.complete(pending, tx, bytes),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(router.pending_requests(), 0);
    }
}
