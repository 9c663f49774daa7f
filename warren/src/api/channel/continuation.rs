//! Pairing of a synchronous request with its reply.
//!
//! The registry holds at most one pending continuation. Callers serialize
//! themselves (see `Channel::call`), so registering while one is pending is
//! a usage error, never a silent overwrite.
//!
//! A continuation abandoned after its request went out leaves its expected
//! methods behind. The server answers requests in order, so the next reply
//! matching the oldest abandoned entry belongs to the abandoned request and
//! is dropped instead of resolving a newer call.

use std::{collections::VecDeque, sync::Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    api::{error::Error, Result},
    frame::{BasicProperties, Method, MethodId},
};

/// Content following a `basic.get-ok`.
#[derive(Debug, Clone)]
pub(crate) struct Content {
    pub properties: BasicProperties,
    pub body: bytes::Bytes,
}

#[derive(Debug)]
pub(crate) struct Reply {
    pub method: Method,
    pub content: Option<Content>,
}

impl Reply {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            content: None,
        }
    }
}

struct Continuation {
    expected: &'static [MethodId],
    responder: oneshot::Sender<Result<Reply>>,
}

#[derive(Default)]
struct Slot {
    pending: Option<Continuation>,
    /// replies still owed to abandoned requests, oldest first
    stale: VecDeque<&'static [MethodId]>,
    /// once set, every registration fails with this error
    closed: Option<Error>,
}

#[derive(Default)]
pub(crate) struct ContinuationRegistry {
    slot: Mutex<Slot>,
}

impl ContinuationRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        // a panic while holding the lock leaves the slot consistent
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(
        &self,
        expected: &'static [MethodId],
    ) -> Result<oneshot::Receiver<Result<Reply>>> {
        let mut slot = self.lock();
        if let Some(err) = &slot.closed {
            return Err(err.clone());
        }
        if slot.pending.is_some() {
            return Err(Error::ChannelUseError(
                "a synchronous request is already outstanding on this channel".to_owned(),
            ));
        }
        let (responder, rx) = oneshot::channel();
        slot.pending = Some(Continuation {
            expected,
            responder,
        });
        Ok(rx)
    }

    /// Hands `reply` to the pending continuation if it expects this method,
    /// otherwise gives the reply back.
    pub fn resolve(&self, reply: Reply) -> std::result::Result<(), Reply> {
        let mut slot = self.lock();
        let id = reply.method.id();
        while let Some(expected) = slot.stale.pop_front() {
            if expected.contains(&id) {
                debug!("drop late reply {} of an abandoned request", id);
                return Ok(());
            }
            // a later reply arrived first, the abandoned one never will
        }
        match slot.pending.take() {
            Some(continuation) if continuation.expected.contains(&id) => {
                // receiver dropped means the caller gave up, nothing to do
                continuation.responder.send(Ok(reply)).ok();
                Ok(())
            }
            other => {
                slot.pending = other;
                Err(reply)
            }
        }
    }

    /// Fails the pending continuation and refuses any later registration.
    pub fn close(&self, err: Error) {
        let mut slot = self.lock();
        if let Some(continuation) = slot.pending.take() {
            continuation.responder.send(Err(err.clone())).ok();
        }
        slot.closed.get_or_insert(err);
    }

    /// Discards the pending continuation, used when the caller stops waiting.
    ///
    /// If the request was `sent` its reply may still arrive and is dropped
    /// when it does.
    pub fn cancel(&self, sent: bool) {
        let mut slot = self.lock();
        if let Some(continuation) = slot.pending.take() {
            if sent && slot.closed.is_none() {
                slot.stale.push_back(continuation.expected);
            }
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{ContinuationRegistry, Reply};
    use crate::{
        api::error::Error,
        frame::{ChannelFlowOk, Method, QueueBindOk, QueueDeclareOk},
    };

    #[tokio::test]
    async fn test_only_expected_reply_resolves() {
        let registry = ContinuationRegistry::default();
        let rx = registry.register(&[QueueBindOk::ID]).unwrap();

        let stray = Reply::new(Method::from(ChannelFlowOk { active: true }));
        assert!(registry.resolve(stray).is_err());
        assert!(registry.is_pending());

        registry
            .resolve(Reply::new(Method::from(QueueBindOk::default())))
            .unwrap();
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(QueueBindOk::ID, reply.method.id());
        assert!(!registry.is_pending());
    }

    #[test]
    fn test_second_registration_is_refused() {
        let registry = ContinuationRegistry::default();
        let _rx = registry.register(&[QueueDeclareOk::ID]).unwrap();
        assert!(matches!(
            registry.register(&[QueueBindOk::ID]),
            Err(Error::ChannelUseError(_))
        ));
        registry.cancel(false);
        assert!(registry.register(&[QueueBindOk::ID]).is_ok());
    }

    #[tokio::test]
    async fn test_late_reply_of_abandoned_request_is_dropped() {
        let registry = ContinuationRegistry::default();
        let _rx = registry.register(&[QueueDeclareOk::ID]).unwrap();
        registry.cancel(true);

        let rx = registry.register(&[QueueDeclareOk::ID]).unwrap();
        let late = QueueDeclareOk {
            queue: "first".try_into().unwrap(),
            ..Default::default()
        };
        registry.resolve(Reply::new(Method::from(late))).unwrap();
        assert!(registry.is_pending());

        let own = QueueDeclareOk {
            queue: "second".try_into().unwrap(),
            ..Default::default()
        };
        registry.resolve(Reply::new(Method::from(own))).unwrap();
        match rx.await.unwrap().unwrap().method {
            Method::QueueDeclareOk(declare_ok) => assert_eq!("second", declare_ok.queue.as_ref().as_str()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abandoned_entry_is_skipped_by_a_newer_reply() {
        let registry = ContinuationRegistry::default();
        let _rx = registry.register(&[QueueDeclareOk::ID]).unwrap();
        registry.cancel(true);

        let rx = registry.register(&[QueueBindOk::ID]).unwrap();
        registry
            .resolve(Reply::new(Method::from(QueueBindOk::default())))
            .unwrap();
        assert_eq!(QueueBindOk::ID, rx.await.unwrap().unwrap().method.id());

        // the abandoned declare can no longer claim a later declare-ok
        let rx = registry.register(&[QueueDeclareOk::ID]).unwrap();
        registry
            .resolve(Reply::new(Method::from(QueueDeclareOk::default())))
            .unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn test_unsent_request_leaves_nothing_behind() {
        let registry = ContinuationRegistry::default();
        let _rx = registry.register(&[QueueDeclareOk::ID]).unwrap();
        registry.cancel(false);

        let stray = Reply::new(Method::from(QueueDeclareOk::default()));
        assert!(registry.resolve(stray).is_err());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_later_calls() {
        let registry = ContinuationRegistry::default();
        let rx = registry.register(&[QueueDeclareOk::ID]).unwrap();
        registry.close(Error::ChannelClosedError("404 NOT_FOUND".to_owned()));

        assert_eq!(
            Error::ChannelClosedError("404 NOT_FOUND".to_owned()),
            rx.await.unwrap().unwrap_err()
        );
        match registry.register(&[QueueDeclareOk::ID]) {
            Err(Error::ChannelClosedError(msg)) => assert_eq!("404 NOT_FOUND", msg),
            _ => panic!("closed registry must refuse registration"),
        }
    }
}
