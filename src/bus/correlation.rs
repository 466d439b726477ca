//! Message id correlation.
//!
//! Pending calls live in a ring of buckets. New calls go into the front
//! bucket; every tick pushes a fresh bucket to the front and expires the
//! oldest one, so an unanswered call times out after `queue_len` ticks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Result, RipleyError};
use crate::protocol::MessageId;
use crate::route::RouteKey;

/// Stored continuation of a call awaiting its reply.
///
/// Consumed by [`PendingCall::succeed`] or [`PendingCall::fail`], so it fires
/// at most once.
#[derive(Debug)]
pub struct PendingCall {
    reply: oneshot::Sender<Result<Bytes>>,
    route: RouteKey,
}

impl PendingCall {
    pub fn route(&self) -> RouteKey {
        self.route
    }

    /// Deliver the reply payload.
    pub fn succeed(self, payload: Bytes) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(Ok(payload));
    }

    pub fn fail(self, error: RipleyError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Future resolving to the payload of a REPLY (after the message id), or to
/// the error a MESSAGE_ERROR or timeout produced.
#[derive(Debug)]
pub struct PendingReply {
    id: MessageId,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl PendingReply {
    pub fn id(&self) -> MessageId {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RipleyError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) struct MessageQueues {
    buckets: VecDeque<HashMap<MessageId, PendingCall>>,
    next_id: u64,
}

impl MessageQueues {
    pub(crate) fn new(queue_len: usize) -> Self {
        let queue_len = queue_len.max(1);
        let mut buckets = VecDeque::with_capacity(queue_len);
        buckets.resize_with(queue_len, HashMap::new);
        Self {
            buckets,
            next_id: 0,
        }
    }

    /// Issue the next message id and register its continuation.
    pub(crate) fn insert(&mut self, route: RouteKey) -> (MessageId, PendingReply) {
        let id = MessageId::new(self.next_id);
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        if let Some(front) = self.buckets.front_mut() {
            front.insert(id, PendingCall { reply: tx, route });
        }
        (id, PendingReply { id, rx })
    }

    /// Remove the call `id` if it was sent on `route`.
    ///
    /// A mismatched route leaves the entry in place for the genuine reply.
    pub(crate) fn resolve(&mut self, id: MessageId, route: RouteKey) -> Result<PendingCall> {
        for bucket in self.buckets.iter_mut() {
            match bucket.get(&id).map(PendingCall::route) {
                Some(owner) if owner == route => {
                    return bucket.remove(&id).ok_or(RipleyError::UnknownMessageId(id));
                }
                Some(_) => return Err(RipleyError::UnknownMessageId(id)),
                None => {}
            }
        }
        Err(RipleyError::UnknownMessageId(id))
    }

    /// Advance one tick and return the calls that expired.
    pub(crate) fn rotate(&mut self) -> Vec<PendingCall> {
        self.buckets.push_front(HashMap::new());
        self.buckets
            .pop_back()
            .map(|expired| expired.into_values().collect())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(HashMap::len).sum()
    }
}
