//! In-process fan-out of committed updates to live subscribers.
//!
//! Each [`Registry`] is a handle to a single task that owns the subscriber
//! map. Subscribe, unsubscribe and notify requests are queued to that task and
//! handled one at a time, so a notification can never be written to a channel
//! that a concurrent unsubscribe is closing, and every subscriber sees values
//! in the order they were submitted.
//!
//! Delivery never waits on a subscriber: a subscriber whose buffer is full is
//! disconnected, one whose receiver is gone is pruned.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

const REQUEST_QUEUE: usize = 1024;

/// Identifies one subscription. Typed by the kind of value it receives, so an
/// inventory id cannot be used to unsubscribe from reservations.
pub struct SubscriptionId<T> {
    id: Uuid,
    _kind: PhantomData<fn() -> T>,
}

impl<T> SubscriptionId<T> {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            _kind: PhantomData,
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        self.id
    }
}

impl<T> Clone for SubscriptionId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SubscriptionId<T> {}

impl<T> PartialEq for SubscriptionId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for SubscriptionId<T> {}

impl<T> Hash for SubscriptionId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for SubscriptionId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubscriptionId").field(&self.id).finish()
    }
}

impl<T> fmt::Display for SubscriptionId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

enum Request<T> {
    Subscribe {
        id: SubscriptionId<T>,
        sender: mpsc::Sender<T>,
    },
    Unsubscribe {
        id: SubscriptionId<T>,
        done: oneshot::Sender<bool>,
    },
    Notify(T),
    Count(oneshot::Sender<usize>),
}

pub struct Registry<T> {
    kind: &'static str,
    requests: mpsc::Sender<Request<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            requests: self.requests.clone(),
        }
    }
}

impl<T> Registry<T>
where
    T: Clone + Send + 'static,
{
    /// Starts the owning task. Must be called from within a Tokio runtime.
    /// The task exits once every handle has been dropped.
    pub fn spawn(kind: &'static str) -> Self {
        let (requests, inbox) = mpsc::channel(REQUEST_QUEUE);
        tokio::spawn(run(kind, inbox));
        Self { kind, requests }
    }

    /// Registers `sender`; every later notification is delivered to it until
    /// [`Registry::unsubscribe`] is called or its receiver is dropped.
    pub async fn subscribe(&self, sender: mpsc::Sender<T>) -> SubscriptionId<T> {
        let id = SubscriptionId::new();
        if self.requests.send(Request::Subscribe { id, sender }).await.is_err() {
            warn!(kind = self.kind, %id, "subscriber registry has stopped");
        }
        id
    }

    /// Closes and removes the subscription. Returns `false` if the id was
    /// unknown, for example because the subscriber had already been dropped.
    pub async fn unsubscribe(&self, id: SubscriptionId<T>) -> bool {
        let (done, removed) = oneshot::channel();
        if self.requests.send(Request::Unsubscribe { id, done }).await.is_err() {
            return false;
        }
        removed.await.unwrap_or(false)
    }

    pub async fn notify(&self, value: T) {
        if self.requests.send(Request::Notify(value)).await.is_err() {
            warn!(kind = self.kind, "subscriber registry has stopped, dropping update");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self.requests.send(Request::Count(reply)).await.is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }
}

async fn run<T: Clone>(kind: &'static str, mut inbox: mpsc::Receiver<Request<T>>) {
    let mut subscribers: HashMap<SubscriptionId<T>, mpsc::Sender<T>> = HashMap::new();

    while let Some(request) = inbox.recv().await {
        match request {
            Request::Subscribe { id, sender } => {
                debug!(kind, %id, "subscribing");
                subscribers.insert(id, sender);
            }
            Request::Unsubscribe { id, done } => {
                debug!(kind, %id, "unsubscribing");
                // Dropping the sender closes the subscriber's channel.
                let removed = subscribers.remove(&id).is_some();
                let _ = done.send(removed);
            }
            Request::Notify(value) => {
                subscribers.retain(|id, sender| match sender.try_send(value.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(kind, %id, "subscriber is not keeping up, disconnecting");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(kind, %id, "subscriber went away");
                        false
                    }
                });
            }
            Request::Count(reply) => {
                let _ = reply.send(subscribers.len());
            }
        }
    }

    debug!(kind, "subscriber registry stopped");
}
