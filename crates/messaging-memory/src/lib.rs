//! In-process event bus.
//!
//! Each bus is an ordinary value: two buses never see each other's
//! messages, so independent backends can share one process.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;
use vigil_envelope::Envelope;
use vigil_messaging::{Error, EventBus, Subscription, Topic};

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sender.is_closed()
    }
}

type Topics = DashMap<Topic, Vec<Subscriber>>;

/// An event bus that lives in this process.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Topics>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("topics", &self.topics.len())
            .finish()
    }
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |subscribers| {
            subscribers
                .iter()
                .filter(|subscriber| subscriber.is_live())
                .count()
        })
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    type Subscription = MemorySubscription;

    async fn publish(&self, topic: &Topic, envelope: Envelope) -> Result<(), Error> {
        let mut subscribers = self.topics.entry(topic.clone()).or_default();

        subscribers.retain(|subscriber| {
            subscriber.is_live() && subscriber.sender.send(envelope.clone()).is_ok()
        });

        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<MemorySubscription, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.topics
            .entry(topic.clone())
            .or_default()
            .push(Subscriber {
                id,
                sender,
                cancel: cancel.clone(),
            });

        debug!("subscription {} attached to {}", id, topic);

        Ok(MemorySubscription {
            id,
            topic: topic.clone(),
            receiver,
            cancelled: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            closed: false,
            topics: Arc::clone(&self.topics),
        })
    }
}

/// A subscription to one topic of a [`MemoryBus`].
pub struct MemorySubscription {
    id: u64,
    topic: Topic,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    closed: bool,
    topics: Arc<Topics>,
}

impl std::fmt::Debug for MemorySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl MemorySubscription {
    fn detach(&self) {
        if let Some(mut subscribers) = self.topics.get_mut(&self.topic) {
            subscribers.retain(|subscriber| subscriber.id != self.id);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            debug!("subscription {} on {} cancelled", self.id, self.topic);
            self.closed = true;
            self.receiver.close();
            self.detach();
        }
    }
}

impl Subscription for MemorySubscription {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
        self.close();
    }
}

impl Stream for MemorySubscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        let this = &mut *self;

        if !this.closed && this.cancelled.as_mut().poll(cx).is_ready() {
            this.close();
        }

        this.receiver.poll_recv(cx)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.detach();
    }
}
