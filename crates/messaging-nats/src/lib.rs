//! Event bus backed by a NATS server.
//!
//! Envelopes travel as their encoded bytes on subject `<prefix>.<topic>`.
//! Core NATS delivers at most once per connection; redelivery across
//! reconnects can duplicate, so consumers still treat delivery as
//! at-least-once.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::pin::Pin;
use std::task::{Context, Poll};

use async_nats::Client;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_envelope::Envelope;
use vigil_messaging::{Error, EventBus, Subscription, Topic};

/// Default subject prefix.
pub const DEFAULT_SUBJECT_PREFIX: &str = "vigil";

/// Options for [`NatsBus::new`].
#[derive(Clone, Debug)]
pub struct NatsBusOptions {
    /// The NATS client to use.
    pub client: Client,

    /// Prepended to every topic, separated by a dot.
    pub subject_prefix: String,
}

/// An event bus on a NATS connection.
#[derive(Clone, Debug)]
pub struct NatsBus {
    client: Client,
    subject_prefix: String,
}

impl NatsBus {
    /// Creates a bus over an existing connection.
    #[must_use]
    pub fn new(
        NatsBusOptions {
            client,
            subject_prefix,
        }: NatsBusOptions,
    ) -> Self {
        Self {
            client,
            subject_prefix,
        }
    }

    /// Connects to `url` and uses the default subject prefix.
    ///
    /// # Errors
    ///
    /// `Error::Connect` if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;

        Ok(Self::new(NatsBusOptions {
            client,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }))
    }

    /// The subject a topic maps to.
    #[must_use]
    pub fn subject(&self, topic: &Topic) -> String {
        if self.subject_prefix.is_empty() {
            topic.to_string()
        } else {
            format!("{}.{}", self.subject_prefix, topic)
        }
    }
}

#[async_trait]
impl EventBus for NatsBus {
    type Subscription = NatsSubscription;

    async fn publish(&self, topic: &Topic, envelope: Envelope) -> Result<(), Error> {
        self.client
            .publish(self.subject(topic), envelope.encode())
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &Topic) -> Result<NatsSubscription, Error> {
        let subject = self.subject(topic);

        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        // Make sure the server has registered interest before returning, so
        // publishes issued after this call are seen.
        self.client
            .flush()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    message = subscriber.next() => {
                        let Some(message) = message else { break };

                        match Envelope::decode(&message.payload) {
                            Ok(envelope) => {
                                if sender.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("skipping undecodable message on {}: {}", subject, e),
                        }
                    }
                }
            }

            if let Err(e) = subscriber.unsubscribe().await {
                debug!("unsubscribe from {} failed: {}", subject, e);
            }
        });

        debug!("subscribed to {}", topic);

        Ok(NatsSubscription {
            topic: topic.clone(),
            receiver,
            cancel,
        })
    }
}

/// A subscription to one topic of a [`NatsBus`].
#[derive(Debug)]
pub struct NatsSubscription {
    topic: Topic,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
}

impl Subscription for NatsSubscription {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // The forwarding task drops its sender once the token fires, which ends
    // the stream for a consumer parked on it.
    fn cancel(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }
}

impl Stream for NatsSubscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subject_naming() {
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect("nats://127.0.0.1:1")
            .await
            .unwrap();
        let topic = Topic::new("keepalives").unwrap();

        let bus = NatsBus::new(NatsBusOptions {
            client: client.clone(),
            subject_prefix: "backend".to_string(),
        });
        assert_eq!(bus.subject(&topic), "backend.keepalives");

        let bare = NatsBus::new(NatsBusOptions {
            client,
            subject_prefix: String::new(),
        });
        assert_eq!(bare.subject(&topic), "keepalives");
    }
}
