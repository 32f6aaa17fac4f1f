//! Abstract interface for publishing envelopes to named topics.
//!
//! Delivery is at-least-once to every subscriber attached when a message is
//! published. Consumers must tolerate duplicates. Messages published before
//! a subscription exists are never delivered to it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod topic;

pub use error::Error;
pub use topic::Topic;

use std::fmt::Debug;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use vigil_envelope::Envelope;

/// A publish/subscribe bus keyed by topic.
#[async_trait]
pub trait EventBus
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The subscription type returned by [`EventBus::subscribe`].
    type Subscription: Subscription;

    /// Hands `envelope` to the bus for `topic`.
    ///
    /// Succeeds whether or not anyone is subscribed. Failures are returned
    /// immediately and not retried.
    async fn publish(&self, topic: &Topic, envelope: Envelope) -> Result<(), Error>;

    /// Starts receiving envelopes published to `topic` from now on.
    async fn subscribe(&self, topic: &Topic) -> Result<Self::Subscription, Error>;
}

/// An unbounded sequence of envelopes from one topic.
///
/// The stream ends once the subscription is cancelled and everything already
/// buffered has been yielded. Cancelling through [`Subscription::cancel_handle`]
/// wakes a consumer parked on the stream.
pub trait Subscription
where
    Self: Stream<Item = Envelope> + Debug + Send + Unpin + 'static,
{
    /// The topic this subscription receives from.
    fn topic(&self) -> &Topic;

    /// A token that cancels this subscription from any task.
    fn cancel_handle(&self) -> CancellationToken;

    /// Stops delivery of new envelopes. Buffered envelopes are still yielded.
    fn cancel(&mut self) {
        self.cancel_handle().cancel();
    }
}
