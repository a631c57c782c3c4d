//! Topic-keyed publish/subscribe abstraction (mechanics only).
//!
//! A bus fans each published message out to every live subscription of the
//! message's topic. For job notifications the topic is the job id.
//!
//! - **Non-blocking publish**: a slow or absent subscriber never stalls the
//!   publisher; messages are buffered per subscription.
//! - **Per-topic order**: messages published for one topic from one thread are
//!   received in publish order.
//! - **Explicit close**: closing a topic drops its senders, so subscriptions
//!   drain what is buffered and then report `Disconnected`.
//! - **No persistence**: the bus is for distribution; the job registry is the
//!   source of truth for late readers.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// A subscription to one topic of an event bus.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe(job_id);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => process(event),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Topic closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Topic-keyed event bus.
///
/// The trait requires `Send + Sync`; publishers on many threads may share one
/// bus.
pub trait EventBus<K, M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Deliver `message` to every live subscription of `topic`.
    ///
    /// Returns the number of subscriptions that accepted the message. Zero is
    /// not an error: nobody was listening.
    fn publish(&self, topic: &K, message: M) -> Result<usize, Self::Error>;

    fn subscribe(&self, topic: K) -> Subscription<M>;

    /// Drop every subscription sender for `topic`.
    fn close(&self, topic: &K);

    /// Number of live subscriptions for `topic`.
    fn subscriber_count(&self, topic: &K) -> usize;
}

impl<K, M, B> EventBus<K, M> for Arc<B>
where
    B: EventBus<K, M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, topic: &K, message: M) -> Result<usize, Self::Error> {
        (**self).publish(topic, message)
    }

    fn subscribe(&self, topic: K) -> Subscription<M> {
        (**self).subscribe(topic)
    }

    fn close(&self, topic: &K) {
        (**self).close(topic)
    }

    fn subscriber_count(&self, topic: &K) -> usize {
        (**self).subscriber_count(topic)
    }
}
