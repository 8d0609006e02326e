//! In-process topic router.
//!
//! Topics fan out to every subscriber over bounded channels, preserving
//! per-publisher FIFO order. In wait-for-ack mode `publish` resolves only
//! after every subscriber has acknowledged the delivery, which gives tests
//! a deterministic way to drive a message to quiescence.

use std::collections::HashMap;
use std::sync::Arc;

use minder_core::events::Message;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, warn};

/// Errors raised by the router.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouterError {
    /// The router was closed; no further publishes are accepted.
    #[error("router is closed")]
    Closed,

    /// Every subscriber of the topic dropped its receiver.
    #[error("no live subscribers for topic {topic:?}")]
    NoSubscribers {
        /// The orphaned topic.
        topic: String,
    },
}

/// One message handed to a subscriber.
///
/// Call [`Delivery::ack`] once handling finishes; in wait-for-ack mode the
/// publisher blocks until every delivery of the message is acknowledged.
/// Dropping an unacknowledged delivery acknowledges it implicitly.
#[derive(Debug)]
pub struct Delivery {
    /// The routed message.
    pub message: Message,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// Signals the publisher that handling is complete.
    pub fn ack(mut self) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Default)]
struct Topics {
    subscribers: HashMap<String, Vec<mpsc::Sender<Delivery>>>,
    closed: bool,
}

/// Bounded fan-out router keyed by topic name.
#[derive(Debug)]
pub struct TopicRouter {
    topics: RwLock<Topics>,
    queue_depth: usize,
    wait_for_ack: bool,
}

impl TopicRouter {
    /// Creates a router whose per-subscriber queues hold `queue_depth`
    /// messages. With `wait_for_ack`, publishes resolve only after every
    /// subscriber acknowledges.
    #[must_use]
    pub fn new(queue_depth: usize, wait_for_ack: bool) -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(Topics::default()),
            queue_depth: queue_depth.max(1),
            wait_for_ack,
        })
    }

    /// Registers a new subscriber on `topic` and returns its receiver.
    ///
    /// Subscribing to a closed router yields a receiver that ends
    /// immediately.
    pub async fn subscribe(&self, topic: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut topics = self.topics.write().await;
        if !topics.closed {
            topics
                .subscribers
                .entry(topic.to_owned())
                .or_default()
                .push(tx);
        }
        rx
    }

    /// Publishes `message` to every subscriber of `topic`.
    ///
    /// Messages on topics nobody subscribed to are dropped with a warning;
    /// that is not an error. [`RouterError::NoSubscribers`] is returned
    /// only when a topic had subscribers and all of them went away.
    pub async fn publish(&self, topic: &str, message: Message) -> Result<(), RouterError> {
        let senders = {
            let topics = self.topics.read().await;
            if topics.closed {
                return Err(RouterError::Closed);
            }
            match topics.subscribers.get(topic) {
                Some(senders) => senders.clone(),
                None => {
                    warn!(topic, uuid = %message.uuid, "dropping message on unsubscribed topic");
                    return Ok(());
                }
            }
        };

        let mut acks = Vec::new();
        let mut delivered = 0usize;
        for sender in &senders {
            let ack = if self.wait_for_ack {
                let (ack_tx, ack_rx) = oneshot::channel();
                acks.push(ack_rx);
                Some(ack_tx)
            } else {
                None
            };
            let delivery = Delivery {
                message: message.clone(),
                ack,
            };
            if sender.send(delivery).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(RouterError::NoSubscribers {
                topic: topic.to_owned(),
            });
        }
        debug!(topic, uuid = %message.uuid, subscribers = delivered, "published");

        for ack in acks {
            // A dropped delivery counts as acknowledged.
            let _ = ack.await;
        }
        Ok(())
    }

    /// Closes the router: pending queue contents still drain to their
    /// subscribers, after which every receiver ends.
    pub async fn close(&self) {
        let mut topics = self.topics.write().await;
        topics.closed = true;
        topics.subscribers.clear();
    }
}
