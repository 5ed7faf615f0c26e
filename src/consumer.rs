// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumers
//!
//! A [`Consumer`] is called synchronously from inside the publisher's call
//! whenever a message reaches the queue it consumes from. Callbacks may
//! re-enter the channel (to ack, or to publish) but a slow callback stalls the
//! publisher.
//!
//! [`QueueingConsumer`] buffers deliveries so async code can await them as a
//! stream, the way a lapin consumer is awaited.

use crate::message::Delivery;
use futures_util::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Receives the deliveries of one `basic_consume` registration.
#[cfg_attr(test, mockall::automock)]
pub trait Consumer: Send + Sync {
    fn handle_delivery(&self, delivery: Delivery);

    /// Called once when the consumer is cancelled.
    fn handle_cancel(&self, _consumer_tag: &str) {}
}

/// A consumer that forwards deliveries into an unbounded buffer.
#[derive(Debug, Clone)]
pub struct QueueingConsumer {
    sender: UnboundedSender<Delivery>,
}

/// The receiving half of a [`QueueingConsumer`].
///
/// The stream ends once every handle to the consumer is gone (cancelling it
/// releases the channel's handle) and the buffer has been read.
#[derive(Debug)]
pub struct DeliveryStream {
    receiver: UnboundedReceiver<Delivery>,
}

impl QueueingConsumer {
    pub fn new() -> (QueueingConsumer, DeliveryStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (QueueingConsumer { sender }, DeliveryStream { receiver })
    }
}

impl Consumer for QueueingConsumer {
    fn handle_delivery(&self, delivery: Delivery) {
        if self.sender.send(delivery).is_err() {
            debug!("delivery stream dropped, discarding message");
        }
    }

    fn handle_cancel(&self, consumer_tag: &str) {
        debug!(consumer_tag = consumer_tag, "queueing consumer cancelled");
    }
}

impl DeliveryStream {
    /// Waits up to `timeout` for the next delivery.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Returns a buffered delivery without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for DeliveryStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use lapin::BasicProperties;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            consumer_tag: "ctag".to_owned(),
            delivery_tag: tag,
            redelivered: false,
            exchange: "ex".to_owned(),
            routing_key: "k".to_owned(),
            properties: BasicProperties::default(),
            body: b"hello".to_vec(),
        }
    }

    #[tokio::test]
    async fn buffers_deliveries_in_order() {
        let (consumer, mut stream) = QueueingConsumer::new();
        consumer.handle_delivery(delivery(1));
        consumer.handle_delivery(delivery(2));

        assert_eq!(stream.next().await.map(|d| d.delivery_tag), Some(1));
        assert_eq!(stream.try_next().map(|d| d.delivery_tag), Some(2));
        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn next_timeout_gives_up() {
        let (_consumer, mut stream) = QueueingConsumer::new();
        assert!(stream
            .next_timeout(Duration::from_millis(10))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_consumer_is_dropped() {
        let (consumer, mut stream) = QueueingConsumer::new();
        consumer.handle_delivery(delivery(7));
        drop(consumer);

        assert_eq!(stream.next().await.map(|d| d.delivery_tag), Some(7));
        assert!(stream.next().await.is_none());
    }
}
