// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! A [`MessageEnvelope`] is created once per publish and copied once per
//! destination queue. Properties and body are carried through untouched; the
//! broker only reads the header table when routing through a headers exchange.

use lapin::{types::FieldTable, BasicProperties};

/// Per-channel identifier handed out with every delivery.
pub type DeliveryTag = u64;

/// One published message as stored in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub(crate) queue: String,
    pub(crate) redelivered: bool,
}

impl MessageEnvelope {
    pub fn new(
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: BasicProperties,
        body: &[u8],
    ) -> Self {
        MessageEnvelope {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
            properties,
            body: body.to_vec(),
            queue: String::new(),
            redelivered: false,
        }
    }

    /// Name of the queue this copy was enqueued into. Empty until routed.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub(crate) fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    /// The copy an exchange places into one destination queue.
    pub(crate) fn for_queue(&self, queue: &str) -> Self {
        MessageEnvelope {
            queue: queue.to_owned(),
            ..self.clone()
        }
    }

    /// The copy put back into the owning queue by nack or recover.
    pub(crate) fn for_redelivery(&self) -> Self {
        MessageEnvelope {
            redelivered: true,
            ..self.clone()
        }
    }
}

/// A message pushed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    pub(crate) fn new(consumer_tag: &str, delivery_tag: DeliveryTag, msg: &MessageEnvelope) -> Self {
        Delivery {
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag,
            redelivered: msg.redelivered,
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            properties: msg.properties.clone(),
            body: msg.body.clone(),
        }
    }
}

/// A message pulled with `basic_get`.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMessage {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_count: u32,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl GetMessage {
    pub(crate) fn new(delivery_tag: DeliveryTag, message_count: u32, msg: &MessageEnvelope) -> Self {
        GetMessage {
            delivery_tag,
            redelivered: msg.redelivered,
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            message_count,
            properties: msg.properties.clone(),
            body: msg.body.clone(),
        }
    }
}
