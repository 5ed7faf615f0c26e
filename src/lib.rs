// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! An in-memory RabbitMQ broker for tests.
//!
//! Exchanges, queues and bindings live in a shared [`BrokerState`]; channels
//! opened on it expose lapin-shaped operations and deliver to consumers
//! synchronously, inside the publishing call.

mod binding;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod otel;
pub mod queue;
pub mod topology;

pub use binding::{Binding, BindingKey};
pub use broker::{BrokerState, DEFAULT_EXCHANGE};
pub use channel::{Channel, DeclaredQueue, PublishOutcome};
pub use config::RabbitMQConfigs;
pub use connection::{new_amqp_channel, Connection};
pub use consumer::{Consumer, DeliveryStream, QueueingConsumer};
pub use errors::{AmqpError, ShutdownReason};
pub use message::{Delivery, DeliveryTag, GetMessage, MessageEnvelope};
