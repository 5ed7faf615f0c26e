// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installer
//!
//! Collects exchange, queue and binding definitions and declares them on a
//! [`Channel`] in dependency order. Queue features such as TTL, max length,
//! dead lettering and retry queues become `x-*` arguments; the broker stores
//! them verbatim and does not act on them.

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Argument naming the exchange that receives dead letters
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument naming the routing key used for dead letters
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Interface for topology management.
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition<'tp>) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding<'tp>) -> Self;

    /// Declares everything collected so far.
    ///
    /// Exchanges go first, then queues, then bindings, so a binding always
    /// finds both of its ends.
    fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installed through a [`Channel`].
pub struct AmqpTopology<'tp> {
    channel: &'tp Channel,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding<'tp>>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp Channel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition<'tp>) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition. A later definition with the same name
    /// replaces the earlier one.
    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
        self.queues_binding.push(binding);
        self
    }

    fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange()?;
        self.install_queue()?;
        self.binding_queues()
    }
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

fn long_int(value: i32) -> AMQPValue {
    AMQPValue::LongInt(LongInt::from(value))
}

fn queue_options(def: &QueueDefinition) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: def.passive,
        durable: def.durable,
        exclusive: def.exclusive,
        auto_delete: def.delete,
        nowait: false,
    }
}

impl AmqpTopology<'_> {
    fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            self.channel
                .exchange_declare(
                    exch.name,
                    exch.kind.into(),
                    ExchangeDeclareOptions {
                        passive: exch.passive,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: exch.internal,
                        nowait: false,
                    },
                    FieldTable::from(exch.params.clone()),
                )
                .inspect_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    )
                })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    /// Declares each queue, preceded by its retry queue and DLQ.
    fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            let mut queue_args = BTreeMap::new();

            if let Some(retry_name) = &def.retry_name {
                self.declare_retry(def, retry_name)?;
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                    long_string(""),
                );
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                    long_string(retry_name),
                );
            }

            if let Some(dlq_name) = &def.dlq_name {
                self.declare_queue(dlq_name, def, BTreeMap::new())?;
                if def.retry_name.is_none() {
                    queue_args.insert(
                        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                        long_string(""),
                    );
                    queue_args.insert(
                        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                        long_string(dlq_name),
                    );
                }
            }

            if let Some(ttl) = def.ttl {
                queue_args.insert(ShortString::from(AMQP_HEADERS_MESSAGE_TTL), long_int(ttl));
            }

            if let Some(max) = def.max_length {
                queue_args.insert(ShortString::from(AMQP_HEADERS_MAX_LENGTH), long_int(max));
            }

            if let Some(max_bytes) = def.max_length_bytes {
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                    long_int(max_bytes),
                );
            }

            self.declare_queue(&def.name, def, queue_args)?;
        }

        Ok(())
    }

    /// Declares the retry queue, which dead letters back into the main queue
    /// once its TTL expires.
    fn declare_retry(&self, def: &QueueDefinition, retry_name: &str) -> Result<(), AmqpError> {
        let mut args = BTreeMap::new();

        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            long_string(""),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            long_string(&def.name),
        );
        if let Some(ttl) = def.retry_ttl {
            args.insert(ShortString::from(AMQP_HEADERS_MESSAGE_TTL), long_int(ttl));
        }

        self.declare_queue(retry_name, def, args)
    }

    fn declare_queue(
        &self,
        name: &str,
        def: &QueueDefinition,
        args: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(name, queue_options(def), FieldTable::from(args))
            .inspect_err(|err| {
                error!(error = err.to_string(), queue = name, "failure to declare queue")
            })?;

        debug!("queue: {} was created", name);
        Ok(())
    }

    fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            self.channel
                .queue_bind(
                    binding.queue_name,
                    binding.exchange_name,
                    binding.routing_key,
                    QueueBindOptions { nowait: false },
                    binding.arguments.clone(),
                )
                .inspect_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange")
                })?;
        }

        Ok(())
    }
}
