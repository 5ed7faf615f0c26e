// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channels
//!
//! A [`Channel`] is the caller-facing session on a [`BrokerState`]. Topology
//! operations pass straight through to the shared state. Everything about
//! deliveries is channel-local: the consumer registry, the delivery-tag
//! counter and the table of delivered but unacknowledged messages.
//!
//! Method names and option types follow lapin's `Channel`, so code written
//! against lapin reads the same against the fake.
//!
//! Acknowledgement model:
//! - `basic_get` without `no_ack` and push deliveries leave the message at
//!   its place in the queue; `basic_ack` removes it once it reaches the head.
//! - `basic_nack` without requeue empties every queue that owns one of this
//!   channel's in-flight messages, drops the target, then re-enqueues the rest.
//! - `basic_recover` drains the in-flight table, re-enqueueing on request.

use crate::{
    broker::{BrokerState, ExchangeFlags, QueueFlags},
    consumer::Consumer,
    errors::{AmqpError, ShutdownReason},
    exchange::ExchangeKind,
    message::{Delivery, DeliveryTag, GetMessage, MessageEnvelope},
    otel,
    queue::{EnqueueListener, ListenerId, Queue},
};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicRecoverOptions, BasicRejectOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use opentelemetry::{global, trace::Span};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Copies were enqueued into this many queues
    Routed(usize),
    /// Mandatory message that matched no binding
    Unroutable,
    /// Non-mandatory message that matched no binding
    Dropped,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

struct ConsumerEntry {
    queue: Arc<Queue>,
    listener: ListenerId,
    feed: Arc<ConsumerFeed>,
}

/// Messages waiting to be handed to one consumer.
///
/// Only one caller drains at a time. A message enqueued while the consumer's
/// callback runs is appended and picked up by the drain already in progress,
/// so deliveries keep enqueue order.
struct ConsumerFeed {
    consumer_tag: String,
    consumer: Arc<dyn Consumer>,
    no_ack: bool,
    backlog: Mutex<VecDeque<Arc<MessageEnvelope>>>,
    draining: AtomicBool,
}

impl ConsumerFeed {
    /// A feed that holds notifications back until [`ConsumerFeed::start`].
    fn new(consumer_tag: &str, consumer: Arc<dyn Consumer>, no_ack: bool) -> Self {
        ConsumerFeed {
            consumer_tag: consumer_tag.to_owned(),
            consumer,
            no_ack,
            backlog: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(true),
        }
    }

    /// Places the messages pending at subscription ahead of anything
    /// announced since, then delivers them all.
    fn start(&self, pending: Vec<Arc<MessageEnvelope>>, channel: &ChannelInner) {
        {
            let mut backlog = self.backlog.lock();
            for msg in pending.into_iter().rev() {
                backlog.push_front(msg);
            }
        }
        self.draining.store(false, Ordering::SeqCst);
        self.drain(channel);
    }

    fn push(&self, msg: &Arc<MessageEnvelope>, channel: &ChannelInner) {
        self.backlog.lock().push_back(msg.clone());
        self.drain(channel);
    }

    fn drain(&self, channel: &ChannelInner) {
        while self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            loop {
                let next = self.backlog.lock().pop_front();
                let Some(msg) = next else {
                    break;
                };
                channel.deliver(&self.consumer_tag, self.consumer.as_ref(), &msg, self.no_ack);
            }

            self.draining.store(false, Ordering::SeqCst);
            if self.backlog.lock().is_empty() {
                break;
            }
        }
    }
}

pub(crate) struct ChannelInner {
    id: u16,
    broker: Arc<BrokerState>,
    close_reason: Mutex<Option<ShutdownReason>>,
    last_delivery_tag: AtomicU64,
    publish_seq_no: AtomicU64,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    unacked: Mutex<BTreeMap<DeliveryTag, Arc<MessageEnvelope>>>,
}

/// A session on a broker. Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    pub fn new(id: u16, broker: Arc<BrokerState>) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                id,
                broker,
                close_reason: Mutex::new(None),
                last_delivery_tag: AtomicU64::new(0),
                publish_seq_no: AtomicU64::new(0),
                consumers: Mutex::new(HashMap::new()),
                unacked: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn broker(&self) -> &Arc<BrokerState> {
        &self.inner.broker
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn is_open(&self) -> bool {
        self.inner.close_reason.lock().is_none()
    }

    pub fn close_reason(&self) -> Option<ShutdownReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Closes the channel. Closing an already closed channel is an error.
    pub fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.inner
            .shutdown(ShutdownReason::new(reply_code, reply_text), false)
    }

    /// Closes the channel if it is still open. Never fails.
    pub fn abort(&self) {
        let _ = self.inner.shutdown(ShutdownReason::default(), true);
    }

    /// Publish sequence number the next `basic_publish` will use.
    pub fn next_publish_seq_no(&self) -> u64 {
        self.inner.publish_seq_no.load(Ordering::SeqCst)
    }

    /// Delivery tags handed out and not yet acknowledged, ascending.
    pub fn unacked_tags(&self) -> Vec<DeliveryTag> {
        self.inner.unacked.lock().keys().copied().collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.unacked.lock().len()
    }

    pub fn exchange_declare(
        &self,
        exchange: &str,
        kind: lapin::ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        if options.passive {
            return match self.inner.broker.exchange(exchange) {
                Some(_) => Ok(()),
                None => Err(AmqpError::ExchangeNotFound(exchange.to_owned())),
            };
        }

        let kind = ExchangeKind::try_from(kind)?;
        debug!("declaring exchange: {}", exchange);
        self.inner.broker.declare_exchange(
            exchange,
            kind,
            ExchangeFlags {
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: options.internal,
            },
            arguments,
        );

        Ok(())
    }

    pub fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;
        self.inner
            .broker
            .delete_exchange(exchange, options.if_unused);
        Ok(())
    }

    /// Declares a queue. An empty name asks for a generated one.
    pub fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<DeclaredQueue, AmqpError> {
        self.inner.ensure_open()?;

        let instance = if options.passive {
            self.inner
                .broker
                .queue(queue)
                .ok_or_else(|| AmqpError::QueueNotFound(queue.to_owned()))?
        } else {
            let name = if queue.is_empty() {
                format!("amq.gen-{}", Uuid::new_v4())
            } else {
                queue.to_owned()
            };

            debug!("declaring queue: {}", name);
            self.inner.broker.declare_queue(
                &name,
                QueueFlags {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                },
                arguments,
            )
        };

        Ok(DeclaredQueue {
            name: instance.name().to_owned(),
            message_count: instance.len(),
            consumer_count: instance.consumer_count(),
        })
    }

    /// Deletes a queue. Returns 1 when it was removed, 0 otherwise.
    pub fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32, AmqpError> {
        self.inner.ensure_open()?;
        Ok(self
            .inner
            .broker
            .delete_queue(queue, options.if_unused, options.if_empty))
    }

    /// Empties a queue. Returns how many messages were dropped.
    pub fn queue_purge(&self, queue: &str, _options: QueuePurgeOptions) -> Result<u32, AmqpError> {
        self.inner.ensure_open()?;
        Ok(self.inner.broker.purge_queue(queue))
    }

    pub fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;
        self.inner
            .broker
            .bind(exchange, queue, routing_key, arguments);
        Ok(())
    }

    pub fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;
        self.inner.broker.unbind(exchange, queue, routing_key);
        Ok(())
    }

    pub fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.inner.ensure_open()?;
        Ok(self.inner.broker.queue(queue).map_or(0, |q| q.len()))
    }

    pub fn consumer_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.inner.ensure_open()?;
        Ok(self
            .inner
            .broker
            .queue(queue)
            .map_or(0, |q| q.consumer_count()))
    }

    /// Routes a message through `exchange`, creating the exchange as a
    /// direct exchange when it was never declared.
    ///
    /// Consumers of the destination queues are called before this returns.
    pub fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError> {
        self.inner.ensure_open()?;

        let msg = MessageEnvelope::new(
            exchange,
            routing_key,
            options.mandatory,
            properties,
            payload,
        );

        let routed = self.inner.broker.publish(&msg);
        self.inner.publish_seq_no.fetch_add(1, Ordering::SeqCst);

        match routed {
            0 if msg.mandatory => {
                warn!(
                    exchange = exchange,
                    routing_key = routing_key,
                    "mandatory message is unroutable"
                );
                Ok(PublishOutcome::Unroutable)
            }
            0 => {
                debug!(exchange = exchange, routing_key = routing_key, "message dropped");
                Ok(PublishOutcome::Dropped)
            }
            n => Ok(PublishOutcome::Routed(n)),
        }
    }

    /// Starts pushing the messages of `queue` to `consumer`.
    ///
    /// Messages already pending are delivered before this returns, oldest
    /// first; later ones are delivered as they are enqueued. An empty tag asks
    /// for a generated one. Consuming from a missing queue registers nothing.
    pub fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        _arguments: FieldTable,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String, AmqpError> {
        self.inner.ensure_open()?;

        let consumer_tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };

        let Some(instance) = self.inner.broker.queue(queue) else {
            warn!(queue = queue, "consume on missing queue ignored");
            return Ok(consumer_tag);
        };

        if self.inner.consumers.lock().contains_key(&consumer_tag) {
            warn!(consumer_tag = consumer_tag, "consumer tag already in use");
            return Ok(consumer_tag);
        }

        let feed = Arc::new(ConsumerFeed::new(&consumer_tag, consumer, options.no_ack));
        let listener: EnqueueListener = {
            let channel = self.downgrade();
            let feed = feed.clone();
            Arc::new(move |msg: &Arc<MessageEnvelope>| {
                if let Some(channel) = channel.upgrade() {
                    feed.push(msg, &channel);
                }
            })
        };

        let (listener, pending) = instance.subscribe(listener);
        self.inner.consumers.lock().insert(
            consumer_tag.clone(),
            ConsumerEntry {
                queue: instance,
                listener,
                feed: feed.clone(),
            },
        );
        debug!(queue = queue, consumer_tag = consumer_tag, "consumer registered");

        feed.start(pending, &self.inner);

        Ok(consumer_tag)
    }

    /// Stops a consumer and notifies it. Deliveries already made stay in flight.
    pub fn basic_cancel(
        &self,
        consumer_tag: &str,
        _options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        let Some(entry) = self.inner.consumers.lock().remove(consumer_tag) else {
            debug!(consumer_tag = consumer_tag, "cancel of unknown consumer");
            return Ok(());
        };

        entry.queue.unsubscribe(entry.listener);
        if entry.queue.is_auto_delete() && entry.queue.consumer_count() == 0 {
            let current = self.inner.broker.queue(entry.queue.name());
            if current.is_some_and(|q| Arc::ptr_eq(&q, &entry.queue)) {
                self.inner
                    .broker
                    .delete_queue(entry.queue.name(), false, false);
            }
        }

        entry.feed.consumer.handle_cancel(consumer_tag);
        Ok(())
    }

    /// Pulls the head of `queue`.
    ///
    /// With `no_ack` the message is removed at once. Otherwise it stays at
    /// the head until acknowledged.
    pub fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<GetMessage>, AmqpError> {
        self.inner.ensure_open()?;

        let Some(instance) = self.inner.broker.queue(queue) else {
            return Ok(None);
        };

        let msg = if options.no_ack {
            instance.dequeue()
        } else {
            instance.peek()
        };
        let Some(msg) = msg else {
            return Ok(None);
        };

        let delivery_tag = self.inner.next_delivery_tag();
        if !options.no_ack {
            self.inner.unacked.lock().insert(delivery_tag, msg.clone());
        }

        Ok(Some(GetMessage::new(delivery_tag, instance.len(), &msg)))
    }

    /// Acknowledges one delivery, or with `multiple` every delivery up to it.
    pub fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicAckOptions,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        let acked = self.inner.take_unacked(delivery_tag, options.multiple);
        if acked.is_empty() {
            debug!(delivery_tag = delivery_tag, "ack of unknown delivery tag");
        }

        for msg in acked {
            if let Some(queue) = self.inner.broker.queue(msg.queue()) {
                queue.remove_head_if(&msg);
            }
        }

        Ok(())
    }

    pub fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicRejectOptions,
    ) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue: options.requeue,
            },
        )
    }

    /// Negatively acknowledges a delivery.
    ///
    /// With `requeue` this is a no-op: the message never left its queue.
    /// Without it, every queue owning one of this channel's in-flight
    /// messages is emptied, the target is dropped and the remaining in-flight
    /// messages go back to their queues to be delivered again.
    pub fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        if options.requeue {
            return Ok(());
        }

        let owning: BTreeSet<String> = self
            .inner
            .unacked
            .lock()
            .values()
            .map(|msg| msg.queue().to_owned())
            .collect();
        for queue in &owning {
            self.inner.broker.purge_queue(queue);
        }

        let dropped = self.inner.take_unacked(delivery_tag, options.multiple);
        if dropped.is_empty() {
            debug!(delivery_tag = delivery_tag, "nack of unknown delivery tag");
            return Ok(());
        }

        let remaining = std::mem::take(&mut *self.inner.unacked.lock());
        debug!(
            dropped = dropped.len(),
            requeued = remaining.len(),
            "nack without requeue"
        );
        self.inner.requeue(remaining.into_values());

        Ok(())
    }

    /// Forgets every in-flight delivery, putting them back on request.
    pub fn basic_recover(&self, options: BasicRecoverOptions) -> Result<(), AmqpError> {
        self.inner.ensure_open()?;

        let drained = std::mem::take(&mut *self.inner.unacked.lock());
        if options.requeue {
            self.inner.requeue(drained.into_values());
        }

        Ok(())
    }
}

impl ChannelInner {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        match self.close_reason.lock().as_ref() {
            Some(reason) => Err(AmqpError::already_closed(reason)),
            None => Ok(()),
        }
    }

    fn next_delivery_tag(&self) -> DeliveryTag {
        self.last_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn shutdown(&self, reason: ShutdownReason, abort: bool) -> Result<(), AmqpError> {
        {
            let mut close_reason = self.close_reason.lock();
            if let Some(existing) = close_reason.as_ref() {
                let err = AmqpError::already_closed(existing);
                if abort {
                    return Ok(());
                }
                error!(channel = self.id, error = err.to_string(), "channel already closed");
                return Err(err);
            }
            *close_reason = Some(reason);
        }

        let consumers: Vec<ConsumerEntry> = self
            .consumers
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in consumers {
            entry.queue.unsubscribe(entry.listener);
        }

        debug!(channel = self.id, "channel closed");
        Ok(())
    }

    fn deliver(
        &self,
        consumer_tag: &str,
        consumer: &dyn Consumer,
        msg: &Arc<MessageEnvelope>,
        no_ack: bool,
    ) {
        if self.close_reason.lock().is_some() {
            return;
        }

        let delivery_tag = self.next_delivery_tag();
        if no_ack {
            if let Some(queue) = self.broker.queue(msg.queue()) {
                queue.remove_head_if(msg);
            }
        } else {
            self.unacked.lock().insert(delivery_tag, msg.clone());
        }

        let (_, mut span) = otel::new_span(
            &msg.properties,
            &global::tracer(otel::TRACER_NAME),
            msg.queue(),
            msg.queue(),
        );
        debug!(
            consumer_tag = consumer_tag,
            delivery_tag = delivery_tag,
            queue = msg.queue(),
            "delivering message"
        );

        consumer.handle_delivery(Delivery::new(consumer_tag, delivery_tag, msg));
        span.end();
    }

    /// Removes `delivery_tag`, or with `multiple` every tag up to it.
    fn take_unacked(&self, delivery_tag: DeliveryTag, multiple: bool) -> Vec<Arc<MessageEnvelope>> {
        let mut unacked = self.unacked.lock();
        if !multiple {
            return unacked.remove(&delivery_tag).into_iter().collect();
        }

        let kept = match delivery_tag.checked_add(1) {
            Some(next) => unacked.split_off(&next),
            None => BTreeMap::new(),
        };
        std::mem::replace(&mut *unacked, kept)
            .into_values()
            .collect()
    }

    /// Moves each message to the tail of its queue as a redelivery.
    ///
    /// A message in flight under several tags goes back once, at the position
    /// of its lowest tag. The stale copy is taken out first so a queue never
    /// holds a message twice.
    fn requeue(&self, messages: impl Iterator<Item = Arc<MessageEnvelope>>) {
        let mut distinct: Vec<Arc<MessageEnvelope>> = Vec::new();
        for msg in messages {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, &msg)) {
                distinct.push(msg);
            }
        }

        for msg in distinct {
            match self.broker.queue(msg.queue()) {
                Some(queue) => {
                    queue.remove(&msg);
                    queue.enqueue(Arc::new(msg.for_redelivery()));
                }
                None => debug!(queue = msg.queue(), "owning queue gone, message dropped"),
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let _ = self.shutdown(ShutdownReason::default(), true);
    }
}
