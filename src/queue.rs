// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! This module provides the queue builder used by the topology installer and
//! the in-memory [`Queue`]: a FIFO of pending messages, the bindings that feed
//! it, and the listeners notified synchronously on every enqueue.

use crate::{
    binding::{Binding, BindingKey},
    message::MessageEnvelope,
};
use lapin::types::FieldTable;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Definition of a queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// Message TTL, max length, Dead Letter Queues (DLQ) and retry queues are
/// turned into `x-*` arguments on install; the broker stores them as given.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Marks the queue as durable.
    ///
    /// The flag is recorded on the queue; the in-memory broker keeps nothing across restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer is cancelled.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Marks the queue as exclusive to its connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive.
    ///
    /// Install then fails with `QueueNotFound` when the queue does not exist.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// Stored as the `x-message-ttl` argument.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// Stored as the `x-max-length` argument.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    ///
    /// Stored as the `x-max-length-bytes` argument.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum size in bytes
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) to the queue.
    ///
    /// The DLQ name is the queue name with a "-dlq" suffix.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry queue to the queue.
    ///
    /// The retry queue name is the queue name with a "-retry" suffix. Messages
    /// dead lettered into it return to the main queue once `ttl` expires.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds a message waits in the retry queue
    /// * `retries` - Maximum number of retry attempts
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }
}

/// Configuration for binding a queue to an exchange.
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
    pub(crate) arguments: FieldTable,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty; set them with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &'qeb str) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
            arguments: FieldTable::default(),
        }
    }

    /// Sets the exchange the queue is bound to.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key of the binding.
    ///
    /// # Parameters
    /// * `key` - Routing key or topic pattern
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }

    /// Sets the binding arguments.
    ///
    /// Headers exchanges match these against message headers.
    ///
    /// # Parameters
    /// * `arguments` - Binding argument table
    ///
    /// # Returns
    /// Self for method chaining
    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Callback invoked with every message enqueued after registration.
pub type EnqueueListener = Arc<dyn Fn(&Arc<MessageEnvelope>) + Send + Sync>;

/// Handle returned by [`Queue::subscribe`].
pub type ListenerId = u64;

/// A declared queue.
pub struct Queue {
    name: String,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    arguments: FieldTable,
    messages: Mutex<VecDeque<Arc<MessageEnvelope>>>,
    pub(crate) bindings: RwLock<BTreeMap<BindingKey, Binding>>,
    listeners: RwLock<Vec<(ListenerId, EnqueueListener)>>,
    next_listener: AtomicU64,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("exclusive", &self.exclusive)
            .field("auto_delete", &self.auto_delete)
            .field("messages", &self.len())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

impl Queue {
    pub fn new(
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        arguments: FieldTable,
    ) -> Self {
        Queue {
            name: name.to_owned(),
            durable,
            exclusive,
            auto_delete,
            arguments,
            messages: Mutex::new(VecDeque::new()),
            bindings: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn arguments(&self) -> &FieldTable {
        &self.arguments
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.bindings.read().values().cloned().collect()
    }

    /// Appends to the tail, then runs every listener before returning.
    ///
    /// Listeners run with no lock held so they may re-enter the broker.
    pub fn enqueue(&self, msg: Arc<MessageEnvelope>) {
        let listeners: Vec<EnqueueListener> = {
            let mut messages = self.messages.lock();
            messages.push_back(msg.clone());
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in listeners {
            listener(&msg);
        }
    }

    pub fn dequeue(&self) -> Option<Arc<MessageEnvelope>> {
        self.messages.lock().pop_front()
    }

    pub fn peek(&self) -> Option<Arc<MessageEnvelope>> {
        self.messages.lock().front().cloned()
    }

    /// Pops the head only when it is this exact message.
    pub fn remove_head_if(&self, msg: &Arc<MessageEnvelope>) -> bool {
        let mut messages = self.messages.lock();
        match messages.front() {
            Some(head) if Arc::ptr_eq(head, msg) => {
                messages.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Removes this exact message wherever it sits in the FIFO.
    pub fn remove(&self, msg: &Arc<MessageEnvelope>) -> bool {
        let mut messages = self.messages.lock();
        match messages.iter().position(|m| Arc::ptr_eq(m, msg)) {
            Some(index) => messages.remove(index).is_some(),
            None => false,
        }
    }

    /// Empties the FIFO without notifying listeners. Returns how many were dropped.
    pub fn purge(&self) -> u32 {
        let mut messages = self.messages.lock();
        let count = messages.len() as u32;
        messages.clear();
        count
    }

    pub fn len(&self) -> u32 {
        self.messages.lock().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn messages(&self) -> Vec<Arc<MessageEnvelope>> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn consumer_count(&self) -> u32 {
        self.listeners.read().len() as u32
    }

    /// Registers a listener and returns the messages pending at that instant.
    ///
    /// Both happen under the FIFO lock: every message is either in the
    /// returned snapshot or announced to the listener, never both.
    pub fn subscribe(&self, listener: EnqueueListener) -> (ListenerId, Vec<Arc<MessageEnvelope>>) {
        let messages = self.messages.lock();
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, listener));
        (id, messages.iter().cloned().collect())
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::BasicProperties;

    fn queue() -> Queue {
        Queue::new("q", false, false, false, FieldTable::default())
    }

    fn msg(body: &str) -> Arc<MessageEnvelope> {
        Arc::new(
            MessageEnvelope::new("ex", "k", false, BasicProperties::default(), body.as_bytes())
                .for_queue("q"),
        )
    }

    #[test]
    fn fifo_order() {
        let q = queue();
        q.enqueue(msg("1"));
        q.enqueue(msg("2"));

        assert_eq!(q.len(), 2);
        assert_eq!(q.peek().unwrap().body, b"1");
        assert_eq!(q.dequeue().unwrap().body, b"1");
        assert_eq!(q.dequeue().unwrap().body, b"2");
        assert!(q.dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn listeners_run_before_enqueue_returns() {
        let q = queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (id, pending) = q.subscribe(Arc::new(move |m: &Arc<MessageEnvelope>| {
            sink.lock().push(m.body.clone())
        }));
        assert!(pending.is_empty());

        q.enqueue(msg("a"));
        assert_eq!(*seen.lock(), vec![b"a".to_vec()]);

        assert!(q.unsubscribe(id));
        assert!(!q.unsubscribe(id));
        q.enqueue(msg("b"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn subscribe_returns_pending_snapshot() {
        let q = queue();
        q.enqueue(msg("a"));
        q.enqueue(msg("b"));

        let (_, pending) = q.subscribe(Arc::new(|_: &Arc<MessageEnvelope>| {}));
        let bodies: Vec<_> = pending.iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(q.consumer_count(), 1);
    }

    #[test]
    fn remove_head_if_checks_identity() {
        let q = queue();
        let first = msg("same");
        let second = msg("same");
        q.enqueue(first.clone());
        q.enqueue(second.clone());

        assert!(!q.remove_head_if(&second));
        assert!(q.remove_head_if(&first));
        assert!(q.remove_head_if(&second));
        assert!(q.is_empty());
    }

    #[test]
    fn purge_does_not_notify() {
        let q = queue();
        q.enqueue(msg("a"));
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        q.subscribe(Arc::new(move |_: &Arc<MessageEnvelope>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(q.purge(), 1);
        assert_eq!(q.purge(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn definition_builders() {
        let def = QueueDefinition::new("orders").durable().with_dlq().with_retry(1000, 3);
        assert!(def.durable);
        assert_eq!(def.dlq_name.as_deref(), Some("orders-dlq"));
        assert_eq!(def.retry_name.as_deref(), Some("orders-retry"));
        assert_eq!(def.retries, Some(3));
    }
}
