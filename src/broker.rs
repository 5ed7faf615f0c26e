// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker State
//!
//! `BrokerState` is the registry every channel of one simulated broker shares.
//! It owns the exchanges and queues by name and keeps the two sides of each
//! binding in step. There is no process-wide instance: callers construct one
//! and hand an `Arc` of it to the channels they open.

use crate::{
    binding::{Binding, BindingKey},
    exchange::{Exchange, ExchangeKind},
    message::MessageEnvelope,
    queue::Queue,
};
use lapin::types::FieldTable;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

/// Name of the exchange every queue is implicitly bound to by its own name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Flags of an exchange declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

/// Flags of a queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug)]
pub struct BrokerState {
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    pub fn new() -> Self {
        let default_exchange = Exchange::new(
            DEFAULT_EXCHANGE,
            ExchangeKind::Direct,
            true,
            false,
            false,
            FieldTable::default(),
        );

        let mut exchanges = HashMap::new();
        exchanges.insert(DEFAULT_EXCHANGE.to_owned(), Arc::new(default_exchange));

        BrokerState {
            exchanges: RwLock::new(exchanges),
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.read().get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().get(name).cloned()
    }

    pub fn exchange_names(&self) -> Vec<String> {
        self.exchanges.read().keys().cloned().collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    /// Declares an exchange, or returns the existing one untouched.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        flags: ExchangeFlags,
        arguments: FieldTable,
    ) -> Arc<Exchange> {
        let mut exchanges = self.exchanges.write();
        if let Some(existing) = exchanges.get(name) {
            return existing.clone();
        }

        debug!(name = name, kind = kind.as_str(), "exchange declared");
        let exchange = Arc::new(Exchange::new(
            name,
            kind,
            flags.durable,
            flags.auto_delete,
            flags.internal,
            arguments,
        ));
        exchanges.insert(name.to_owned(), exchange.clone());
        exchange
    }

    /// Removes an exchange and its bindings. Returns whether it was removed.
    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> bool {
        if name == DEFAULT_EXCHANGE {
            warn!("the default exchange cannot be deleted");
            return false;
        }

        let exchange = {
            let mut exchanges = self.exchanges.write();
            let in_use = match exchanges.get(name) {
                Some(ex) => if_unused && !ex.bindings.read().is_empty(),
                None => return false,
            };
            if in_use {
                debug!(name = name, "exchange in use, not deleted");
                return false;
            }
            match exchanges.remove(name) {
                Some(ex) => ex,
                None => return false,
            }
        };

        let bindings: Vec<Binding> = std::mem::take(&mut *exchange.bindings.write())
            .into_values()
            .collect();
        for binding in bindings {
            if let Some(queue) = self.queue(binding.queue()) {
                queue.bindings.write().remove(&binding.key);
            }
        }

        debug!(name = name, "exchange deleted");
        true
    }

    /// Declares a queue, or returns the existing one untouched.
    ///
    /// A new queue is bound to the default exchange under its own name.
    pub fn declare_queue(&self, name: &str, flags: QueueFlags, arguments: FieldTable) -> Arc<Queue> {
        let queue = {
            let mut queues = self.queues.write();
            if let Some(existing) = queues.get(name) {
                return existing.clone();
            }

            let queue = Arc::new(Queue::new(
                name,
                flags.durable,
                flags.exclusive,
                flags.auto_delete,
                arguments,
            ));
            queues.insert(name.to_owned(), queue.clone());
            queue
        };

        debug!(name = name, durable = flags.durable, "queue declared");
        self.bind(DEFAULT_EXCHANGE, name, name, FieldTable::default());
        queue
    }

    /// Removes a queue and its bindings. Returns 1 when removed, 0 otherwise.
    ///
    /// Messages already handed to channels stay valid in their in-flight tables.
    pub fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool) -> u32 {
        let queue = {
            let mut queues = self.queues.write();
            let (in_use, has_messages) = match queues.get(name) {
                Some(q) => (q.consumer_count() > 0, !q.is_empty()),
                None => return 0,
            };
            if (if_unused && in_use) || (if_empty && has_messages) {
                debug!(name = name, in_use, has_messages, "queue not deleted");
                return 0;
            }
            match queues.remove(name) {
                Some(q) => q,
                None => return 0,
            }
        };

        let bindings: Vec<Binding> = std::mem::take(&mut *queue.bindings.write())
            .into_values()
            .collect();
        for binding in bindings {
            if let Some(exchange) = self.exchange(&binding.key.exchange) {
                exchange.bindings.write().remove(&binding.key);
            }
        }

        debug!(name = name, "queue deleted");
        1
    }

    /// Empties a queue. Returns the number of messages dropped, 0 when absent.
    pub fn purge_queue(&self, name: &str) -> u32 {
        match self.queue(name) {
            Some(queue) => queue.purge(),
            None => 0,
        }
    }

    /// Binds a queue to an exchange; skipped when either side is missing.
    ///
    /// Binding an existing key again only replaces its arguments.
    ///
    /// Both registries stay read-locked until the binding is stored, so a
    /// concurrent delete either sees the binding and scrubs it or happens
    /// first and the bind is skipped.
    pub fn bind(&self, exchange: &str, queue: &str, routing_key: &str, arguments: FieldTable) -> bool {
        let exchanges = self.exchanges.read();
        let queues = self.queues.read();
        let (Some(ex), Some(q)) = (exchanges.get(exchange), queues.get(queue)) else {
            debug!(
                exchange = exchange,
                queue = queue,
                "binding skipped, exchange or queue not found"
            );
            return false;
        };

        let binding = Binding::new(exchange, queue, routing_key, arguments);
        let mut ex_bindings = ex.bindings.write();
        let mut q_bindings = q.bindings.write();
        ex_bindings.insert(binding.key.clone(), binding.clone());
        q_bindings.insert(binding.key.clone(), binding);

        debug!(
            exchange = exchange,
            queue = queue,
            routing_key = routing_key,
            "queue bound"
        );
        true
    }

    /// Removes a binding from both sides.
    ///
    /// An auto-delete exchange left without bindings is deleted.
    pub fn unbind(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        let key = BindingKey::new(exchange, queue, routing_key);
        let ex = self.exchange(exchange);
        let q = self.queue(queue);

        let (removed, now_unused) = {
            let mut ex_bindings = ex.as_ref().map(|e| e.bindings.write());
            let mut q_bindings = q.as_ref().map(|q| q.bindings.write());

            let mut removed = false;
            if let Some(bindings) = ex_bindings.as_mut() {
                removed |= bindings.remove(&key).is_some();
            }
            if let Some(bindings) = q_bindings.as_mut() {
                removed |= bindings.remove(&key).is_some();
            }
            let now_unused = ex_bindings.as_ref().is_some_and(|b| b.is_empty());
            (removed, now_unused)
        };

        if let Some(ex) = ex {
            if removed && now_unused && ex.is_auto_delete() {
                self.delete_exchange(exchange, false);
            }
        }

        removed
    }

    /// Routes a message through `exchange`, creating it as a direct exchange
    /// when it does not exist yet. Returns how many queues received a copy.
    pub fn publish(&self, msg: &MessageEnvelope) -> usize {
        let exchange = self.declare_exchange(
            &msg.exchange,
            ExchangeKind::Direct,
            ExchangeFlags::default(),
            FieldTable::default(),
        );

        let destinations: Vec<Arc<Queue>> = exchange
            .route(msg)
            .iter()
            .filter_map(|name| self.queue(name))
            .collect();

        for queue in &destinations {
            queue.enqueue(Arc::new(msg.for_queue(queue.name())));
        }

        destinations.len()
    }
}
