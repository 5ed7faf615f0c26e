// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bindings
//!
//! A binding links one exchange to one queue under a routing key. The same
//! binding is stored on both sides, keyed by [`BindingKey`], so binding twice
//! only replaces the argument table.

use lapin::types::FieldTable;

/// Composite identity of a binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl BindingKey {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        BindingKey {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub key: BindingKey,
    pub arguments: FieldTable,
}

impl Binding {
    pub fn new(exchange: &str, queue: &str, routing_key: &str, arguments: FieldTable) -> Self {
        Binding {
            key: BindingKey::new(exchange, queue, routing_key),
            arguments,
        }
    }

    pub fn queue(&self) -> &str {
        &self.key.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.key.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_exchange_then_queue_then_routing_key() {
        let a = BindingKey::new("ex", "a", "z");
        let b = BindingKey::new("ex", "b", "a");
        let c = BindingKey::new("ex", "b", "b");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b, BindingKey::new("ex", "b", "a"));
    }
}
