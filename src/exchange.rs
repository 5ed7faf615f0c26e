// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchanges
//!
//! Exchanges are the routing nodes of the broker. This module holds the
//! closed set of exchange kinds, the builder used by the topology installer
//! and the in-memory [`Exchange`] that decides which bound queues receive a
//! published message.

use crate::{
    binding::{Binding, BindingKey},
    errors::AmqpError,
    message::MessageEnvelope,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

/// Binding argument selecting how a headers exchange compares header tables
pub const AMQP_HEADERS_MATCH: &str = "x-match";

/// Represents the types of exchanges the broker can route through.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl TryFrom<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    /// Converts lapin's ExchangeKind into one of the four routing strategies.
    ///
    /// Custom kinds are accepted only when they spell one of the standard
    /// names; plugin types such as `x-delayed-message` are rejected.
    fn try_from(kind: lapin::ExchangeKind) -> Result<ExchangeKind, AmqpError> {
        match kind {
            lapin::ExchangeKind::Direct => Ok(ExchangeKind::Direct),
            lapin::ExchangeKind::Fanout => Ok(ExchangeKind::Fanout),
            lapin::ExchangeKind::Topic => Ok(ExchangeKind::Topic),
            lapin::ExchangeKind::Headers => Ok(ExchangeKind::Headers),
            lapin::ExchangeKind::Custom(name) => match name.as_str() {
                "direct" => Ok(ExchangeKind::Direct),
                "fanout" => Ok(ExchangeKind::Fanout),
                "topic" => Ok(ExchangeKind::Topic),
                "headers" => Ok(ExchangeKind::Headers),
                other => Err(AmqpError::UnsupportedExchangeKind(other.to_owned())),
            },
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of an exchange with its configuration parameters.
///
/// This struct implements the builder pattern used by
/// [`AmqpTopology`](crate::topology::AmqpTopology).
#[derive(Debug, Clone)]
pub struct ExchangeDefinition<'ex> {
    pub(crate) name: &'ex str,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl<'ex> ExchangeDefinition<'ex> {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a Direct exchange with default parameters.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: &'ex str) -> ExchangeDefinition<'ex> {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The routing strategy of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes this a direct exchange.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Makes this a fanout exchange.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Makes this a topic exchange.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Makes this a headers exchange.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Replaces the exchange arguments.
    ///
    /// # Parameters
    /// * `params` - The full argument table
    ///
    /// # Returns
    /// Self for method chaining
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single argument to the exchange.
    ///
    /// # Parameters
    /// * `key` - Argument name
    /// * `value` - Argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete once its last binding is removed.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Marks the exchange as durable.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the declaration passive.
    ///
    /// Install then fails with `ExchangeNotFound` when the exchange does not exist.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Marks the exchange as internal.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    All,
    Any,
}

/// How a headers binding compares its arguments with message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadersMatch {
    mode: MatchMode,
    /// `x-` prefixed arguments take part in the comparison
    with_x: bool,
}

impl HeadersMatch {
    fn from_arguments(arguments: &FieldTable) -> HeadersMatch {
        let value = arguments
            .inner()
            .get(AMQP_HEADERS_MATCH)
            .and_then(|value| match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok(),
                AMQPValue::ShortString(s) => Some(s.as_str()),
                _ => None,
            });

        let (mode, with_x) = match value {
            None | Some("all") => (MatchMode::All, false),
            Some("any") => (MatchMode::Any, false),
            Some("all-with-x") => (MatchMode::All, true),
            Some("any-with-x") => (MatchMode::Any, true),
            Some(other) => {
                debug!(x_match = other, "unsupported x-match value, matching all");
                (MatchMode::All, false)
            }
        };

        HeadersMatch { mode, with_x }
    }
}

/// A declared exchange and the bindings leaving it.
#[derive(Debug)]
pub struct Exchange {
    name: String,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    internal: bool,
    arguments: FieldTable,
    pub(crate) bindings: RwLock<BTreeMap<BindingKey, Binding>>,
}

impl Exchange {
    pub fn new(
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        arguments: FieldTable,
    ) -> Self {
        Exchange {
            name: name.to_owned(),
            kind,
            durable,
            auto_delete,
            internal,
            arguments,
            bindings: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn arguments(&self) -> &FieldTable {
        &self.arguments
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.bindings.read().values().cloned().collect()
    }

    /// Names of the queues that should receive a copy of `msg`.
    ///
    /// Each queue appears at most once, in binding-key order, even when
    /// several of its bindings match.
    pub fn route(&self, msg: &MessageEnvelope) -> Vec<String> {
        let bindings = self.bindings.read();
        let mut queues: Vec<String> = Vec::new();

        for binding in bindings.values() {
            if !self.matches(binding, msg) {
                continue;
            }
            if queues.iter().all(|q| q != binding.queue()) {
                queues.push(binding.queue().to_owned());
            }
        }

        queues
    }

    fn matches(&self, binding: &Binding, msg: &MessageEnvelope) -> bool {
        match self.kind {
            ExchangeKind::Direct => binding.routing_key() == msg.routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(binding.routing_key(), &msg.routing_key),
            ExchangeKind::Headers => headers_match(&binding.arguments, msg.headers()),
        }
    }
}

/// Matches a routing key against a topic pattern.
///
/// `*` stands for exactly one dot-separated word and `#` for zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern = words(pattern);
    let key = words(routing_key);
    words_match(&pattern, &key)
}

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        return vec![];
    }
    s.split('.').collect()
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((first, rest)) if *first == "#" => {
            (0..=key.len()).any(|skip| words_match(rest, &key[skip..]))
        }
        Some((first, rest)) => match key.split_first() {
            Some((word, key_rest)) if *first == "*" || first == word => {
                words_match(rest, key_rest)
            }
            _ => false,
        },
    }
}

/// Compares binding arguments with a message's header table.
///
/// Arguments prefixed with `x-` configure the binding and are not compared,
/// unless `x-match` is `all-with-x` or `any-with-x`.
/// A `Void` argument only requires the header to be present.
pub fn headers_match(arguments: &FieldTable, headers: Option<&FieldTable>) -> bool {
    let empty = FieldTable::default();
    let headers = headers.unwrap_or(&empty).inner();
    let rule = HeadersMatch::from_arguments(arguments);

    let mut criteria = arguments.inner().iter().filter(|(key, _)| {
        key.as_str() != AMQP_HEADERS_MATCH && (rule.with_x || !key.as_str().starts_with("x-"))
    });

    let matches = |(key, expected): (&ShortString, &AMQPValue)| match headers.get(key) {
        Some(actual) => matches!(expected, AMQPValue::Void) || actual == expected,
        None => false,
    };

    match rule.mode {
        MatchMode::All => criteria.all(matches),
        MatchMode::Any => criteria.any(matches),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{
        types::{LongInt, LongString},
        BasicProperties,
    };

    fn table(entries: &[(&str, AMQPValue)]) -> FieldTable {
        let mut t = FieldTable::default();
        for (k, v) in entries {
            t.insert(ShortString::from(*k), v.clone());
        }
        t
    }

    fn text(s: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(s))
    }

    fn exchange(kind: ExchangeKind, bindings: &[(&str, &str, FieldTable)]) -> Exchange {
        let ex = Exchange::new("ex", kind, false, false, false, FieldTable::default());
        for (queue, key, args) in bindings {
            let b = Binding::new("ex", queue, key, args.clone());
            ex.bindings.write().insert(b.key.clone(), b);
        }
        ex
    }

    fn msg(routing_key: &str, headers: Option<FieldTable>) -> MessageEnvelope {
        let props = match headers {
            Some(h) => BasicProperties::default().with_headers(h),
            None => BasicProperties::default(),
        };
        MessageEnvelope::new("ex", routing_key, false, props, b"body")
    }

    #[test]
    fn kind_from_lapin() {
        assert_eq!(
            ExchangeKind::try_from(lapin::ExchangeKind::Topic),
            Ok(ExchangeKind::Topic)
        );
        assert_eq!(
            ExchangeKind::try_from(lapin::ExchangeKind::Custom("fanout".to_owned())),
            Ok(ExchangeKind::Fanout)
        );
        assert_eq!(
            ExchangeKind::try_from(lapin::ExchangeKind::Custom("x-delayed-message".to_owned())),
            Err(AmqpError::UnsupportedExchangeKind("x-delayed-message".to_owned()))
        );
    }

    #[test]
    fn direct_routes_on_exact_key() {
        let ex = exchange(
            ExchangeKind::Direct,
            &[
                ("q1", "k", FieldTable::default()),
                ("q2", "K", FieldTable::default()),
            ],
        );
        assert_eq!(ex.route(&msg("k", None)), vec!["q1".to_owned()]);
        assert!(ex.route(&msg("other", None)).is_empty());
    }

    #[test]
    fn fanout_ignores_key_and_dedupes_queues() {
        let ex = exchange(
            ExchangeKind::Fanout,
            &[
                ("q1", "a", FieldTable::default()),
                ("q1", "b", FieldTable::default()),
                ("q2", "", FieldTable::default()),
            ],
        );
        assert_eq!(
            ex.route(&msg("anything", None)),
            vec!["q1".to_owned(), "q2".to_owned()]
        );
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("stock.*.nyse", "stock.ibm.nyse"));
        assert!(!topic_matches("stock.*.nyse", "stock.nyse"));
        assert!(!topic_matches("stock.*", "stock.ibm.nyse"));
        assert!(topic_matches("stock.#", "stock"));
        assert!(topic_matches("stock.#", "stock.ibm.nyse"));
        assert!(topic_matches("#.nyse", "stock.ibm.nyse"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("a.#.c", "a.c"));
        assert!(topic_matches("a.#.c", "a.b.b.c"));
        assert!(!topic_matches("a.#.c", "a.b.d"));
        assert!(!topic_matches("Stock.#", "stock.ibm"));
    }

    #[test]
    fn topic_exchange_routes_matching_patterns() {
        let ex = exchange(
            ExchangeKind::Topic,
            &[
                ("all", "#", FieldTable::default()),
                ("errors", "*.error", FieldTable::default()),
            ],
        );
        assert_eq!(
            ex.route(&msg("app.error", None)),
            vec!["all".to_owned(), "errors".to_owned()]
        );
        assert_eq!(ex.route(&msg("app.info", None)), vec!["all".to_owned()]);
    }

    #[test]
    fn headers_all_and_any() {
        let all = table(&[("format", text("pdf")), ("type", text("report"))]);
        let any = table(&[
            (AMQP_HEADERS_MATCH, text("any")),
            ("format", text("pdf")),
            ("type", text("report")),
        ]);

        let both = table(&[("format", text("pdf")), ("type", text("report"))]);
        let one = table(&[("format", text("pdf")), ("type", text("log"))]);

        assert!(headers_match(&all, Some(&both)));
        assert!(!headers_match(&all, Some(&one)));
        assert!(headers_match(&any, Some(&one)));
        assert!(!headers_match(&any, None));
    }

    #[test]
    fn headers_with_x_compares_x_arguments() {
        let all_with_x = table(&[
            (AMQP_HEADERS_MATCH, text("all-with-x")),
            ("x-tenant", text("acme")),
        ]);
        let any_with_x = table(&[
            (AMQP_HEADERS_MATCH, text("any-with-x")),
            ("x-tenant", text("acme")),
            ("format", text("pdf")),
        ]);
        let plain_all = table(&[("x-tenant", text("acme"))]);

        let other_tenant = table(&[("x-tenant", text("globex"))]);
        let acme = table(&[("x-tenant", text("acme"))]);

        assert!(headers_match(&all_with_x, Some(&acme)));
        assert!(!headers_match(&all_with_x, Some(&other_tenant)));
        assert!(headers_match(&any_with_x, Some(&acme)));
        assert!(!headers_match(&any_with_x, Some(&other_tenant)));
        assert!(headers_match(&plain_all, Some(&other_tenant)));
    }

    #[test]
    fn unknown_x_match_falls_back_to_all() {
        let args = table(&[
            (AMQP_HEADERS_MATCH, text("most")),
            ("format", text("pdf")),
            ("type", text("report")),
        ]);
        let one = table(&[("format", text("pdf"))]);
        assert!(!headers_match(&args, Some(&one)));
    }

    #[test]
    fn headers_void_matches_presence_and_values_compare_by_type() {
        let args = table(&[("tenant", AMQPValue::Void)]);
        assert!(headers_match(
            &args,
            Some(&table(&[("tenant", AMQPValue::LongInt(LongInt::from(7)))]))
        ));
        assert!(!headers_match(&args, Some(&FieldTable::default())));

        let args = table(&[("n", AMQPValue::LongInt(LongInt::from(7)))]);
        assert!(!headers_match(&args, Some(&table(&[("n", text("7"))]))));
    }

    #[test]
    fn headers_exchange_routes_on_properties() {
        let ex = exchange(
            ExchangeKind::Headers,
            &[("pdf", "", table(&[("format", text("pdf"))]))],
        );
        let headers = table(&[("format", text("pdf"))]);
        assert_eq!(ex.route(&msg("ignored", Some(headers))), vec!["pdf".to_owned()]);
        assert!(ex.route(&msg("ignored", None)).is_empty());
    }
}
