// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside the message header table. Publishers can
//! stamp it with [`inject_context`]; every push delivery opens a consumer span
//! whose parent is extracted from the same headers.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer used for delivery spans
pub const TRACER_NAME: &str = "amqp consumer";

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

fn header_map(props: &BasicProperties) -> BTreeMap<ShortString, AMQPValue> {
    props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone()
}

/// Returns `props` with the trace context of `ctx` added to its headers.
///
/// Headers already present are kept.
pub fn inject_context(ctx: &Context, props: BasicProperties) -> BasicProperties {
    let mut headers = header_map(&props);

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
    });

    props.with_headers(FieldTable::from(headers))
}

/// Creates a consumer span for one delivery.
///
/// The parent context is extracted from the message headers, so a publisher
/// that called [`inject_context`] shows up as the span's parent.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
    queue: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut header_map(props)))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![KeyValue::new("messaging.destination.name", queue.to_owned())])
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn propagator_reads_and_writes_long_strings() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("other"),
            AMQPValue::LongInt(1),
        );

        let mut propagator = RabbitMQTracePropagator::new(&mut headers);
        propagator.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.get("other"), None);
        let mut keys = propagator.keys();
        keys.sort();
        assert_eq!(keys, vec!["other", "traceparent"]);
    }

    #[test]
    fn inject_keeps_existing_headers() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("tenant"),
            AMQPValue::LongString(LongString::from("acme")),
        );
        let props = BasicProperties::default().with_headers(table);

        let props = inject_context(&Context::new(), props);

        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
    }
}
