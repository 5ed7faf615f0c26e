// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use rabbitmq_fake::{
    new_amqp_channel, BrokerState, Channel, Connection, PublishOutcome, QueueingConsumer,
    RabbitMQConfigs,
};
use std::{sync::Arc, time::Duration};

fn open() -> (Arc<Connection>, Channel) {
    new_amqp_channel(Arc::new(BrokerState::new()), &RabbitMQConfigs::default()).unwrap()
}

fn declare_direct(ch: &Channel, exchange: &str, queue: &str, key: &str) {
    ch.exchange_declare(
        exchange,
        ExchangeKind::Direct,
        ExchangeDeclareOptions::default(),
        FieldTable::default(),
    )
    .unwrap();
    ch.queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
        .unwrap();
    ch.queue_bind(queue, exchange, key, QueueBindOptions::default(), FieldTable::default())
        .unwrap();
}

#[test]
fn received_message_has_body_and_properties() {
    let (_conn, ch) = open();
    declare_direct(&ch, "my_exchange", "my_queue", "some-key");

    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("tenant"),
        AMQPValue::LongString(LongString::from("acme")),
    );
    let props = BasicProperties::default()
        .with_content_type(ShortString::from("text/plain"))
        .with_message_id(ShortString::from("42"))
        .with_headers(headers);

    let outcome = ch
        .basic_publish(
            "my_exchange",
            "some-key",
            BasicPublishOptions::default(),
            b"hello_world",
            props.clone(),
        )
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Routed(1));

    let msg = ch
        .basic_get("my_queue", BasicGetOptions { no_ack: false })
        .unwrap()
        .unwrap();
    assert_eq!(msg.body, b"hello_world");
    assert_eq!(msg.properties, props);
    assert_eq!(msg.routing_key, "some-key");
    assert_eq!(msg.delivery_tag, 1);

    ch.basic_ack(msg.delivery_tag, BasicAckOptions::default())
        .unwrap();
    assert!(ch
        .basic_get("my_queue", BasicGetOptions::default())
        .unwrap()
        .is_none());
}

#[test]
fn default_exchange_routes_by_queue_name() {
    let (_conn, ch) = open();
    ch.queue_declare("direct_q", QueueDeclareOptions::default(), FieldTable::default())
        .unwrap();

    ch.basic_publish(
        "",
        "direct_q",
        BasicPublishOptions::default(),
        b"via default",
        BasicProperties::default(),
    )
    .unwrap();

    assert_eq!(ch.message_count("direct_q").unwrap(), 1);
}

#[tokio::test]
async fn queueing_consumer_receives_messages_published_before_and_after() {
    let (_conn, ch) = open();
    declare_direct(&ch, "ex", "q", "k");

    ch.basic_publish("ex", "k", BasicPublishOptions::default(), b"first", BasicProperties::default())
        .unwrap();

    let (consumer, mut deliveries) = QueueingConsumer::new();
    ch.basic_consume(
        "q",
        "",
        BasicConsumeOptions::default(),
        FieldTable::default(),
        Arc::new(consumer),
    )
    .unwrap();

    ch.basic_publish("ex", "k", BasicPublishOptions::default(), b"second", BasicProperties::default())
        .unwrap();

    let first = deliveries
        .next_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    let second = deliveries.next().await.unwrap();

    assert_eq!(first.body, b"first");
    assert_eq!(second.body, b"second");
    assert!(first.delivery_tag < second.delivery_tag);
    assert!(first.consumer_tag.starts_with("amq.ctag-"));

    ch.basic_ack(second.delivery_tag, BasicAckOptions { multiple: true })
        .unwrap();
    assert_eq!(ch.message_count("q").unwrap(), 0);
}

#[tokio::test]
async fn consumers_on_other_channels_see_the_same_queue() {
    let (conn, publisher) = open();
    declare_direct(&publisher, "ex", "shared", "k");
    let subscriber = conn.create_channel().unwrap();

    let (consumer, mut deliveries) = QueueingConsumer::new();
    subscriber
        .basic_consume(
            "shared",
            "sub",
            BasicConsumeOptions::default(),
            FieldTable::default(),
            Arc::new(consumer),
        )
        .unwrap();

    publisher
        .basic_publish("ex", "k", BasicPublishOptions::default(), b"x", BasicProperties::default())
        .unwrap();

    let delivery = deliveries
        .next_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(delivery.consumer_tag, "sub");
    assert_eq!(delivery.delivery_tag, 1);

    conn.close(200, "done").unwrap();
    assert!(!subscriber.is_open());
    assert!(deliveries.next().await.is_none());
}
