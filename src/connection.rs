// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connections
//!
//! A [`Connection`] is a named handle over a shared [`BrokerState`] that
//! hands out numbered channels. Closing it aborts every channel it opened.

use crate::{
    broker::BrokerState,
    channel::{Channel, ChannelInner},
    config::RabbitMQConfigs,
    errors::{AmqpError, ShutdownReason},
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc, Weak,
};
use tracing::{debug, error};

pub struct Connection {
    name: String,
    broker: Arc<BrokerState>,
    next_channel_id: AtomicU16,
    close_reason: Mutex<Option<ShutdownReason>>,
    channels: Mutex<Vec<Weak<ChannelInner>>>,
}

impl Connection {
    pub fn new(name: &str, broker: Arc<BrokerState>) -> Connection {
        Connection {
            name: name.to_owned(),
            broker,
            next_channel_id: AtomicU16::new(1),
            close_reason: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.close_reason.lock().is_none()
    }

    /// Opens a new channel numbered after the previous one.
    pub fn create_channel(&self) -> Result<Channel, AmqpError> {
        if let Some(reason) = self.close_reason.lock().as_ref() {
            error!(connection = self.name, "channel requested on a closed connection");
            return Err(AmqpError::already_closed(reason));
        }

        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let channel = Channel::new(id, self.broker.clone());

        let mut channels = self.channels.lock();
        channels.retain(|ch| ch.strong_count() > 0);
        channels.push(channel.downgrade());

        debug!(connection = self.name, channel = id, "channel created");
        Ok(channel)
    }

    /// Closes the connection and aborts its channels.
    pub fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.shutdown(ShutdownReason::new(reply_code, reply_text))
    }

    /// Closes the connection if it is still open. Never fails.
    pub fn abort(&self) {
        let _ = self.shutdown(ShutdownReason::default());
    }

    fn shutdown(&self, reason: ShutdownReason) -> Result<(), AmqpError> {
        {
            let mut close_reason = self.close_reason.lock();
            if let Some(existing) = close_reason.as_ref() {
                return Err(AmqpError::already_closed(existing));
            }
            *close_reason = Some(reason.clone());
        }

        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels.iter().filter_map(Weak::upgrade) {
            let _ = channel.shutdown(reason.clone(), true);
        }

        debug!(connection = self.name, "connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Opens a connection to `broker` and a first channel on it.
///
/// # Parameters
/// * `broker` - The broker state shared by every connection of a test
/// * `cfg` - Connection settings; the connection is named after them
///
/// # Returns
/// The connection and its channel, or an error when the settings are unusable
pub fn new_amqp_channel(
    broker: Arc<BrokerState>,
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Channel), AmqpError> {
    debug!(uri = cfg.uri(), "creating amqp connection...");

    if cfg.host.is_empty() {
        error!("failure to connect: empty host");
        return Err(AmqpError::ConnectionError);
    }

    let conn = Arc::new(Connection::new(&cfg.connection_name, broker));
    debug!("amqp connected");

    match conn.create_channel() {
        Ok(channel) => Ok((conn, channel)),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{options::QueueDeclareOptions, types::FieldTable};

    #[test]
    fn channels_are_numbered() {
        let conn = Connection::new("test", Arc::new(BrokerState::new()));

        assert_eq!(conn.create_channel().unwrap().id(), 1);
        assert_eq!(conn.create_channel().unwrap().id(), 2);
    }

    #[test]
    fn closing_the_connection_closes_its_channels() {
        let conn = Connection::new("test", Arc::new(BrokerState::new()));
        let ch = conn.create_channel().unwrap();

        conn.close(320, "shutdown").unwrap();

        assert!(!conn.is_open());
        assert!(!ch.is_open());
        assert!(ch
            .queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .is_err());
        assert_eq!(
            conn.close(200, "again"),
            Err(AmqpError::AlreadyClosed {
                code: 320,
                text: "shutdown".to_owned()
            })
        );
        assert!(conn.create_channel().is_err());
    }

    #[test]
    fn new_amqp_channel_shares_the_broker() {
        let broker = Arc::new(BrokerState::new());
        let (conn, ch) = new_amqp_channel(broker.clone(), &RabbitMQConfigs::default()).unwrap();

        ch.queue_declare("q", QueueDeclareOptions::default(), FieldTable::default())
            .unwrap();

        assert_eq!(conn.name(), "rabbitmq-fake");
        assert!(broker.queue("q").is_some());
    }

    #[test]
    fn empty_host_fails_to_connect() {
        let cfg = RabbitMQConfigs {
            host: String::new(),
            ..RabbitMQConfigs::default()
        };

        assert_eq!(
            new_amqp_channel(Arc::new(BrokerState::new()), &cfg).err(),
            Some(AmqpError::ConnectionError)
        );
    }
}
