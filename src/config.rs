// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings in the shape a RabbitMQ client expects. The fake broker
//! never dials out; the values name the connection and validate configs that
//! are shared with production code.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// RabbitMQ connection settings.
///
/// Every field has a default, so a partial JSON document is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: "rabbitmq-fake".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Parses settings from a JSON document.
    pub fn from_json(raw: &str) -> Result<RabbitMQConfigs, AmqpError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to parse rabbitmq configs");
            AmqpError::InvalidConfig(err.to_string())
        })
    }

    /// The AMQP URI for these settings, with the password masked.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.vhost
        )
    }
}
