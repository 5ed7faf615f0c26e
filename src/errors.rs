// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the In-Memory Broker
//!
//! The `AmqpError` enum represents the failures a caller can observe while
//! driving the fake broker. Most "not found" situations are not errors at all:
//! lookups against missing exchanges or queues return empty or zero results,
//! and an unroutable mandatory publish is reported through
//! [`PublishOutcome`](crate::channel::PublishOutcome).

use thiserror::Error;

/// Represents errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The channel or connection was closed before the operation was attempted
    #[error("already closed: {code} {text}")]
    AlreadyClosed { code: u16, text: String },

    /// A passive exchange declaration referenced a missing exchange
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// A passive queue declaration referenced a missing queue
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// The exchange type is not one of direct, fanout, topic or headers
    #[error("unsupported exchange kind `{0}`")]
    UnsupportedExchangeKind(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Broker configuration could not be parsed
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AmqpError {
    pub(crate) fn already_closed(reason: &ShutdownReason) -> Self {
        AmqpError::AlreadyClosed {
            code: reason.reply_code,
            text: reason.reply_text.clone(),
        }
    }
}

/// Why a channel or connection was shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReason {
    pub reply_code: u16,
    pub reply_text: String,
}

impl ShutdownReason {
    pub fn new(reply_code: u16, reply_text: &str) -> Self {
        ShutdownReason {
            reply_code,
            reply_text: reply_text.to_owned(),
        }
    }
}

impl Default for ShutdownReason {
    fn default() -> Self {
        ShutdownReason::new(200, "Goodbye")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_closed_carries_reason() {
        let err = AmqpError::already_closed(&ShutdownReason::new(320, "forced"));
        assert_eq!(
            err,
            AmqpError::AlreadyClosed {
                code: 320,
                text: "forced".to_owned()
            }
        );
        assert_eq!(err.to_string(), "already closed: 320 forced");
    }
}
