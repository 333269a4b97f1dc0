// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Bus
//!
//! `AmqpError` covers every failure the bus reports to its callers: broker
//! connectivity, channel and topology provisioning, message encoding,
//! acknowledgment, registry lookups and worker lifecycle. Failures raised by
//! caller-supplied handlers live in [`crate::handler::HandlerError`].

use thiserror::Error;

/// Represents errors that can occur during AMQP bus operations.
///
/// Variants carry owned strings rather than the underlying `lapin` error so
/// the enum stays comparable in tests; the source error is always logged at
/// the call site before it is converted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker could not be reached, or the connection is gone and could
    /// not be re-established
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating or configuring a channel on an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error subscribing a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A passively checked exchange does not exist
    #[error("exchange `{0}` doesn't exist")]
    ExchangeNotFound(String),

    /// A passively checked queue does not exist
    #[error("queue `{0}` doesn't exist")]
    QueueNotFound(String),

    /// A passive existence check failed for a reason other than absence
    #[error("failure to check topology `{0}`")]
    TopologyCheckError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error encoding a message
    #[error("failure to serialize message `{0}`")]
    SerializationError(String),

    /// Error decoding a message payload
    #[error("failure to parse payload `{0}`")]
    DeserializationError(String),

    /// The payload carries no type discriminator
    #[error("payload has no message type")]
    MissingMessageType,

    /// The payload's type discriminator does not map to the requested type
    #[error("unexpected message type `{found}`, expected `{expected}`")]
    UnexpectedMessageType { expected: String, found: String },

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The bus was disposed and can no longer open channels
    #[error("bus is closed")]
    BusClosed,

    /// No dynamic bus is registered under the given identity
    #[error("no queue service registered for `{0}`")]
    ServiceNotFound(String),

    /// Two dynamic buses share the same identity
    #[error("queue service `{0}` is registered more than once")]
    DuplicateService(String),

    /// Configuration could not be bound
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// A consumer worker could not be started or terminated abnormally
    #[error("consumer worker failure `{0}`")]
    WorkerError(String),
}
