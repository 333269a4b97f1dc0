// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! The publish path shared by every bus: stamps the AMQP properties the
//! consumers rely on, propagates the trace context and hands the payload to a
//! confirm-select channel.

use crate::{codec::EncodedMessage, errors::AmqpError, otel};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::ShortString,
    BasicProperties, Channel,
};
use tracing::{debug, error, warn};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";
/// Delivery mode asking the broker to persist the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Properties attached to every published message.
pub fn message_properties(message: &EncodedMessage) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_content_encoding(ShortString::from(UTF8_CONTENT_ENCODING))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_type(ShortString::from(message.message_type.clone()))
        .with_message_id(ShortString::from(message.message_id.clone()))
        .with_timestamp(message.timestamp())
        .with_headers(otel::inject_current_context())
}

/// Puts a producer channel in confirm mode.
pub async fn enable_confirms(channel: &Channel) -> Result<(), AmqpError> {
    channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            AmqpError::ChannelError
        })
}

/// Publishes without waiting for the broker's confirmation.
///
/// The confirmation is awaited by a background task that only logs nacks and
/// failures.
pub async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    message: &EncodedMessage,
) -> Result<(), AmqpError> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &message.body,
            message_properties(message),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                exchange,
                routing_key,
                message_type = message.message_type,
                "error publishing message"
            );
            AmqpError::PublishingError
        })?;

    debug!(
        exchange,
        routing_key,
        message_id = message.message_id,
        "message published"
    );

    let message_id = message.message_id.clone();
    tokio::spawn(async move {
        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                warn!(message_id, "broker rejected the published message")
            }
            Err(err) => error!(
                error = err.to_string(),
                message_id, "failure to receive the publisher confirm"
            ),
            _ => {}
        }
    });

    Ok(())
}
