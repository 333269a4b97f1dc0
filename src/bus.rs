// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Interfaces
//!
//! [`EventBus`] is the full publish/consume surface of a queue-owning bus.
//! [`DynamicEventBus`] is the object-safe, publish-only surface the
//! [`crate::resolver::QueueServiceResolver`] hands out.

use crate::{
    codec::{self, EncodedMessage, QueueMessage},
    config::{DynamicQueueConfiguration, QueueIdentity},
    errors::AmqpError,
    handler::{BatchMessageHandler, MessageHandler},
    shutdown::ShutdownSignal,
};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish<T: QueueMessage>(&self, message: &T) -> Result<(), AmqpError>;

    /// Consumes deliveries one at a time until `shutdown` fires.
    async fn process_queue<H>(&self, handler: Arc<H>, shutdown: ShutdownSignal) -> Result<(), AmqpError>
    where
        H: MessageHandler + 'static;

    /// Consumes deliveries in batches of the configured prefetch size until
    /// `shutdown` fires.
    async fn process_batch_queue<H>(
        &self,
        handler: Arc<H>,
        shutdown: ShutdownSignal,
    ) -> Result<(), AmqpError>
    where
        H: BatchMessageHandler + 'static;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DynamicEventBus: Send + Sync {
    fn settings(&self) -> &DynamicQueueConfiguration;

    fn identity(&self) -> QueueIdentity {
        self.settings().identity()
    }

    async fn publish_encoded(&self, message: &EncodedMessage) -> Result<(), AmqpError>;
}

impl dyn DynamicEventBus {
    pub async fn publish<T: QueueMessage>(&self, message: &T) -> Result<(), AmqpError> {
        let encoded = codec::encode(message)?;
        self.publish_encoded(&encoded).await
    }
}
