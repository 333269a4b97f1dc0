// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Caller-supplied logic invoked by the consume loops. A handler decides the
//! fate of each delivery through its return value:
//!
//! - `Ok(true)`: processed, the delivery is acknowledged
//! - `Ok(false)`: rejected, the delivery is dead-lettered
//! - `Err(HandlerError::Failed(_))`: `on_error` runs, then the delivery is
//!   dead-lettered
//! - `Err(HandlerError::Cancelled)`: the loop stops and the bus is disposed

use crate::{codec::QueueMessage, shutdown::ShutdownSignal};
use async_trait::async_trait;
use std::error::Error;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler observed shutdown and gave up on the delivery
    #[error("message handling cancelled")]
    Cancelled,

    #[error("message handling failed: {0}")]
    Failed(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        HandlerError::Failed(err.into())
    }
}

/// Processes deliveries one at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Message: QueueMessage;

    async fn on_message(
        &self,
        message: &Self::Message,
        shutdown: &ShutdownSignal,
    ) -> Result<bool, HandlerError>;

    fn on_error(&self, err: &HandlerError, message: &Self::Message);
}

/// Processes deliveries in batches of the queue's prefetch size.
#[async_trait]
pub trait BatchMessageHandler: Send + Sync {
    type Message: QueueMessage;

    async fn on_batch(
        &self,
        messages: &[Self::Message],
        shutdown: &ShutdownSignal,
    ) -> Result<bool, HandlerError>;

    fn on_error(&self, err: &HandlerError, messages: &[Self::Message]);
}
