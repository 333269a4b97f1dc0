// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Settlement of deliveries: decoding, handing them to the caller's handler
//! and turning its verdict into an ack or a nack. Single deliveries and
//! batches share the same rules; rejected deliveries are never requeued so
//! the broker routes them to the queue's dead-letter exchange.
//!
//! Acknowledgments go through the [`Acknowledger`] seam so the settlement
//! rules can be exercised without a broker.

use crate::{
    codec,
    errors::AmqpError,
    handler::{BatchMessageHandler, HandlerError, MessageHandler},
    otel,
    shutdown::ShutdownSignal,
};
use async_trait::async_trait;
use lapin::protocol::basic::AMQPProperties;
use opentelemetry::trace::{Span, Status};
use std::borrow::Cow;
use tracing::{debug, error, info, warn};

/// Settles deliveries on the channel they arrived on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
}

/// Whether the consume loop keeps going after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The handler cancelled; the loop ends and the bus is disposed.
    Stop,
}

/// Decodes one delivery, runs the handler and settles it.
pub async fn handle_delivery<H, A>(
    delivery_tag: u64,
    data: &[u8],
    properties: &AMQPProperties,
    handler: &H,
    shutdown: &ShutdownSignal,
    acker: &A,
) -> Flow
where
    H: MessageHandler + ?Sized,
    A: Acknowledger + ?Sized,
{
    let message_type = properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str().to_owned())
        .unwrap_or_default();

    let (_ctx, mut span) = otel::consumer_span(properties, &message_type);

    debug!(delivery_tag, message_type, "received message");

    let message = match codec::decode::<H::Message>(data, Some(&message_type)) {
        Ok(message) => message,
        Err(err) => {
            error!(
                error = err.to_string(),
                delivery_tag, "removing undecodable message from queue"
            );
            span.set_status(Status::error(err.to_string()));
            reject(acker, delivery_tag, false).await;
            return Flow::Continue;
        }
    };

    match handler.on_message(&message, shutdown).await {
        Ok(true) => {
            debug!(delivery_tag, "message successfully processed");
            if let Err(err) = acker.ack(delivery_tag, false).await {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Flow::Continue;
            }
            span.set_status(Status::Ok);
            Flow::Continue
        }
        Ok(false) => {
            warn!(delivery_tag, "message rejected by the handler");
            span.set_status(Status::error("message rejected by the handler"));
            reject(acker, delivery_tag, false).await;
            Flow::Continue
        }
        Err(HandlerError::Cancelled) => {
            info!(delivery_tag, "message handling cancelled, stopping consumer");
            Flow::Stop
        }
        Err(err) => {
            error!(error = err.to_string(), delivery_tag, "error whiling handling msg");
            span.set_status(Status::error(err.to_string()));
            handler.on_error(&err, &message);
            reject(acker, delivery_tag, false).await;
            Flow::Continue
        }
    }
}

/// Deliveries waiting for their batch to fill up.
pub struct BatchBuffer<T> {
    capacity: usize,
    messages: Vec<T>,
    delivery_tags: Vec<u64>,
}

/// A full or released batch, with the tag of every delivery it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub messages: Vec<T>,
    pub delivery_tags: Vec<u64>,
    pub last_tag: u64,
}

impl<T> BatchBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        BatchBuffer {
            capacity,
            messages: Vec::with_capacity(capacity),
            delivery_tags: Vec::with_capacity(capacity),
        }
    }

    /// Buffers a delivery; returns true once the batch is full.
    pub fn push(&mut self, message: T, delivery_tag: u64) -> bool {
        self.messages.push(message);
        self.delivery_tags.push(delivery_tag);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_tag(&self) -> Option<u64> {
        self.delivery_tags.last().copied()
    }

    /// Empties the buffer into a [`Batch`].
    pub fn drain(&mut self) -> Option<Batch<T>> {
        let last_tag = self.last_tag()?;
        let messages = std::mem::replace(&mut self.messages, Vec::with_capacity(self.capacity));
        let delivery_tags =
            std::mem::replace(&mut self.delivery_tags, Vec::with_capacity(self.capacity));

        Some(Batch {
            messages,
            delivery_tags,
            last_tag,
        })
    }
}

/// Decodes one delivery into the batch and settles the batch once it is full.
pub async fn handle_batch_delivery<H, A>(
    delivery_tag: u64,
    data: &[u8],
    properties: &AMQPProperties,
    buffer: &mut BatchBuffer<H::Message>,
    handler: &H,
    shutdown: &ShutdownSignal,
    acker: &A,
) -> Flow
where
    H: BatchMessageHandler + ?Sized,
    A: Acknowledger + ?Sized,
{
    let message_type = properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str().to_owned())
        .unwrap_or_default();

    let message = match codec::decode::<H::Message>(data, Some(&message_type)) {
        Ok(message) => message,
        Err(err) => {
            error!(
                error = err.to_string(),
                delivery_tag, "removing undecodable message from queue"
            );
            reject(acker, delivery_tag, false).await;
            return Flow::Continue;
        }
    };

    if !buffer.push(message, delivery_tag) {
        debug!(
            delivery_tag,
            buffered = buffer.len(),
            "message buffered, waiting for the batch to fill"
        );
        return Flow::Continue;
    }

    let Some(batch) = buffer.drain() else {
        return Flow::Continue;
    };
    let last_tag = batch.last_tag;

    let (_ctx, mut span) = otel::consumer_span(properties, &message_type);
    debug!(size = batch.messages.len(), last_tag, "dispatching batch");

    match handler.on_batch(&batch.messages, shutdown).await {
        Ok(true) => {
            debug!(last_tag, "batch successfully processed");
            if let Err(err) = acker.ack(last_tag, true).await {
                error!(error = err.to_string(), last_tag, "error whiling ack batch");
                span.set_status(Status::error("error to ack batch"));
                return Flow::Continue;
            }
            span.set_status(Status::Ok);
            Flow::Continue
        }
        Ok(false) => {
            warn!(last_tag, "batch rejected by the handler");
            span.set_status(Status::error("batch rejected by the handler"));
            reject(acker, last_tag, true).await;
            Flow::Continue
        }
        Err(HandlerError::Cancelled) => {
            info!(last_tag, "batch handling cancelled, stopping consumer");
            Flow::Stop
        }
        Err(err) => {
            error!(error = err.to_string(), last_tag, "error whiling handling batch");
            span.set_status(Status::error(err.to_string()));
            handler.on_error(&err, &batch.messages);
            // an unsettled delivery keeps its prefetch slot
            for delivery_tag in &batch.delivery_tags {
                reject(acker, *delivery_tag, false).await;
            }
            Flow::Continue
        }
    }
}

/// Hands a partially filled batch back to the broker for redelivery.
pub async fn release_partial_batch<T, A>(buffer: &mut BatchBuffer<T>, acker: &A)
where
    A: Acknowledger + ?Sized,
{
    let Some(batch) = buffer.drain() else {
        return;
    };

    info!(
        buffered = batch.messages.len(),
        last_tag = batch.last_tag,
        "requeuing partial batch on shutdown"
    );

    if let Err(err) = acker.nack(batch.last_tag, true, true).await {
        error!(
            error = err.to_string(),
            last_tag = batch.last_tag,
            "error whiling requeuing partial batch"
        );
    }
}

async fn reject<A>(acker: &A, delivery_tag: u64, multiple: bool)
where
    A: Acknowledger + ?Sized,
{
    if let Err(err) = acker.nack(delivery_tag, multiple, false).await {
        error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
    }
}
