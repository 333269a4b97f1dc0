// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqp-bus
//!
//! A resilient bus over RabbitMQ. One [`connection::ConnectionManager`] per
//! process keeps the broker connection alive; buses built on it declare
//! their topology, publish JSON messages and consume them with
//! at-least-once acknowledgment:
//!
//! - [`persistent::PersistentQueueService`] publishes to and consumes from
//!   one queue, message by message or in batches
//! - [`dynamic::DynamicQueueService`] publishes to a topology that already
//!   exists, looked up through [`resolver::QueueServiceResolver`]
//! - [`worker`] runs consume loops on dedicated threads until a
//!   [`shutdown::ShutdownSignal`] fires

mod otel;

pub mod bus;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dynamic;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod persistent;
pub mod publisher;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod shutdown;
pub mod topology;
pub mod worker;
