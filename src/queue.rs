// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing the queues the bus declares and how they are bound to
//! exchanges. A queue may carry a dead-letter pair: a fanout exchange and a
//! queue bound to it, which receive every message the consumer rejects
//! without requeue.

/// Dead-letter exchange and queue attached to a primary queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterDefinition<'dl> {
    pub(crate) exchange: &'dl str,
    pub(crate) queue: &'dl str,
}

/// A queue to declare. Queues are never exclusive nor auto-deleted.
#[derive(Debug, Clone)]
pub struct QueueDefinition<'qd> {
    pub(crate) name: &'qd str,
    pub(crate) durable: bool,
    pub(crate) dead_letter: Option<DeadLetterDefinition<'qd>>,
}

impl<'qd> QueueDefinition<'qd> {
    pub fn new(name: &'qd str) -> QueueDefinition<'qd> {
        QueueDefinition {
            name,
            durable: false,
            dead_letter: None,
        }
    }

    pub fn durable(self) -> Self {
        QueueDefinition {
            durable: true,
            ..self
        }
    }

    /// Routes rejected messages to `exchange`, a fanout exchange feeding
    /// `queue`. Both are declared and bound before the primary queue, which
    /// carries the `x-dead-letter-exchange` argument.
    pub fn with_dead_letter(self, exchange: &'qd str, queue: &'qd str) -> Self {
        QueueDefinition {
            dead_letter: Some(DeadLetterDefinition { exchange, queue }),
            ..self
        }
    }
}

/// Binding of a queue to an exchange; the routing key defaults to `""`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qb> {
    pub(crate) queue: &'qb str,
    pub(crate) exchange: &'qb str,
    pub(crate) routing_key: &'qb str,
}

impl<'qb> QueueBinding<'qb> {
    pub fn new(queue: &'qb str, exchange: &'qb str) -> QueueBinding<'qb> {
        QueueBinding {
            queue,
            exchange,
            routing_key: "",
        }
    }

    pub fn routing_key(self, routing_key: &'qb str) -> Self {
        QueueBinding { routing_key, ..self }
    }
}
