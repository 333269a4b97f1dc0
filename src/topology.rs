// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the exchanges, queues and bindings a bus relies on,
//! and verifies them passively when a bus must not create anything.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait for RabbitMQ
//! - `QueuePlan`: The topology one queue configuration asks for
//! - Free functions for QoS and passive existence checks

use crate::{
    config::QueueConfiguration,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition<'tp>) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition<'tp>) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding<'tp>) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
///
/// Definitions are installed in registration order.
pub struct AmqpTopology<'tp> {
    channel: Channel,
    pub(crate) queues: Vec<&'tp QueueDefinition<'tp>>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding<'tp>>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Channel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition<'tp>) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition<'tp>) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues, each preceded by its dead-letter pair
    /// 3. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.declare_exchange(exch).await?;
        }

        for def in &self.queues {
            self.install_queue(def).await?;
        }

        for binding in &self.queues_binding {
            self.bind_queue(binding).await?;
        }

        Ok(())
    }
}

impl<'tp> AmqpTopology<'tp> {
    async fn declare_exchange(&self, exch: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exch.name);

        match self
            .channel
            .exchange_declare(
                exch.name,
                exch.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exch.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exch.name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", exch.name);
                Ok(())
            }
        }
    }

    /// Declares a queue, wiring its dead-letter exchange and queue first.
    async fn install_queue(&self, def: &QueueDefinition<'_>) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        let mut queue_args = BTreeMap::new();

        if let Some(dead_letter) = &def.dead_letter {
            let dlx = ExchangeDefinition::new(dead_letter.exchange).fanout().durable();
            self.declare_exchange(&dlx).await?;

            self.declare_queue(dead_letter.queue, true, FieldTable::default())
                .await?;

            self.bind_queue(&QueueBinding::new(dead_letter.queue, dead_letter.exchange))
                .await?;

            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dead_letter.exchange)),
            );
        }

        self.declare_queue(def.name, def.durable, FieldTable::from(queue_args))
            .await
    }

    async fn declare_queue(&self, name: &str, durable: bool, args: FieldTable) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue, binding.exchange, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                binding.queue,
                binding.exchange,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");

                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange.to_owned(),
                    binding.queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// The exchange, queue and binding one queue configuration asks for.
///
/// An empty exchange name means the broker's default exchange, which is
/// neither declared nor bound.
pub struct QueuePlan<'s> {
    pub(crate) exchange: Option<ExchangeDefinition<'s>>,
    pub(crate) queue: QueueDefinition<'s>,
    pub(crate) binding: Option<QueueBinding<'s>>,
}

impl<'s> QueuePlan<'s> {
    pub fn new(settings: &'s QueueConfiguration) -> QueuePlan<'s> {
        let has_exchange = !settings.exchange_name.is_empty();

        let mut queue = QueueDefinition::new(&settings.queue_name).durable();
        if settings.with_dead_letter {
            queue = queue.with_dead_letter(
                &settings.dead_letter_exchange_name,
                &settings.dead_letter_queue_name,
            );
        }

        QueuePlan {
            exchange: has_exchange.then(|| {
                ExchangeDefinition::new(&settings.exchange_name)
                    .kind(settings.exchange_type)
                    .durable()
            }),
            queue,
            binding: has_exchange.then(|| {
                QueueBinding::new(&settings.queue_name, &settings.exchange_name)
                    .routing_key(&settings.routing_key)
            }),
        }
    }

    pub async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        let mut topology = AmqpTopology::new(channel.clone()).queue(&self.queue);

        if let Some(exchange) = &self.exchange {
            topology = topology.exchange(exchange);
        }

        if let Some(binding) = &self.binding {
            topology = topology.queue_binding(binding);
        }

        topology.install().await
    }
}

/// Declares the whole topology of a queue configuration.
pub async fn provision(channel: &Channel, settings: &QueueConfiguration) -> Result<(), AmqpError> {
    QueuePlan::new(settings).install(channel).await
}

/// Declares only the exchange a producer publishes to.
pub async fn declare_exchange(channel: &Channel, settings: &QueueConfiguration) -> Result<(), AmqpError> {
    match QueuePlan::new(settings).exchange {
        Some(exchange) => AmqpTopology::new(channel.clone()).exchange(&exchange).install().await,
        None => Ok(()),
    }
}

/// Binds the configured queue to its exchange.
pub async fn bind(channel: &Channel, settings: &QueueConfiguration) -> Result<(), AmqpError> {
    match QueuePlan::new(settings).binding {
        Some(binding) => AmqpTopology::new(channel.clone()).queue_binding(&binding).install().await,
        None => Ok(()),
    }
}

/// Limits unacknowledged deliveries on a consumer channel.
pub async fn apply_qos(channel: &Channel, prefetch_count: u16) -> Result<(), AmqpError> {
    channel
        .basic_qos(prefetch_count, BasicQosOptions { global: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), prefetch_count, "error to configure qos");
            AmqpError::QoSDeclarationError(err.to_string())
        })
}

/// Passively checks an exchange.
///
/// A missing exchange closes `channel`; use a channel dedicated to probing.
pub async fn exchange_exists(channel: &Channel, name: &str) -> Result<bool, AmqpError> {
    let passive = ExchangeDeclareOptions {
        passive: true,
        ..ExchangeDeclareOptions::default()
    };

    let result = channel
        .exchange_declare(name, ExchangeKind::Direct.into(), passive, FieldTable::default())
        .await;

    existence(result.map(|_| ()), name)
}

/// Passively checks a queue. Same channel caveat as [`exchange_exists`].
pub async fn queue_exists(channel: &Channel, name: &str) -> Result<bool, AmqpError> {
    let passive = QueueDeclareOptions {
        passive: true,
        ..QueueDeclareOptions::default()
    };

    let result = channel.queue_declare(name, passive, FieldTable::default()).await;

    existence(result.map(|_| ()), name)
}

fn existence(result: Result<(), lapin::Error>, name: &str) -> Result<bool, AmqpError> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if is_not_found(&err) => {
            debug!(name, "passive check found nothing");
            Ok(false)
        }
        Err(err) => {
            error!(error = err.to_string(), name, "passive check failed");
            Err(AmqpError::TopologyCheckError(name.to_owned()))
        }
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;

    #[test]
    fn plans_dead_letter_wiring() {
        let settings = QueueConfiguration::new("test-que", "test-exc", "test-key");
        let plan = QueuePlan::new(&settings);

        let exchange = plan.exchange.as_ref().unwrap();
        assert_eq!(exchange.name, "test-exc");
        assert_eq!(exchange.kind, ExchangeKind::Direct);
        assert!(exchange.durable);

        assert_eq!(plan.queue.name, "test-que");
        assert!(plan.queue.durable);
        let dead_letter = plan.queue.dead_letter.as_ref().unwrap();
        assert_eq!(dead_letter.exchange, "dead-letter-exchange");
        assert_eq!(dead_letter.queue, "dead-letter-queue");

        let binding = plan.binding.as_ref().unwrap();
        assert_eq!(binding.exchange, "test-exc");
        assert_eq!(binding.routing_key, "test-key");
    }

    #[test]
    fn default_exchange_is_neither_declared_nor_bound() {
        let mut settings = QueueConfiguration::new("jobs", "", "");
        settings.with_dead_letter = false;
        let plan = QueuePlan::new(&settings);

        assert!(plan.exchange.is_none());
        assert!(plan.binding.is_none());
        assert!(plan.queue.dead_letter.is_none());
    }

    #[test]
    fn only_not_found_means_missing() {
        let not_found = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND),
            ShortString::from("NOT_FOUND - no queue 'jobs'"),
        ));
        assert_eq!(existence(Err(not_found), "jobs"), Ok(false));

        let refused = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            ShortString::from("ACCESS_REFUSED"),
        ));
        assert_eq!(
            existence(Err(refused), "jobs"),
            Err(AmqpError::TopologyCheckError("jobs".to_owned()))
        );

        assert_eq!(existence(Ok(()), "jobs"), Ok(true));
    }
}
