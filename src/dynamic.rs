// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dynamic Queue Service
//!
//! A publish-only bus bound to a topology somebody else owns. Unless told to
//! create it, the bus refuses to start when the exchange or the queue is
//! missing, so a typo in a configuration surfaces at startup instead of as
//! silently dropped messages.

use crate::{
    bus::DynamicEventBus,
    channel::{close_channel, ChannelSlot},
    codec::{self, EncodedMessage, QueueMessage},
    config::DynamicQueueConfiguration,
    connection::ConnectionManager,
    errors::AmqpError,
    publisher, topology,
};
use async_trait::async_trait;
use lapin::Channel;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info};

const PRODUCER: &str = "producer";
const VERIFIER: &str = "verifier";

pub struct DynamicQueueService {
    connection: Arc<ConnectionManager>,
    settings: DynamicQueueConfiguration,
    producer: Arc<ChannelSlot>,
    closed: AtomicBool,
}

impl DynamicQueueService {
    /// Binds the bus to its topology, creating it when
    /// `create_if_not_exists` is set and verifying it otherwise.
    pub async fn new(
        connection: Arc<ConnectionManager>,
        settings: DynamicQueueConfiguration,
    ) -> Result<DynamicQueueService, AmqpError> {
        let service = DynamicQueueService {
            connection,
            settings,
            producer: Arc::new(ChannelSlot::new(PRODUCER)),
            closed: AtomicBool::new(false),
        };

        if let Err(err) = service.initialize().await {
            error!(
                error = err.to_string(),
                settings = ?service.settings,
                "failed to initialize queue configuration"
            );
            service.dispose().await;
            return Err(err);
        }

        info!(identity = %service.settings.identity(), "dynamic queue service ready");
        Ok(service)
    }

    pub async fn publish<T: QueueMessage>(&self, message: &T) -> Result<(), AmqpError> {
        let encoded = codec::encode(message)?;
        self.publish_encoded(&encoded).await
    }

    pub async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(channel) = self.producer.close() {
            close_channel(&channel, PRODUCER).await;
        }

        debug!(identity = %self.settings.identity(), "dynamic queue service disposed");
    }

    async fn initialize(&self) -> Result<(), AmqpError> {
        self.connection.ensure_connected().await?;

        if self.settings.create_if_not_exists {
            self.producer_channel().await?;
            return Ok(());
        }

        self.verify().await?;

        let channel = self.producer_channel().await?;
        topology::bind(&channel, &self.settings.queue).await
    }

    /// Passive checks run on a channel of their own: the broker closes a
    /// channel whose passive declaration finds nothing.
    async fn verify(&self) -> Result<(), AmqpError> {
        let verifier = self.connection.create_channel().await?;
        let result = self.check(&verifier).await;
        close_channel(&verifier, VERIFIER).await;
        result
    }

    async fn check(&self, verifier: &Channel) -> Result<(), AmqpError> {
        let queue = &self.settings.queue;

        if !queue.exchange_name.trim().is_empty()
            && !topology::exchange_exists(verifier, &queue.exchange_name).await?
        {
            return Err(AmqpError::ExchangeNotFound(queue.exchange_name.clone()));
        }

        if !queue.queue_name.trim().is_empty()
            && !topology::queue_exists(verifier, &queue.queue_name).await?
        {
            return Err(AmqpError::QueueNotFound(queue.queue_name.clone()));
        }

        Ok(())
    }

    async fn producer_channel(&self) -> Result<Channel, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::BusClosed);
        }
        self.connection.ensure_connected().await?;

        self.producer
            .get_or_open(move || async move {
                let channel = self.connection.create_channel().await?;

                if let Err(err) = self.prepare(&channel).await {
                    close_channel(&channel, PRODUCER).await;
                    return Err(err);
                }

                self.producer.watch(&channel);
                Ok(channel)
            })
            .await
    }

    async fn prepare(&self, channel: &Channel) -> Result<(), AmqpError> {
        publisher::enable_confirms(channel).await?;

        if self.settings.create_if_not_exists {
            topology::provision(channel, &self.settings.queue).await?;
            topology::apply_qos(channel, self.settings.queue.prefetch_count).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl DynamicEventBus for DynamicQueueService {
    fn settings(&self) -> &DynamicQueueConfiguration {
        &self.settings
    }

    async fn publish_encoded(&self, message: &EncodedMessage) -> Result<(), AmqpError> {
        let channel = self.producer_channel().await?;
        let queue = &self.settings.queue;

        let result =
            publisher::publish(&channel, &queue.exchange_name, &queue.routing_key, message).await;

        if result.is_err() {
            self.producer.fault(channel.id());
        }

        result
    }
}
