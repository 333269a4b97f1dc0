// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Persistent Queue Service
//!
//! A bus bound to one queue configuration. It owns two channels:
//!
//! - a producer channel in confirm mode, used by `publish`
//! - a consumer channel, with the queue's topology and prefetch applied,
//!   used by the consume loops
//!
//! Both are re-created on demand after a fault. The consume loops are
//! supervised: when the consumer channel is lost they open a fresh channel
//! and subscribe again, until the shutdown signal fires.

use crate::{
    bus::EventBus,
    channel::{close_channel, ChannelSlot},
    codec::{self, QueueMessage},
    config::QueueConfiguration,
    connection::ConnectionManager,
    consumer::{self, Acknowledger, BatchBuffer, Flow},
    errors::AmqpError,
    handler::{BatchMessageHandler, MessageHandler},
    publisher,
    shutdown::ShutdownSignal,
    topology,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::FieldTable,
    Channel, Consumer,
};
use std::{
    fmt::Display,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PRODUCER: &str = "producer";
const CONSUMER: &str = "consumer";

pub struct PersistentQueueService {
    connection: Arc<ConnectionManager>,
    settings: QueueConfiguration,
    producer: Arc<ChannelSlot>,
    consumer: Arc<ChannelSlot>,
    closed: AtomicBool,
}

impl PersistentQueueService {
    /// Opens the producer channel and, when the queue has consumers, the
    /// consumer channel with the queue's topology declared on it.
    pub async fn new(
        connection: Arc<ConnectionManager>,
        settings: QueueConfiguration,
    ) -> Result<PersistentQueueService, AmqpError> {
        let service = PersistentQueueService {
            connection,
            settings,
            producer: Arc::new(ChannelSlot::new(PRODUCER)),
            consumer: Arc::new(ChannelSlot::new(CONSUMER)),
            closed: AtomicBool::new(false),
        };

        service.producer_channel().await?;
        if service.settings.consumers_count > 0 {
            service.consumer_channel().await?;
        }

        info!(
            queue = service.settings.queue_name,
            exchange = service.settings.exchange_name,
            "queue service ready"
        );

        Ok(service)
    }

    pub fn settings(&self) -> &QueueConfiguration {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes both channels. Publishing and consuming fail with `BusClosed`
    /// afterwards.
    pub async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for slot in [&self.consumer, &self.producer] {
            if let Some(channel) = slot.close() {
                close_channel(&channel, slot.role()).await;
            }
        }

        info!(queue = self.settings.queue_name, "queue service disposed");
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::BusClosed);
        }
        Ok(())
    }

    async fn producer_channel(&self) -> Result<Channel, AmqpError> {
        self.ensure_open()?;
        self.connection.ensure_connected().await?;

        self.producer
            .get_or_open(move || {
                self.open_channel(&self.producer, move |channel| async move {
                    publisher::enable_confirms(&channel).await?;
                    topology::declare_exchange(&channel, &self.settings).await
                })
            })
            .await
    }

    async fn consumer_channel(&self) -> Result<Channel, AmqpError> {
        self.ensure_open()?;
        self.connection.ensure_connected().await?;

        self.consumer
            .get_or_open(move || {
                self.open_channel(&self.consumer, move |channel| async move {
                    topology::provision(&channel, &self.settings).await?;
                    topology::apply_qos(&channel, self.settings.prefetch_count).await
                })
            })
            .await
    }

    async fn open_channel<F, Fut>(&self, slot: &Arc<ChannelSlot>, prepare: F) -> Result<Channel, AmqpError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<(), AmqpError>>,
    {
        let channel = self.connection.create_channel().await?;

        if let Err(err) = prepare(channel.clone()).await {
            close_channel(&channel, slot.role()).await;
            return Err(err);
        }

        slot.watch(&channel);
        debug!(role = slot.role(), channel = channel.id(), "channel ready");
        Ok(channel)
    }

    async fn subscribe(&self) -> Result<(Channel, Consumer), AmqpError> {
        let channel = self.consumer_channel().await?;
        let consumer_tag = format!("{}-{}", self.settings.queue_name, Uuid::new_v4());

        let deliveries = channel
            .basic_consume(
                &self.settings.queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(self.settings.queue_name.clone())
            })?;

        info!(
            queue = self.settings.queue_name,
            consumer_tag, "consumer subscribed"
        );

        Ok((channel, deliveries))
    }

    /// Subscribes and feeds deliveries to `sink`, subscribing again on a
    /// fresh channel, after the recovery interval, whenever the current one
    /// is lost.
    async fn consume<S: DeliverySink>(&self, sink: &mut S, shutdown: &ShutdownSignal) -> Result<(), AmqpError> {
        while !shutdown.is_triggered() {
            let (channel, deliveries) = match self.subscribe().await {
                Ok(subscription) => subscription,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = self.settings.queue_name,
                        "failure to subscribe consumer"
                    );
                    self.dispose().await;
                    return Err(err);
                }
            };

            let acker = ChannelAcknowledger {
                connection: &self.connection,
                channel: channel.clone(),
            };
            let deliveries = deliveries.map(|next| next.map(Inbound::from));

            if drive(deliveries, sink, &acker, shutdown).await != Subscription::Lost {
                break;
            }

            self.consumer.fault(channel.id());
            close_channel(&channel, CONSUMER).await;

            let pause = self.connection.recovery_interval();
            warn!(
                queue = self.settings.queue_name,
                delay_secs = pause.as_secs(),
                "re-subscribing consumer"
            );
            tokio::select! {
                _ = shutdown.triggered() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(queue = self.settings.queue_name, "consumer stopped");
        self.dispose().await;
        Ok(())
    }
}

#[async_trait]
impl EventBus for PersistentQueueService {
    async fn publish<T: QueueMessage>(&self, message: &T) -> Result<(), AmqpError> {
        let channel = self.producer_channel().await?;
        let encoded = codec::encode(message)?;

        let result = publisher::publish(
            &channel,
            &self.settings.exchange_name,
            &self.settings.routing_key,
            &encoded,
        )
        .await;

        if result.is_err() {
            self.producer.fault(channel.id());
        }

        result
    }

    async fn process_queue<H>(&self, handler: Arc<H>, shutdown: ShutdownSignal) -> Result<(), AmqpError>
    where
        H: MessageHandler + 'static,
    {
        let mut sink = SingleSink {
            handler,
            shutdown: shutdown.clone(),
        };

        self.consume(&mut sink, &shutdown).await
    }

    async fn process_batch_queue<H>(
        &self,
        handler: Arc<H>,
        shutdown: ShutdownSignal,
    ) -> Result<(), AmqpError>
    where
        H: BatchMessageHandler + 'static,
    {
        let size = self.settings.batch_size();
        let mut sink = BatchSink {
            handler,
            shutdown: shutdown.clone(),
            buffer: BatchBuffer::new(size),
            size,
        };

        self.consume(&mut sink, &shutdown).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subscription {
    Shutdown,
    Cancelled,
    Lost,
}

/// The parts of a delivery the consume loops read.
struct Inbound {
    delivery_tag: u64,
    data: Vec<u8>,
    properties: AMQPProperties,
}

impl From<Delivery> for Inbound {
    fn from(delivery: Delivery) -> Self {
        Inbound {
            delivery_tag: delivery.delivery_tag,
            data: delivery.data,
            properties: delivery.properties,
        }
    }
}

/// Feeds one subscription's deliveries to `sink` until shutdown, handler
/// cancellation or the end of the stream, then settles what the sink holds.
async fn drive<St, E, S>(
    deliveries: St,
    sink: &mut S,
    acker: &dyn Acknowledger,
    shutdown: &ShutdownSignal,
) -> Subscription
where
    St: Stream<Item = Result<Inbound, E>> + Send,
    E: Display + Send,
    S: DeliverySink,
{
    futures_util::pin_mut!(deliveries);

    let outcome = loop {
        tokio::select! {
            _ = shutdown.triggered() => break Subscription::Shutdown,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    if sink.deliver(delivery, acker).await == Flow::Stop {
                        break Subscription::Cancelled;
                    }
                }
                Some(Err(err)) => {
                    warn!(error = err.to_string(), "consumer channel failed");
                    break Subscription::Lost;
                }
                None => {
                    warn!("consumer channel shutdown");
                    break Subscription::Lost;
                }
            },
        }
    };

    match outcome {
        Subscription::Shutdown | Subscription::Cancelled => sink.release(acker).await,
        Subscription::Lost => sink.reset(),
    }

    outcome
}

/// Settles deliveries on the consumer channel they arrived on.
struct ChannelAcknowledger<'a> {
    connection: &'a ConnectionManager,
    channel: Channel,
}

#[async_trait]
impl<'a> Acknowledger for ChannelAcknowledger<'a> {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.connection.ensure_connected().await?;
        debug!(delivery_tag, multiple, "mark as processed");

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.connection.ensure_connected().await?;
        debug!(delivery_tag, multiple, requeue, "mark as not processed");

        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// What a consume loop does with each delivery.
#[async_trait]
trait DeliverySink: Send {
    async fn deliver(&mut self, delivery: Inbound, acker: &dyn Acknowledger) -> Flow;

    /// The subscription ends for good.
    async fn release(&mut self, acker: &dyn Acknowledger);

    /// The subscription's channel was lost; its unsettled deliveries are
    /// already back on the queue.
    fn reset(&mut self);
}

struct SingleSink<H> {
    handler: Arc<H>,
    shutdown: ShutdownSignal,
}

#[async_trait]
impl<H> DeliverySink for SingleSink<H>
where
    H: MessageHandler + 'static,
{
    async fn deliver(&mut self, delivery: Inbound, acker: &dyn Acknowledger) -> Flow {
        consumer::handle_delivery(
            delivery.delivery_tag,
            &delivery.data,
            &delivery.properties,
            self.handler.as_ref(),
            &self.shutdown,
            acker,
        )
        .await
    }

    async fn release(&mut self, _: &dyn Acknowledger) {}

    fn reset(&mut self) {}
}

struct BatchSink<H: BatchMessageHandler> {
    handler: Arc<H>,
    shutdown: ShutdownSignal,
    buffer: BatchBuffer<H::Message>,
    size: usize,
}

#[async_trait]
impl<H> DeliverySink for BatchSink<H>
where
    H: BatchMessageHandler + 'static,
{
    async fn deliver(&mut self, delivery: Inbound, acker: &dyn Acknowledger) -> Flow {
        consumer::handle_batch_delivery(
            delivery.delivery_tag,
            &delivery.data,
            &delivery.properties,
            &mut self.buffer,
            self.handler.as_ref(),
            &self.shutdown,
            acker,
        )
        .await
    }

    async fn release(&mut self, acker: &dyn Acknowledger) {
        consumer::release_partial_batch(&mut self.buffer, acker).await;
    }

    fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                dropped = self.buffer.len(),
                "discarding partial batch of a lost channel"
            );
        }
        self.buffer = BatchBuffer::new(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::MessageHeader,
        config::ConnectionConfiguration,
        consumer::MockAcknowledger,
        handler::HandlerError,
        shutdown::shutdown_channel,
    };
    use futures_util::stream;
    use lapin::{types::ShortString, BasicProperties};
    use mockall::{predicate::eq, Sequence};
    use serde::{Deserialize, Serialize};
    use std::{sync::Mutex, time::Duration};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct JobId {
        #[serde(flatten)]
        header: MessageHeader,
        job_id: u64,
    }

    impl QueueMessage for JobId {
        const MESSAGE_TYPE: &'static str = "JobId";

        fn header(&self) -> &MessageHeader {
            &self.header
        }
    }

    fn job(job_id: u64) -> JobId {
        JobId {
            header: MessageHeader::new(),
            job_id,
        }
    }

    /// Accepts every job, except `cancel_at` which cancels the loop.
    struct Collector {
        cancel_at: Option<u64>,
        seen: Mutex<Vec<u64>>,
    }

    impl Collector {
        fn new(cancel_at: Option<u64>) -> Arc<Self> {
            Arc::new(Collector {
                cancel_at,
                seen: Mutex::new(vec![]),
            })
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }

        fn verdict(&self, job_id: u64) -> Result<bool, HandlerError> {
            if self.cancel_at == Some(job_id) {
                Err(HandlerError::Cancelled)
            } else {
                Ok(true)
            }
        }
    }

    #[async_trait]
    impl MessageHandler for Collector {
        type Message = JobId;

        async fn on_message(&self, message: &JobId, _: &ShutdownSignal) -> Result<bool, HandlerError> {
            self.seen.lock().unwrap().push(message.job_id);
            self.verdict(message.job_id)
        }

        fn on_error(&self, _: &HandlerError, _: &JobId) {}
    }

    #[async_trait]
    impl BatchMessageHandler for Collector {
        type Message = JobId;

        async fn on_batch(&self, messages: &[JobId], _: &ShutdownSignal) -> Result<bool, HandlerError> {
            let mut seen = self.seen.lock().unwrap();
            seen.extend(messages.iter().map(|m| m.job_id));
            Ok(true)
        }

        fn on_error(&self, _: &HandlerError, _: &[JobId]) {}
    }

    fn inbound(delivery_tag: u64) -> Inbound {
        let encoded = codec::encode(&job(delivery_tag)).unwrap();
        Inbound {
            delivery_tag,
            data: encoded.body,
            properties: BasicProperties::default().with_type(ShortString::from(encoded.message_type)),
        }
    }

    fn batch_sink(handler: Arc<Collector>, shutdown: &ShutdownSignal, size: usize) -> BatchSink<Collector> {
        BatchSink {
            handler,
            shutdown: shutdown.clone(),
            buffer: BatchBuffer::new(size),
            size,
        }
    }

    fn unreachable_broker() -> Arc<ConnectionManager> {
        ConnectionManager::new(ConnectionConfiguration {
            host: "127.0.0.1".to_owned(),
            port: 1,
            retry_connection_attempts: 0,
            ..ConnectionConfiguration::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn construction_fails_without_a_broker() {
        let service = PersistentQueueService::new(
            unreachable_broker(),
            QueueConfiguration::new("test-que", "test-exc", "test-key"),
        )
        .await;

        assert_eq!(service.err(), Some(AmqpError::ConnectionError));
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_a_connection_error() {
        let connection = unreachable_broker();
        let service = PersistentQueueService {
            connection: connection.clone(),
            settings: QueueConfiguration::new("test-que", "test-exc", "test-key"),
            producer: Arc::new(ChannelSlot::new(PRODUCER)),
            consumer: Arc::new(ChannelSlot::new(CONSUMER)),
            closed: AtomicBool::new(false),
        };

        assert_eq!(service.publish(&job(1)).await, Err(AmqpError::ConnectionError));
        assert!(!connection.is_connected());
        assert!(!service.is_closed());

        service.dispose().await;
        assert_eq!(service.publish(&job(2)).await, Err(AmqpError::BusClosed));
    }

    #[tokio::test]
    async fn failed_subscription_disposes_the_bus() {
        let service = PersistentQueueService {
            connection: unreachable_broker(),
            settings: QueueConfiguration::new("test-que", "test-exc", "test-key"),
            producer: Arc::new(ChannelSlot::new(PRODUCER)),
            consumer: Arc::new(ChannelSlot::new(CONSUMER)),
            closed: AtomicBool::new(false),
        };
        let (_trigger, signal) = shutdown_channel();

        let consumed = service.process_queue(Collector::new(None), signal).await;

        assert_eq!(consumed, Err(AmqpError::ConnectionError));
        assert!(service.is_closed());
        assert_eq!(service.publish(&job(1)).await, Err(AmqpError::BusClosed));
    }

    #[tokio::test]
    async fn ended_stream_is_a_lost_subscription() {
        let (_trigger, signal) = shutdown_channel();
        let handler = Collector::new(None);
        let mut sink = SingleSink {
            handler: handler.clone(),
            shutdown: signal.clone(),
        };

        let mut acker = MockAcknowledger::new();
        let mut seq = Sequence::new();
        for tag in 1..=2u64 {
            acker
                .expect_ack()
                .with(eq(tag), eq(false))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let deliveries = stream::iter(vec![Ok::<_, &str>(inbound(1)), Ok(inbound(2))]);
        let outcome = drive(deliveries, &mut sink, &acker, &signal).await;

        assert_eq!(outcome, Subscription::Lost);
        assert_eq!(handler.seen(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_channel_drops_the_partial_batch() {
        let (_trigger, signal) = shutdown_channel();
        let handler = Collector::new(None);
        let mut sink = batch_sink(handler.clone(), &signal, 3);

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker.expect_nack().never();

        let deliveries = stream::iter(vec![Ok(inbound(1)), Ok(inbound(2)), Err("channel closed")]);
        let outcome = drive(deliveries, &mut sink, &acker, &signal).await;

        assert_eq!(outcome, Subscription::Lost);
        assert!(sink.buffer.is_empty());
        assert!(handler.seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_requeues_the_partial_batch() {
        let (trigger, signal) = shutdown_channel();
        let handler = Collector::new(None);
        let mut sink = batch_sink(handler.clone(), &signal, 3);

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(2), eq(true), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let deliveries = stream::iter(vec![Ok::<_, &str>(inbound(1)), Ok(inbound(2))])
            .chain(stream::pending());

        let (outcome, ()) = tokio::join!(drive(deliveries, &mut sink, &acker, &signal), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        assert_eq!(outcome, Subscription::Shutdown);
        assert!(sink.buffer.is_empty());
        assert!(handler.seen().is_empty());
    }

    #[tokio::test]
    async fn cancelled_handler_ends_the_subscription() {
        let (_trigger, signal) = shutdown_channel();
        let handler = Collector::new(Some(2));
        let mut sink = SingleSink {
            handler: handler.clone(),
            shutdown: signal.clone(),
        };

        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .with(eq(1), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        acker.expect_nack().never();

        let deliveries = stream::iter(vec![Ok::<_, &str>(inbound(1)), Ok(inbound(2)), Ok(inbound(3))])
            .chain(stream::pending());
        let outcome = drive(deliveries, &mut sink, &acker, &signal).await;

        assert_eq!(outcome, Subscription::Cancelled);
        assert_eq!(handler.seen(), vec![1, 2]);
    }
}
