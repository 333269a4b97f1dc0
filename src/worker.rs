// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Workers
//!
//! Runs the consume loops of a queue. Each logical consumer gets a dedicated
//! OS thread driving its own current-thread Tokio runtime, so a slow handler
//! only ever stalls its own deliveries. Every worker observes the same
//! shutdown signal and owns its own bus, hence its own channels.

use crate::{
    bus::EventBus,
    config::QueueConfiguration,
    connection::ConnectionManager,
    errors::AmqpError,
    handler::{BatchMessageHandler, MessageHandler},
    persistent::PersistentQueueService,
    shutdown::ShutdownSignal,
};
use std::{any::type_name, future::Future, sync::Arc, thread::JoinHandle};
use tracing::{error, info};

/// Handles of the threads running one queue's consumers.
pub struct ConsumerWorkers {
    handles: Vec<JoinHandle<Result<(), AmqpError>>>,
}

impl ConsumerWorkers {
    /// Starts `count` threads named `{name}-{index}`, each running `job` to
    /// completion on its own runtime.
    pub fn spawn<F, Fut>(
        name: &str,
        count: usize,
        shutdown: &ShutdownSignal,
        job: F,
    ) -> Result<ConsumerWorkers, AmqpError>
    where
        F: Fn(usize, ShutdownSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqpError>> + 'static,
    {
        let job = Arc::new(job);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let job = job.clone();
            let shutdown = shutdown.clone();

            let handle = std::thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|err| AmqpError::WorkerError(err.to_string()))?;

                    runtime.block_on(job(index, shutdown))
                })
                .map_err(|err| {
                    error!(error = err.to_string(), name, index, "failure to start consumer thread");
                    AmqpError::WorkerError(err.to_string())
                })?;

            handles.push(handle);
        }

        info!(name, count, "consumer workers started");
        Ok(ConsumerWorkers { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Blocks until every worker ends, returning the first failure.
    pub fn join(self) -> Result<(), AmqpError> {
        let mut outcome = Ok(());

        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("consumer").to_owned();

            let result = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(AmqpError::WorkerError(format!("{name} panicked"))),
            };

            if let Err(err) = result {
                error!(error = err.to_string(), worker = name, "consumer worker failed");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        outcome
    }
}

/// Runs a single-message consume loop until shutdown.
pub async fn run_consumer<B, H>(bus: &B, handler: Arc<H>, shutdown: ShutdownSignal) -> Result<(), AmqpError>
where
    B: EventBus,
    H: MessageHandler + 'static,
{
    let handler_name = type_name::<H>();
    info!(handler = handler_name, "consumer started");

    match bus.process_queue(handler, shutdown).await {
        Ok(()) => {
            info!(handler = handler_name, "consumer cancellation requested");
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), handler = handler_name, "error on consumer");
            Err(err)
        }
    }
}

/// Runs a batch consume loop until shutdown.
pub async fn run_batch_consumer<B, H>(
    bus: &B,
    handler: Arc<H>,
    shutdown: ShutdownSignal,
) -> Result<(), AmqpError>
where
    B: EventBus,
    H: BatchMessageHandler + 'static,
{
    let handler_name = type_name::<H>();
    info!(handler = handler_name, "batch consumer started");

    match bus.process_batch_queue(handler, shutdown).await {
        Ok(()) => {
            info!(handler = handler_name, "batch consumer cancellation requested");
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), handler = handler_name, "error on batch consumer");
            Err(err)
        }
    }
}

/// Starts `consumers_count` workers, each with its own bus, feeding
/// deliveries to `handler` one at a time.
pub fn spawn_queue_consumers<H>(
    connection: Arc<ConnectionManager>,
    settings: QueueConfiguration,
    handler: Arc<H>,
    shutdown: &ShutdownSignal,
) -> Result<ConsumerWorkers, AmqpError>
where
    H: MessageHandler + 'static,
{
    let name = settings.queue_name.clone();
    let count = settings.consumers_count;

    ConsumerWorkers::spawn(&name, count, shutdown, move |_, shutdown| {
        let connection = connection.clone();
        let settings = settings.clone();
        let handler = handler.clone();

        async move {
            let bus = PersistentQueueService::new(connection, settings).await?;
            run_consumer(&bus, handler, shutdown).await
        }
    })
}

/// Batch flavour of [`spawn_queue_consumers`].
pub fn spawn_batch_queue_consumers<H>(
    connection: Arc<ConnectionManager>,
    settings: QueueConfiguration,
    handler: Arc<H>,
    shutdown: &ShutdownSignal,
) -> Result<ConsumerWorkers, AmqpError>
where
    H: BatchMessageHandler + 'static,
{
    let name = settings.queue_name.clone();
    let count = settings.consumers_count;

    ConsumerWorkers::spawn(&name, count, shutdown, move |_, shutdown| {
        let connection = connection.clone();
        let settings = settings.clone();
        let handler = handler.clone();

        async move {
            let bus = PersistentQueueService::new(connection, settings).await?;
            run_batch_consumer(&bus, handler, shutdown).await
        }
    })
}
