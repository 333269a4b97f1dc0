// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! This module owns the single broker connection shared by every bus in a
//! process. Callers never hold the connection itself: they ask the
//! [`ConnectionManager`] for channels, and the manager transparently
//! re-establishes the connection when it is lost.
//!
//! Reconnection has one entry point, [`ConnectionManager::try_connect`]. It
//! is called directly by buses that find the connection down, and by a
//! supervisor task that reacts to the error events the broker connection
//! raises.

use crate::{config::ConnectionConfiguration, errors::AmqpError, retry::RetryPolicy};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, Mutex},
};
use tracing::{debug, error, info, warn};

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disposed,
}

/// Connection event that schedules a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    /// The transport went away.
    Shutdown,
    /// The connection raised a protocol or state error.
    CallbackException,
}

impl RecoveryTrigger {
    fn classify(err: &lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(_) => RecoveryTrigger::Shutdown,
            _ => RecoveryTrigger::CallbackException,
        }
    }
}

/// Owns one resilient connection to the broker.
///
/// `try_connect` uses a check-lock-check sequence so concurrent callers
/// that all observe a lost connection produce a single reconnect.
pub struct ConnectionManager {
    cfg: ConnectionConfiguration,
    name: String,
    retry: RetryPolicy,
    connection: RwLock<Option<Arc<Connection>>>,
    sync_root: Mutex<()>,
    connecting: AtomicBool,
    disposed: AtomicBool,
    recovery: mpsc::UnboundedSender<RecoveryTrigger>,
}

impl ConnectionManager {
    /// Creates a disconnected manager and starts its recovery supervisor on
    /// the current Tokio runtime, where it runs for as long as the manager
    /// is alive.
    pub fn new(cfg: ConnectionConfiguration) -> Result<Arc<ConnectionManager>, AmqpError> {
        let runtime = Handle::try_current().map_err(|err| {
            error!(error = err.to_string(), "connection manager created outside a tokio runtime");
            AmqpError::InternalError
        })?;

        let (recovery, triggers) = mpsc::unbounded_channel();

        let manager = Arc::new(ConnectionManager {
            name: cfg.connection_name(),
            retry: RetryPolicy::exponential(cfg.retry_connection_attempts),
            cfg,
            connection: RwLock::new(None),
            sync_root: Mutex::new(()),
            connecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            recovery,
        });

        runtime.spawn(supervise(Arc::downgrade(&manager), triggers));

        Ok(manager)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_disposed()
            && self
                .current()
                .map(|conn| conn.status().connected())
                .unwrap_or(false)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Pause before a lost connection or subscription is re-established.
    pub fn recovery_interval(&self) -> Duration {
        self.cfg.recovery_interval()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_disposed() {
            ConnectionState::Disposed
        } else if self.is_connected() {
            ConnectionState::Connected
        } else if self.connecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Connects unless already connected.
    ///
    /// Returns false once the retry policy is exhausted or the manager has
    /// been disposed; callers must treat that as the broker being
    /// unavailable rather than retry on their own.
    pub async fn try_connect(&self) -> bool {
        info!("trying to connect to the broker");

        if self.is_connected() {
            return true;
        }

        let _guard = self.sync_root.lock().await;

        if self.is_disposed() {
            warn!("connection manager is disposed, not reconnecting");
            return false;
        }

        if self.is_connected() {
            debug!("reusing the connection opened by a concurrent caller");
            return true;
        }

        self.connecting.store(true, Ordering::SeqCst);
        let result = self.retry.run(|| self.open()).await;
        self.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(conn) => {
                self.watch(&conn);
                *self
                    .connection
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(conn));

                info!(
                    host = self.cfg.host,
                    vhost = self.cfg.virtual_host,
                    "connected to the broker and watching connection events"
                );
                true
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    attempts = self.retry.retries() + 1,
                    "FATAL ERROR: broker connection could not be created and opened"
                );
                false
            }
        }
    }

    /// Reconnects if needed, failing with `ConnectionError` when the broker
    /// stays unreachable.
    pub async fn ensure_connected(&self) -> Result<(), AmqpError> {
        if self.is_connected() || self.try_connect().await {
            Ok(())
        } else {
            Err(AmqpError::ConnectionError)
        }
    }

    /// Opens a channel on the live connection.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        let conn = match self.current() {
            Some(conn) if !self.is_disposed() && conn.status().connected() => conn,
            _ => {
                error!("unable to create a channel without a broker connection");
                return Err(AmqpError::ConnectionError);
            }
        };

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Closes the connection; the manager never reconnects afterwards.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(conn) = conn {
            if conn.status().connected() {
                if let Err(err) = conn.close(200, "connection disposed").await {
                    error!(error = err.to_string(), "failure to close the connection");
                }
            }
        }

        info!("broker connection disposed");
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn open(&self) -> Result<Connection, lapin::Error> {
        debug!(
            has_connection = self.current().is_some(),
            disposed = self.is_disposed(),
            "creating amqp connection..."
        );

        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(self.name.clone()));

        Connection::connect_uri(self.cfg.amqp_uri(), options).await
    }

    fn watch(&self, conn: &Connection) {
        let recovery = self.recovery.clone();

        conn.on_error(move |err| {
            let trigger = RecoveryTrigger::classify(&err);
            warn!(error = err.to_string(), ?trigger, "broker connection failed");
            let _ = recovery.send(trigger);
        });
    }
}

/// Turns connection events into reconnect attempts until the manager is
/// dropped or disposed.
async fn supervise(
    manager: Weak<ConnectionManager>,
    mut triggers: mpsc::UnboundedReceiver<RecoveryTrigger>,
) {
    while let Some(trigger) = triggers.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };

        if manager.is_disposed() {
            break;
        }

        warn!(?trigger, "broker connection lost, trying to re-connect...");
        tokio::time::sleep(manager.recovery_interval()).await;

        // one reconnect covers every event raised by the same failure
        while triggers.try_recv().is_ok() {}

        if manager.is_disposed() {
            break;
        }

        manager.try_connect().await;
    }

    debug!("connection supervisor stopped");
}
