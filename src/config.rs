// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Configuration
//!
//! Configuration records for the broker connection and for the queues a bus
//! publishes to or consumes from. Records are plain `serde` types so they can
//! be bound from any key-value source; [`from_env`] binds them from
//! environment variables.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "dead-letter-exchange";
const DEFAULT_DEAD_LETTER_QUEUE: &str = "dead-letter-queue";
const UNNAMED_CONNECTION: &str = "connection name not provided";

/// Binds a configuration record from environment variables.
///
/// Keys are the record's field names behind `{prefix}_`, e.g. with the
/// `RABBITMQ` prefix `RABBITMQ_HOST` feeds `host` and `RABBITMQ_VIRTUAL_HOST`
/// feeds `virtual_host`. Missing keys fall back to the record defaults.
pub fn from_env<T>(prefix: &str) -> Result<T, AmqpError>
where
    T: DeserializeOwned,
{
    config::Config::builder()
        .add_source(config::Environment::with_prefix(prefix).try_parsing(true))
        .build()
        .and_then(|cfg| cfg.try_deserialize::<T>())
        .map_err(|err| AmqpError::ConfigurationError(err.to_string()))
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfiguration {
    pub host: String,
    pub virtual_host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Heartbeat interval negotiated with the broker, in seconds.
    pub heartbeat: u16,
    /// Delay before a lost connection is re-established, in seconds.
    pub recovery_interval: u64,
    /// Retries after the first failed connection attempt.
    pub retry_connection_attempts: u32,
    pub client_provided_name: Option<String>,
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        ConnectionConfiguration {
            host: "localhost".to_owned(),
            virtual_host: "/".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            heartbeat: 60,
            recovery_interval: 10,
            retry_connection_attempts: 5,
            client_provided_name: None,
        }
    }
}

impl ConnectionConfiguration {
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat),
                ..AMQPQueryString::default()
            },
            ..AMQPUri::default()
        }
    }

    /// Name announced to the broker, unique per connection manager.
    pub fn connection_name(&self) -> String {
        match self.client_provided_name.as_deref() {
            Some(name) if !name.is_empty() => format!("{}-{}", name, Uuid::new_v4()),
            _ => UNNAMED_CONNECTION.to_owned(),
        }
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval)
    }
}

/// Settings of one logical queue: where it is published, how it is consumed
/// and where rejected messages go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfiguration {
    pub consumers_count: usize,
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub exchange_type: ExchangeKind,
    /// Channel prefetch, and the batch size of batched consumption.
    pub prefetch_count: u16,
    pub with_dead_letter: bool,
    pub dead_letter_exchange_name: String,
    pub dead_letter_queue_name: String,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        QueueConfiguration {
            consumers_count: 1,
            queue_name: String::new(),
            exchange_name: String::new(),
            routing_key: String::new(),
            exchange_type: ExchangeKind::Direct,
            prefetch_count: 1,
            with_dead_letter: true,
            dead_letter_exchange_name: DEFAULT_DEAD_LETTER_EXCHANGE.to_owned(),
            dead_letter_queue_name: DEFAULT_DEAD_LETTER_QUEUE.to_owned(),
        }
    }
}

impl QueueConfiguration {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        QueueConfiguration {
            queue_name: queue.to_owned(),
            exchange_name: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            ..QueueConfiguration::default()
        }
    }

    /// Number of deliveries handed to a batch handler at once.
    pub fn batch_size(&self) -> usize {
        usize::from(self.prefetch_count.max(1))
    }

    pub fn identity(&self) -> QueueIdentity {
        QueueIdentity {
            queue: self.queue_name.clone(),
            exchange: self.exchange_name.clone(),
            routing_key: self.routing_key.clone(),
        }
    }
}

/// Queue settings of a publish-only bus bound to an existing topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicQueueConfiguration {
    #[serde(flatten)]
    pub queue: QueueConfiguration,
    /// Declare the topology instead of requiring it to exist.
    pub create_if_not_exists: bool,
}

impl DynamicQueueConfiguration {
    pub fn new(queue: QueueConfiguration) -> Self {
        DynamicQueueConfiguration {
            queue,
            create_if_not_exists: false,
        }
    }

    pub fn create_if_not_exists(mut self) -> Self {
        self.create_if_not_exists = true;
        self
    }

    /// Registry key: only the queue, exchange and routing key take part.
    pub fn identity(&self) -> QueueIdentity {
        self.queue.identity()
    }
}

/// Composite key naming one logical bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueIdentity {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue={} exchange={} routing_key={}",
            self.queue, self.exchange, self.routing_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults_follow_conventions() {
        let cfg = QueueConfiguration::default();
        assert_eq!(cfg.consumers_count, 1);
        assert_eq!(cfg.routing_key, "");
        assert_eq!(cfg.prefetch_count, 1);
        assert!(cfg.with_dead_letter);
        assert_eq!(cfg.dead_letter_exchange_name, "dead-letter-exchange");
        assert_eq!(cfg.dead_letter_queue_name, "dead-letter-queue");
    }

    #[test]
    fn batch_size_never_drops_below_one() {
        let mut cfg = QueueConfiguration::new("q", "e", "k");
        cfg.prefetch_count = 0;
        assert_eq!(cfg.batch_size(), 1);
        cfg.prefetch_count = 25;
        assert_eq!(cfg.batch_size(), 25);
    }

    #[test]
    fn identity_ignores_non_identity_fields() {
        let mut first = QueueConfiguration::new("test-que", "test-exc", "test-key");
        first.prefetch_count = 10;
        let second = DynamicQueueConfiguration::new(QueueConfiguration::new(
            "test-que", "test-exc", "test-key",
        ))
        .create_if_not_exists();

        assert_eq!(first.identity(), second.identity());
        assert_ne!(
            first.identity(),
            QueueConfiguration::new("test-que", "test-exc", "other-key").identity()
        );
    }

    #[test]
    fn connection_name_is_unique_per_call() {
        let cfg = ConnectionConfiguration {
            client_provided_name: Some("billing".to_owned()),
            ..ConnectionConfiguration::default()
        };
        let first = cfg.connection_name();
        assert!(first.starts_with("billing-"));
        assert_ne!(first, cfg.connection_name());

        assert_eq!(
            ConnectionConfiguration::default().connection_name(),
            "connection name not provided"
        );
    }

    #[test]
    fn builds_uri_from_settings() {
        let cfg = ConnectionConfiguration {
            host: "broker.internal".to_owned(),
            virtual_host: "orders".to_owned(),
            port: 5673,
            heartbeat: 30,
            ..ConnectionConfiguration::default()
        };
        let uri = cfg.amqp_uri();
        assert_eq!(uri.authority.host, "broker.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.vhost, "orders");
        assert_eq!(uri.query.heartbeat, Some(30));
    }

    #[test]
    fn binds_queue_settings_from_environment() {
        std::env::set_var("AMQPBUSTESTQ_QUEUE_NAME", "test-que");
        std::env::set_var("AMQPBUSTESTQ_EXCHANGE_NAME", "test-exc");
        std::env::set_var("AMQPBUSTESTQ_EXCHANGE_TYPE", "fanout");
        std::env::set_var("AMQPBUSTESTQ_PREFETCH_COUNT", "4");

        let cfg: QueueConfiguration = from_env("AMQPBUSTESTQ").unwrap();
        assert_eq!(cfg.queue_name, "test-que");
        assert_eq!(cfg.exchange_name, "test-exc");
        assert_eq!(cfg.exchange_type, ExchangeKind::Fanout);
        assert_eq!(cfg.prefetch_count, 4);
        assert!(cfg.with_dead_letter);
    }
}
