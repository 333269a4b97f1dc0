// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Registry of dynamic buses keyed by their queue identity.

use crate::{
    bus::DynamicEventBus,
    config::{DynamicQueueConfiguration, QueueIdentity},
    errors::AmqpError,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

/// Maps a queue configuration to the live bus serving it.
///
/// Two configurations naming the same queue, exchange and routing key
/// resolve to the same bus, whatever their other settings.
pub struct QueueServiceResolver {
    services: HashMap<QueueIdentity, Arc<dyn DynamicEventBus>>,
}

impl QueueServiceResolver {
    /// Indexes `services`, rejecting two buses with the same identity.
    pub fn new<I>(services: I) -> Result<QueueServiceResolver, AmqpError>
    where
        I: IntoIterator<Item = Arc<dyn DynamicEventBus>>,
    {
        let mut index = HashMap::new();

        for service in services {
            let identity = service.identity();
            if index.contains_key(&identity) {
                error!(%identity, "queue service registered more than once");
                return Err(AmqpError::DuplicateService(identity.to_string()));
            }

            debug!(%identity, "queue service registered");
            index.insert(identity, service);
        }

        Ok(QueueServiceResolver { services: index })
    }

    pub fn resolve(
        &self,
        settings: &DynamicQueueConfiguration,
    ) -> Result<Arc<dyn DynamicEventBus>, AmqpError> {
        let identity = settings.identity();

        self.services.get(&identity).cloned().ok_or_else(|| {
            error!(%identity, "no queue service registered");
            AmqpError::ServiceNotFound(identity.to_string())
        })
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Registered identities, sorted.
    pub fn identities(&self) -> Vec<&QueueIdentity> {
        let mut identities: Vec<_> = self.services.keys().collect();
        identities.sort();
        identities
    }
}
