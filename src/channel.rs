// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Ownership
//!
//! Every bus owns its channels through a [`ChannelSlot`]: one slot per role
//! (producer or consumer). A slot moves through
//! `Uninitialized -> Open -> (Faulted -> Open)* -> Closed`. Faulted channels
//! are never repaired; the next caller opens a replacement.
//!
//! Broker callbacks only ever mark a slot faulted. Replacing the channel is
//! done by the caller that needs it, serialized by the slot's recreation
//! lock, so a callback can't race an in-flight recreation.

use crate::errors::AmqpError;
use lapin::Channel;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, warn};

/// The part of a broker channel a slot needs to see.
pub trait LiveChannel: Clone + Send + Sync + 'static {
    fn channel_id(&self) -> u16;

    fn is_live(&self) -> bool;
}

impl LiveChannel for Channel {
    fn channel_id(&self) -> u16 {
        self.id()
    }

    fn is_live(&self) -> bool {
        self.status().connected()
    }
}

/// Observable state of a [`ChannelSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Uninitialized,
    Open,
    Faulted,
    Closed,
}

enum Slot<C> {
    Uninitialized,
    Open(C),
    Faulted,
    Closed,
}

/// Single-owner holder of one role's channel.
pub struct ChannelSlot<C = Channel> {
    role: &'static str,
    slot: Mutex<Slot<C>>,
    recreate: tokio::sync::Mutex<()>,
}

impl<C: LiveChannel> ChannelSlot<C> {
    pub fn new(role: &'static str) -> Self {
        ChannelSlot {
            role,
            slot: Mutex::new(Slot::Uninitialized),
            recreate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// An open channel the broker has since closed reports `Faulted`.
    pub fn state(&self) -> SlotState {
        match &*self.lock() {
            Slot::Uninitialized => SlotState::Uninitialized,
            Slot::Open(channel) if channel.is_live() => SlotState::Open,
            Slot::Open(_) | Slot::Faulted => SlotState::Faulted,
            Slot::Closed => SlotState::Closed,
        }
    }

    /// The current channel, if it is open and live.
    pub fn current(&self) -> Option<C> {
        match &*self.lock() {
            Slot::Open(channel) if channel.is_live() => Some(channel.clone()),
            _ => None,
        }
    }

    /// Stores a freshly opened channel, replacing whatever was held.
    pub fn install(&self, channel: C) -> Result<(), AmqpError> {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Closed) {
            return Err(AmqpError::BusClosed);
        }

        debug!(role = self.role, channel = channel.channel_id(), "channel installed");
        *slot = Slot::Open(channel);
        Ok(())
    }

    /// Marks the slot faulted if it still holds the channel with `id`.
    ///
    /// Events from a channel that was already replaced are ignored.
    pub fn fault(&self, id: u16) -> bool {
        let mut slot = self.lock();
        match &*slot {
            Slot::Open(channel) if channel.channel_id() == id => {
                *slot = Slot::Faulted;
                true
            }
            _ => false,
        }
    }

    /// Moves the slot to `Closed` for good and hands back the channel it held.
    pub fn close(&self) -> Option<C> {
        match std::mem::replace(&mut *self.lock(), Slot::Closed) {
            Slot::Open(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), Slot::Closed)
    }

    /// Returns the live channel, opening a replacement when there is none.
    ///
    /// Concurrent callers wait on the recreation lock and share the channel
    /// opened by the first of them.
    pub async fn get_or_open<F, Fut>(&self, open: F) -> Result<C, AmqpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, AmqpError>>,
    {
        if let Some(channel) = self.current() {
            return Ok(channel);
        }

        let _guard = self.recreate.lock().await;

        if self.is_closed() {
            return Err(AmqpError::BusClosed);
        }

        if let Some(channel) = self.current() {
            return Ok(channel);
        }

        if self.state() == SlotState::Faulted {
            warn!(role = self.role, "channel faulted, opening a new one");
        }

        let channel = open().await?;
        self.install(channel.clone())?;
        Ok(channel)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<C>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChannelSlot<Channel> {
    /// Faults this slot when the broker reports an error on `channel`.
    pub fn watch(self: &Arc<Self>, channel: &Channel) {
        let slot = Arc::downgrade(self);
        let id = channel.id();

        channel.on_error(move |err| {
            if let Some(slot) = slot.upgrade() {
                if slot.fault(id) {
                    warn!(
                        error = err.to_string(),
                        role = slot.role,
                        channel = id,
                        "channel shutdown, it will be recreated on next use"
                    );
                }
            }
        });
    }
}

/// Closes a channel the caller no longer needs, if the broker still has it.
pub async fn close_channel(channel: &Channel, role: &str) {
    if !channel.status().connected() {
        return;
    }

    if let Err(err) = channel.close(200, "channel disposed").await {
        error!(error = err.to_string(), role, "failure to close the channel");
    }
}
