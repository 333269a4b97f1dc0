// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Cooperative shutdown shared by every consume loop.

use tokio::sync::watch;

/// Creates a connected trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}

/// Requests shutdown; dropping it requests shutdown as well.
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Observes a [`ShutdownTrigger`]. Cheap to clone, one per loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Completes once shutdown is requested.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        // an error means the trigger is gone, which is a shutdown too
        let _ = receiver.wait_for(|stop| *stop).await;
    }
}
