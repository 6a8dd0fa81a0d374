/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

/// Notifications posted to the owner of a data connection. Delivery is
/// asynchronous and order-preserving; the engine never calls back into owner
/// code while holding its own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataConnEvent {
    /// the secondary connection reached the server (or was accepted)
    ConnectedToServer,
    /// the secondary connection is closed; query errors and results now
    ConnectionClosed,
    /// a filled flush buffer is ready to be collected via `give_flush_data`
    FlushDataReady,
    /// active mode: the listen endpoint to advertise via PORT/EPRT is known
    ListeningForConnection,
    /// upload: the engine wants the next buffer of file data
    PrepareData,
}

/// Owner-facing progress snapshot, published through a coalescing watch
/// channel whenever it changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStatus {
    /// logical bytes transferred so far (decompressed size under MODE Z)
    pub transferred: u64,
    /// total size if known, never less than `transferred`
    pub total: Option<u64>,
    /// the ASCII-mode-for-binary-file advisory fired
    pub ascii_problem: bool,
}

pub(crate) struct OwnerNotifier {
    tx: mpsc::UnboundedSender<DataConnEvent>,
    enabled: AtomicBool,
}

impl OwnerNotifier {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DataConnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = OwnerNotifier {
            tx,
            enabled: AtomicBool::new(true),
        };
        (notifier, rx)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Post one event. Safe to call while holding the connection lock: the
    /// channel is unbounded and the receiver runs in owner context.
    pub(crate) fn post(&self, event: DataConnEvent) {
        if self.enabled.load(Ordering::Relaxed) {
            // a dropped receiver only means the owner is gone
            let _ = self.tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn posts_in_order() {
        let (notifier, mut rx) = OwnerNotifier::new();
        notifier.post(DataConnEvent::ConnectedToServer);
        notifier.post(DataConnEvent::FlushDataReady);
        notifier.post(DataConnEvent::ConnectionClosed);
        assert_eq!(rx.recv().await, Some(DataConnEvent::ConnectedToServer));
        assert_eq!(rx.recv().await, Some(DataConnEvent::FlushDataReady));
        assert_eq!(rx.recv().await, Some(DataConnEvent::ConnectionClosed));
    }

    #[tokio::test]
    async fn disabled_notifier_drops_events() {
        let (notifier, mut rx) = OwnerNotifier::new();
        notifier.set_enabled(false);
        notifier.post(DataConnEvent::ConnectedToServer);
        notifier.set_enabled(true);
        notifier.post(DataConnEvent::ConnectionClosed);
        assert_eq!(rx.recv().await, Some(DataConnEvent::ConnectionClosed));
    }
}
