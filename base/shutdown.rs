// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2021 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! This is a thin wrapper around `tokio::sync::watch` rather than the
//! hand-rolled waker-list broadcast this crate used before everything ran
//! on the tokio runtime: every task here is already a tokio task, so
//! `watch` gives the same "all receivers observe the one final value"
//! semantics `Sender::drop` used to provide, for a fraction of the code.

#[derive(Clone)]
pub struct Sender(tokio::sync::watch::Sender<bool>);

#[derive(Clone)]
pub struct Receiver(tokio::sync::watch::Receiver<bool>);

/// Creates a fresh shutdown channel. `false` means "keep running".
pub fn channel() -> (Sender, Receiver) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (Sender(tx), Receiver(rx))
}

impl Sender {
    /// Signals shutdown to every `Receiver` cloned from this channel.
    pub fn shutdown(&self) {
        // Ignore the error: it only happens if every receiver has already
        // been dropped, which means there's nothing left to signal.
        let _ = self.0.send(true);
    }
}

impl Receiver {
    /// Returns immediately: `true` if shutdown has already been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been signaled. Safe to call repeatedly
    /// and to drop without polling to completion.
    pub async fn shutdown(&mut self) {
        // `changed()` only errors if the sender was dropped without ever
        // sending `true`; callers that construct a channel and hold the
        // `Sender` until the process exits never observe that case. If it
        // does happen, returning immediately is the conservative choice:
        // nothing will signal us again.
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsignaled_receiver_does_not_resolve_shutdown_immediately() {
        let (_tx, rx) = channel();
        assert!(!rx.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_wakes_all_clones() {
        let (tx, rx) = channel();
        let mut rx2 = rx.clone();
        let mut rx3 = rx.clone();
        tx.shutdown();
        rx2.shutdown().await;
        rx3.shutdown().await;
        assert!(rx2.is_shutdown());
        assert!(rx3.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_delivered_to_receiver_created_before_signal() {
        let (tx, mut rx) = channel();
        let handle = tokio::spawn(async move {
            rx.shutdown().await;
            rx.is_shutdown()
        });
        tokio::task::yield_now().await;
        tx.shutdown();
        assert!(handle.await.unwrap());
    }
}
