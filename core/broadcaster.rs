// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! C3: `FrameBroadcaster`, a drop-to-newest fan-out of annotated JPEG
//! frames to zero or more MJPEG subscribers.
//!
//! Built on `tokio::sync::watch` rather than `tokio::sync::broadcast`:
//! `broadcast` queues a bounded history and returns `Lagged` to slow
//! subscribers, which is the wrong contract here — each subscriber wants
//! only the newest frame, never a backlog, and should never see an error
//! just for being slow to poll.

use crate::frame::EncodedFrame;
use tokio::sync::watch;

/// What `Subscription::next` returned.
#[derive(Debug)]
pub enum NextOutcome {
    Frame(EncodedFrame),
    /// The broadcaster was closed (the job ended) and no more frames
    /// will ever be published.
    Ended,
    /// The caller's cancellation future resolved before a new frame
    /// arrived.
    Canceled,
}

/// Tri-state payload of the underlying `watch` channel. `Option<EncodedFrame>`
/// alone can't distinguish "nothing published yet" from "closed": both would
/// otherwise decode to `None`, and a post-close `Subscribe` must yield `Ended`
/// immediately while a pre-first-frame `Subscribe` must block.
#[derive(Clone)]
enum Slot {
    Empty,
    Frame(EncodedFrame),
    Closed,
}

/// The publish side, owned by the job worker.
#[derive(Clone)]
pub struct FrameBroadcaster {
    tx: watch::Sender<Slot>,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot::Empty);
        FrameBroadcaster { tx }
    }

    /// Publishes a newly encoded frame, overwriting any not-yet-consumed
    /// frame. Never blocks.
    pub fn publish(&self, frame: EncodedFrame) {
        self.tx.send_replace(Slot::Frame(frame));
    }

    /// Returns a fresh subscription. Per spec, a subscriber that joins
    /// while a frame is already published sees that frame on its first
    /// `next()` rather than waiting for the one after it: `watch::Sender`'s
    /// own `subscribe()` marks the current value as already-seen, so we
    /// snapshot it here and hand it back out of band on the first call.
    pub fn subscribe(&self) -> Subscription {
        let rx = self.tx.subscribe();
        let initial = rx.borrow().clone();
        Subscription {
            rx,
            pending_initial: Some(initial),
        }
    }

    /// Marks the broadcaster closed; all outstanding and future
    /// `Subscription::next` calls resolve to `Ended`. Idempotent.
    pub fn close(&self) {
        self.tx.send_replace(Slot::Closed);
    }
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// The subscribe side. Cloning a `FrameBroadcaster` and resubscribing is
/// how multiple MJPEG clients observe the same job.
pub struct Subscription {
    rx: watch::Receiver<Slot>,
    /// The slot's value as of `subscribe()`, delivered on the first `next()`
    /// call before falling back to waiting on `changed()`.
    pending_initial: Option<Slot>,
}

impl Subscription {
    /// Waits for the next frame newer than the last one this
    /// subscription observed, resolving early to `Canceled` if `cancel`
    /// completes first (e.g. the client disconnected).
    pub async fn next(&mut self, cancel: impl std::future::Future<Output = ()>) -> NextOutcome {
        if let Some(slot) = self.pending_initial.take() {
            match slot {
                Slot::Frame(frame) => return NextOutcome::Frame(frame),
                Slot::Closed => return NextOutcome::Ended,
                Slot::Empty => {} // No frame published yet; fall through to wait.
            }
        }
        tokio::select! {
            biased;
            _ = cancel => NextOutcome::Canceled,
            changed = self.rx.changed() => {
                match changed {
                    Err(_) => NextOutcome::Ended,
                    Ok(()) => {
                        let guard = self.rx.borrow_and_update();
                        match &*guard {
                            Slot::Frame(frame) => NextOutcome::Frame(frame.clone()),
                            Slot::Closed => NextOutcome::Ended,
                            Slot::Empty => unreachable!("a publisher never re-sends Empty"),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    fn frame(index: u64) -> EncodedFrame {
        EncodedFrame {
            index,
            timestamp: jiff::Timestamp::from_second(index as i64).unwrap(),
            jpeg: bytes::Bytes::from_static(b"\xff\xd8\xff\xd9"),
        }
    }

    #[tokio::test]
    async fn subscriber_sees_frames_published_after_subscribe() {
        let b = FrameBroadcaster::new();
        let mut sub = b.subscribe();
        b.publish(frame(1));
        match sub.next(pending()).await {
            NextOutcome::Frame(f) => assert_eq!(f.index, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_only_sees_newest_frame() {
        let b = FrameBroadcaster::new();
        let mut sub = b.subscribe();
        b.publish(frame(1));
        b.publish(frame(2));
        b.publish(frame(3));
        match sub.next(pending()).await {
            NextOutcome::Frame(f) => assert_eq!(f.index, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_resolves_pending_subscribers_to_ended() {
        let b = FrameBroadcaster::new();
        let mut sub = b.subscribe();
        b.close();
        match sub.next(pending()).await {
            NextOutcome::Ended => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_future_wins_over_no_new_frame() {
        let b = FrameBroadcaster::new();
        let mut sub = b.subscribe();
        match sub.next(async {}).await {
            NextOutcome::Canceled => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_current_frame_immediately() {
        let b = FrameBroadcaster::new();
        b.publish(frame(7));
        let mut sub = b.subscribe();
        // No further publish: this must resolve from the snapshot taken at
        // subscribe time, not block waiting on a *new* change.
        match sub.next(pending()).await {
            NextOutcome::Frame(f) => assert_eq!(f.index, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribing_after_close_yields_ended_immediately() {
        let b = FrameBroadcaster::new();
        b.publish(frame(1));
        b.close();
        let mut sub = b.subscribe();
        match sub.next(pending()).await {
            NextOutcome::Ended => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_broadcaster_ends_subscription() {
        let b = FrameBroadcaster::new();
        let mut sub = b.subscribe();
        drop(b);
        match sub.next(pending()).await {
            NextOutcome::Ended => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
