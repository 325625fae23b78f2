// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2018 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Time-dependent logic (fps pacing, EWMA, RTSP reconnect backoff, job
//! retention expiry) is written against this trait rather than calling
//! `tokio::time::sleep`/`Instant::now` directly, so it can be driven
//! deterministically by `tokio::time::pause`/`advance` in tests without
//! real wall-clock delay.

use std::future::Future;
use std::time::Duration;

/// Abstracts wall-clock time and sleeping for async workers.
///
/// `RealClocks` is a thin pass-through to `std`/`tokio::time`.
/// `SimulatedClocks` is used in tests together with
/// `#[tokio::test(start_paused = true)]`: it reads the same paused tokio
/// clock, so advancing it with `tokio::time::advance` moves every
/// `Clocks::sleep` call forward without actually waiting.
pub trait Clocks: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> jiff::Timestamp;

    /// Sleeps for the given duration.
    fn sleep(&self, how_long: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn now(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    async fn sleep(&self, how_long: Duration) {
        tokio::time::sleep(how_long).await;
    }
}

/// A clock for tests that reads wall-clock time from a caller-controlled
/// offset but sleeps on the real (test-paused) tokio timer, so
/// `tokio::time::advance` in a `#[tokio::test(start_paused = true)]` moves
/// both `now()` and any outstanding `sleep()` forward together.
#[derive(Clone)]
pub struct SimulatedClocks {
    /// Simulated time at the moment this clock was constructed.
    start: jiff::Timestamp,
    /// The (paused) tokio instant at construction time; `now()` adds the
    /// tokio clock's elapsed time since then to `start`.
    epoch: tokio::time::Instant,
}

impl SimulatedClocks {
    pub fn new(start: jiff::Timestamp) -> Self {
        SimulatedClocks {
            start,
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> jiff::Timestamp {
        let elapsed: Duration = tokio::time::Instant::now() - self.epoch;
        self.start + elapsed
    }

    async fn sleep(&self, how_long: Duration) {
        tokio::time::sleep(how_long).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn simulated_clock_advances_with_tokio_time() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let t0 = clocks.now();
        tokio::time::advance(Duration::from_secs(5)).await;
        let t1 = clocks.now();
        assert_eq!((t1 - t0).get_seconds(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_after_advance() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let fut = clocks.sleep(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(10)).await;
        fut.await;
    }
}
