// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! C1: `LineCrossingCounter`. Pure logic, no I/O: given each frame's
//! tracked boxes, decides which tracks crossed the configured virtual
//! line this frame and in which direction, honoring the at-most-once
//! and deferred-ambiguous-crossing rules from the spec.

use crate::geometry::{segments_strictly_intersect, Point};
use crate::track::{Track, TrackId};
use base::{err, Error};
use std::collections::{HashMap, HashSet};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Entry,
    Exit,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Entry => "entry",
            Direction::Exit => "exit",
        }
    }
}

/// Whether a track may emit both an ENTRY and an EXIT over its lifetime
/// (`ALLOW_REVERSAL`) or only its first crossing in either direction
/// (`FIRST_ONLY`). The spec leaves the default unspecified; see DESIGN.md.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReversalPolicy {
    AllowReversal,
    FirstOnly,
}

/// A line in percentage space, `(0,0)` top-left, `(100,100)` bottom-right.
/// Resolved to pixels per-frame using that frame's dimensions.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LineConfig {
    pub p1: (f64, f64),
    pub p2: (f64, f64),
}

impl LineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for (x, y) in [self.p1, self.p2] {
            if !(0.0..=100.0).contains(&x) || !(0.0..=100.0).contains(&y) {
                return Err(err!(
                    InvalidInput,
                    "line coordinates must be within [0,100], got ({x},{y})"
                ));
            }
        }
        Ok(())
    }

    /// Resolves the percentage-space line to pixel-space endpoints for a
    /// frame of the given dimensions.
    pub fn resolve(&self, width: u32, height: u32) -> (Point, Point) {
        let to_px = |(x, y): (f64, f64)| Point {
            x: x / 100.0 * f64::from(width),
            y: y / 100.0 * f64::from(height),
        };
        (to_px(self.p1), to_px(self.p2))
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CrossingEvent {
    pub track_id: TrackId,
    pub direction: Direction,
    pub frame_index: u64,
    pub timestamp: jiff::Timestamp,
    pub confidence: f32,
    pub bbox: crate::geometry::BBox,
}

/// A crossing whose post-crossing signed distance from the line fell within
/// `[-threshold, +threshold]`: the direction is ambiguous, so the event is
/// held and re-evaluated against the next frame's centroid instead of being
/// emitted or dropped outright.
struct PendingCrossing {
    frame_index: u64,
    bbox: crate::geometry::BBox,
}

#[derive(Copy, Clone, Debug)]
pub struct CrossingConfig {
    pub threshold_px: f64,
    pub reversal_policy: ReversalPolicy,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        CrossingConfig {
            threshold_px: 5.0,
            reversal_policy: ReversalPolicy::AllowReversal,
        }
    }
}

/// Holds cross-frame state for one job's virtual line: each track's last
/// seen centroid, the at-most-once-per-direction bookkeeping, and any
/// deferred (ambiguous) crossings awaiting re-evaluation.
pub struct LineCrossingCounter {
    config: CrossingConfig,
    last_center: HashMap<TrackId, Point>,
    already_counted: HashSet<(TrackId, Direction)>,
    pending: HashMap<TrackId, PendingCrossing>,
}

impl LineCrossingCounter {
    pub fn new(config: CrossingConfig) -> Self {
        LineCrossingCounter {
            config,
            last_center: HashMap::new(),
            already_counted: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    /// Drops per-track history (e.g. on a decoder `SEEK`). Counts already
    /// emitted are untouched; only the trajectory memory used to detect
    /// *future* crossings is cleared, per the spec's "crossings remain
    /// counted; tracks are reset" rule.
    pub fn reset_trajectories(&mut self) {
        self.last_center.clear();
        self.pending.clear();
    }

    /// Processes one frame's tracked boxes against the line, returning the
    /// crossing events emitted this frame (zero or more; a frame may
    /// resolve a previously deferred crossing as well as detect a new one,
    /// though never both for the same track in the same call).
    pub fn step(
        &mut self,
        frame_index: u64,
        timestamp: jiff::Timestamp,
        line: (Point, Point),
        tracks: &[Track],
    ) -> Result<Vec<CrossingEvent>, Error> {
        let mut events = Vec::new();
        let (l1, l2) = line;
        let dir_vec = l2.sub(l1);
        let len = dir_vec.dot(dir_vec).sqrt();
        let normal = if len > 0.0 {
            let n = dir_vec.rot90();
            Point {
                x: n.x / len,
                y: n.y / len,
            }
        } else {
            return Err(err!(InvalidInput, "line endpoints must be distinct"));
        };
        let mid = Point {
            x: (l1.x + l2.x) / 2.0,
            y: (l1.y + l2.y) / 2.0,
        };

        let mut seen = HashSet::new();
        for t in tracks {
            seen.insert(t.id);
            let c = t.center();
            if !c.is_finite() {
                return Err(err!(
                    InvalidInput,
                    "non-finite centroid for track {:?}",
                    t.id
                ));
            }

            // Resolve a previously deferred crossing using this frame's
            // centroid as the new post-crossing point.
            if let Some(pending) = self.pending.remove(&t.id) {
                match self.signed_direction(normal, mid, c) {
                    Some(dir) => {
                        self.try_emit(
                            t.id,
                            dir,
                            &mut events,
                            pending.frame_index,
                            timestamp,
                            pending.bbox,
                            t.confidence,
                        );
                    }
                    None => {
                        // Still ambiguous; keep deferring with the original
                        // pre-crossing point.
                        self.pending.insert(t.id, pending);
                    }
                }
                self.last_center.insert(t.id, c);
                continue;
            }

            if let Some(prev) = self.last_center.get(&t.id).copied() {
                if segments_strictly_intersect(prev, c, l1, l2) {
                    match self.signed_direction(normal, mid, c) {
                        Some(dir) => {
                            self.try_emit(t.id, dir, &mut events, frame_index, timestamp, t.last_bbox, t.confidence);
                        }
                        None => {
                            self.pending.insert(
                                t.id,
                                PendingCrossing {
                                    frame_index,
                                    bbox: t.last_bbox,
                                },
                            );
                        }
                    }
                }
            }
            self.last_center.insert(t.id, c);
        }

        // Drop trajectory memory for tracks that no longer exist.
        self.last_center.retain(|id, _| seen.contains(id));
        self.pending.retain(|id, _| seen.contains(id));

        Ok(events)
    }

    fn signed_direction(&self, normal: Point, mid: Point, c: Point) -> Option<Direction> {
        let signed = normal.dot(c.sub(mid));
        if signed < -self.config.threshold_px {
            Some(Direction::Entry)
        } else if signed > self.config.threshold_px {
            Some(Direction::Exit)
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_emit(
        &mut self,
        track_id: TrackId,
        direction: Direction,
        events: &mut Vec<CrossingEvent>,
        frame_index: u64,
        timestamp: jiff::Timestamp,
        bbox: crate::geometry::BBox,
        confidence: f32,
    ) -> bool {
        let key = (track_id, direction);
        let suppressed = match self.config.reversal_policy {
            ReversalPolicy::AllowReversal => self.already_counted.contains(&key),
            ReversalPolicy::FirstOnly => self
                .already_counted
                .iter()
                .any(|(id, _)| *id == track_id),
        };
        if suppressed {
            return false;
        }
        self.already_counted.insert(key);
        events.push(CrossingEvent {
            track_id,
            direction,
            frame_index,
            timestamp,
            confidence,
            bbox,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::track::TrackId;
    use std::collections::VecDeque;

    fn track_at(id: u64, cx: f64, cy: f64) -> Track {
        let half = 5;
        let x1 = (cx as i32) - half;
        let y1 = (cy as i32) - half;
        Track {
            id: TrackId(id),
            last_bbox: BBox::new(x1, y1, x1 + 2 * half, y1 + 2 * half).unwrap(),
            last_frame_seen: 0,
            class_id: 0,
            confidence: 0.9,
            center_history: VecDeque::new(),
            misses: 0,
        }
    }

    fn ts(n: i64) -> jiff::Timestamp {
        jiff::Timestamp::from_second(n).unwrap()
    }

    fn vline(x_pct: f64) -> LineConfig {
        LineConfig {
            p1: (x_pct, 0.0),
            p2: (x_pct, 100.0),
        }
    }

    #[test]
    fn single_crossing_emits_one_entry() {
        let mut counter = LineCrossingCounter::new(CrossingConfig::default());
        let line = vline(60.0).resolve(100, 100);
        counter.step(0, ts(0), line, &[track_at(1, 40.0, 50.0)]).unwrap();
        counter.step(1, ts(1), line, &[track_at(1, 55.0, 50.0)]).unwrap();
        let events = counter
            .step(2, ts(2), line, &[track_at(1, 70.0, 50.0)])
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::Entry);
        assert_eq!(events[0].track_id, TrackId(1));
    }

    #[test]
    fn tangent_endpoint_on_line_does_not_count() {
        let mut counter = LineCrossingCounter::new(CrossingConfig::default());
        let line = vline(60.0).resolve(100, 100);
        counter.step(0, ts(0), line, &[track_at(1, 40.0, 50.0)]).unwrap();
        let events = counter
            .step(1, ts(1), line, &[track_at(1, 60.0, 50.0)])
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn single_frame_track_never_moves_so_never_counts() {
        let mut counter = LineCrossingCounter::new(CrossingConfig::default());
        let line = vline(60.0).resolve(100, 100);
        let events = counter
            .step(0, ts(0), line, &[track_at(1, 40.0, 50.0)])
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn first_only_suppresses_second_same_direction_crossing() {
        let mut config = CrossingConfig::default();
        config.reversal_policy = ReversalPolicy::FirstOnly;
        let mut counter = LineCrossingCounter::new(config);
        let line = vline(60.0).resolve(100, 100);
        counter.step(0, ts(0), line, &[track_at(1, 40.0, 50.0)]).unwrap();
        let first = counter
            .step(1, ts(1), line, &[track_at(1, 70.0, 50.0)])
            .unwrap();
        assert_eq!(first.len(), 1);
        // Cross back out then back in again: FIRST_ONLY forbids any further count.
        counter.step(2, ts(2), line, &[track_at(1, 40.0, 50.0)]).unwrap();
        let second = counter
            .step(3, ts(3), line, &[track_at(1, 70.0, 50.0)])
            .unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn allow_reversal_permits_one_entry_and_one_exit() {
        let mut config = CrossingConfig::default();
        config.reversal_policy = ReversalPolicy::AllowReversal;
        let mut counter = LineCrossingCounter::new(config);
        let line = vline(60.0).resolve(100, 100);
        counter.step(0, ts(0), line, &[track_at(1, 40.0, 50.0)]).unwrap();
        let entry = counter
            .step(1, ts(1), line, &[track_at(1, 70.0, 50.0)])
            .unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry[0].direction, Direction::Entry);
        let exit = counter
            .step(2, ts(2), line, &[track_at(1, 40.0, 50.0)])
            .unwrap();
        assert_eq!(exit.len(), 1);
        assert_eq!(exit[0].direction, Direction::Exit);
    }

    #[test]
    fn ambiguous_crossing_within_threshold_is_deferred_not_dropped() {
        let mut config = CrossingConfig::default();
        config.threshold_px = 5.0;
        let mut counter = LineCrossingCounter::new(config);
        let line = vline(50.0).resolve(100, 100);
        counter.step(0, ts(0), line, &[track_at(1, 40.0, 50.0)]).unwrap();
        // Lands exactly at x=51: within +-5px threshold of the line (mid=50), deferred.
        let deferred = counter
            .step(1, ts(1), line, &[track_at(1, 51.0, 50.0)])
            .unwrap();
        assert!(deferred.is_empty());
        // Next frame clears the threshold decisively; the held crossing resolves.
        let resolved = counter
            .step(2, ts(2), line, &[track_at(1, 70.0, 50.0)])
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].direction, Direction::Entry);
    }

    #[test]
    fn non_finite_point_is_not_finite() {
        // BBox coordinates are always finite integers, so a non-finite
        // centroid can only arise from a non-finite line resolution (e.g.
        // a frame of width/height 0 divided into a percentage). Exercise
        // the guard directly on `Point::is_finite`.
        assert!(!(Point { x: f64::NAN, y: 0.0 }.is_finite()));
        assert!(Point { x: 1.0, y: 2.0 }.is_finite());
    }
}
