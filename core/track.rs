// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! C2: `MultiObjectTracker`, a greedy IoU-based association of per-frame
//! detections into persistent track ids, with a short fixed-size
//! centroid history per track.

use crate::detect::Detection;
use crate::geometry::{BBox, Point};
use std::collections::VecDeque;

/// Opaque, monotonically increasing track identifier, unique within a job.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct TrackId(pub u64);

/// A persistent object identity tracked across frames.
#[derive(Clone, Debug)]
pub struct Track {
    pub id: TrackId,
    pub last_bbox: BBox,
    pub last_frame_seen: u64,
    pub class_id: u32,
    pub confidence: f32,
    /// Bounded by `history_len`; oldest centroid first.
    pub center_history: VecDeque<Point>,
    pub(crate) misses: u32,
}

impl Track {
    pub fn center(&self) -> Point {
        self.last_bbox.center()
    }
}

/// Tunables for `MultiObjectTracker`, mapping directly to the config
/// envelope's `track_iou_min` / `track_miss_max` / `track_history_len`.
#[derive(Copy, Clone, Debug)]
pub struct TrackerConfig {
    pub iou_min: f64,
    pub min_det_conf: f32,
    pub k_miss: u32,
    pub history_len: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            iou_min: 0.3,
            min_det_conf: 0.3,
            k_miss: 30,
            history_len: 30,
        }
    }
}

/// Greedy IoU tracker. One instance per job; `step` is called once per
/// processed frame with that frame's filtered detections.
pub struct MultiObjectTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl MultiObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        MultiObjectTracker {
            config,
            tracks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Drops all track state without affecting any external counters. Used
    /// on `SEEK` to avoid phantom crossings across a discontinuity.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    /// Associates `detections` (already filtered to `class == target_class`
    /// and `confidence >= det_conf`) against the current track set for
    /// `frame_index`, mutating `self.tracks` in place and returning the
    /// post-update track set.
    pub fn step(&mut self, frame_index: u64, detections: &[Detection]) -> &[Track] {
        let n_tracks = self.tracks.len();
        let n_dets = detections.len();

        // Build the |T|x|D| IoU matrix, keeping only pairs >= iou_min.
        let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
        for (ti, t) in self.tracks.iter().enumerate() {
            for (di, d) in detections.iter().enumerate() {
                let iou = t.last_bbox.iou(&d.bbox);
                if iou >= self.config.iou_min {
                    candidates.push((iou, ti, di));
                }
            }
        }
        // Sort descending by IoU; ties broken by lower detection index first
        // (spec's determinism requirement), then lower track index.
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap()
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut track_matched = vec![false; n_tracks];
        let mut det_matched = vec![false; n_dets];
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        for (_, ti, di) in candidates {
            if track_matched[ti] || det_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;
            pairs.push((ti, di));
        }

        for (ti, di) in pairs {
            let d = &detections[di];
            let t = &mut self.tracks[ti];
            t.last_bbox = d.bbox;
            t.last_frame_seen = frame_index;
            t.confidence = d.confidence;
            t.center_history.push_back(d.bbox.center());
            while t.center_history.len() > self.config.history_len {
                t.center_history.pop_front();
            }
            t.misses = 0;
        }

        // Unmatched detections: spawn new tracks for those meeting the
        // confidence floor (lower-confidence unmatched detections dropped).
        for (di, d) in detections.iter().enumerate() {
            if det_matched[di] {
                continue;
            }
            if d.confidence < self.config.min_det_conf {
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id += 1;
            let mut center_history = VecDeque::with_capacity(self.config.history_len);
            center_history.push_back(d.bbox.center());
            self.tracks.push(Track {
                id,
                last_bbox: d.bbox,
                last_frame_seen: frame_index,
                class_id: d.class_id,
                confidence: d.confidence,
                center_history,
                misses: 0,
            });
        }

        // Unmatched tracks age; destroy past k_miss.
        for (ti, matched) in track_matched.iter().enumerate() {
            if !matched {
                self.tracks[ti].misses += 1;
            }
        }
        self.tracks.retain(|t| t.misses <= self.config.k_miss);

        &self.tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: i32, y1: i32, x2: i32, y2: i32, conf: f32) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x2, y2).unwrap(),
            confidence: conf,
            class_id: 0,
        }
    }

    #[test]
    fn first_detection_spawns_a_track() {
        let mut tracker = MultiObjectTracker::new(TrackerConfig::default());
        let tracks = tracker.step(0, &[det(0, 0, 10, 10, 0.9)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, TrackId(0));
    }

    #[test]
    fn low_confidence_unmatched_detection_is_dropped() {
        let mut tracker = MultiObjectTracker::new(TrackerConfig::default());
        let tracks = tracker.step(0, &[det(0, 0, 10, 10, 0.1)]);
        assert!(tracks.is_empty());
    }

    #[test]
    fn matching_detection_updates_same_track_id() {
        let mut tracker = MultiObjectTracker::new(TrackerConfig::default());
        tracker.step(0, &[det(0, 0, 10, 10, 0.9)]);
        let tracks = tracker.step(1, &[det(1, 1, 11, 11, 0.9)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, TrackId(0));
        assert_eq!(tracks[0].center_history.len(), 2);
    }

    #[test]
    fn track_dies_after_k_miss_consecutive_misses() {
        let mut config = TrackerConfig::default();
        config.k_miss = 2;
        let mut tracker = MultiObjectTracker::new(config);
        tracker.step(0, &[det(0, 0, 10, 10, 0.9)]);
        tracker.step(1, &[]);
        tracker.step(2, &[]);
        assert_eq!(tracker.tracks().len(), 1);
        let tracks = tracker.step(3, &[]);
        assert!(tracks.is_empty());
    }

    #[test]
    fn ties_broken_by_lower_detection_index() {
        // Two detections equidistant (same IoU) from one track: the lower
        // detection index should win the match.
        let mut tracker = MultiObjectTracker::new(TrackerConfig::default());
        tracker.step(0, &[det(0, 0, 10, 10, 0.9)]);
        let tracks = tracker.step(
            1,
            &[det(0, 0, 10, 10, 0.9), det(0, 0, 10, 10, 0.9)],
        );
        // One match, one new track; the existing id keeps the first detection.
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id, TrackId(0));
        assert_eq!(tracks[0].last_bbox, det(0, 0, 10, 10, 0.9).bbox);
    }

    #[test]
    fn reset_clears_all_tracks() {
        let mut tracker = MultiObjectTracker::new(TrackerConfig::default());
        tracker.step(0, &[det(0, 0, 10, 10, 0.9)]);
        tracker.reset();
        assert!(tracker.tracks().is_empty());
    }
}
