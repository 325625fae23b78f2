// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Object detection is treated as an opaque capability: a `Detector`
//! produces per-frame `Detection`s, and the worker loop filters them by
//! class and confidence before handing them to the tracker. No concrete
//! model runtime is bundled; callers inject whichever one they have
//! (ONNX Runtime, a remote inference service, ...) by implementing
//! `Detector`.

use crate::geometry::BBox;
use async_trait::async_trait;
use base::Error;

/// One object detected in a single frame, already in pixel coordinates.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: u32,
}

/// An object detector, called once per processed frame.
///
/// Implementations own whatever model/runtime state they need; `detect`
/// takes `&self` rather than `&mut self` so a detector can be shared
/// across concurrently running jobs (e.g. one loaded model serving many
/// cameras).
#[async_trait]
pub trait Detector: Send + Sync {
    /// Runs inference on one decoded RGB frame, returning all detections
    /// above whatever floor the detector itself applies internally.
    /// Class/confidence filtering against a job's configured target is
    /// the caller's responsibility, applied via [`filter_detections`].
    async fn detect(&self, frame: &crate::frame::Frame) -> Result<Vec<Detection>, Error>;
}

/// Keeps only detections matching `target_class` (when set) and at or
/// above `min_confidence`, per the worker loop's per-frame filter step.
pub fn filter_detections(
    detections: Vec<Detection>,
    target_class: Option<u32>,
    min_confidence: f32,
) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| target_class.is_none_or(|c| d.class_id == c))
        .filter(|d| d.confidence >= min_confidence)
        .collect()
}

/// A `Detector` that finds nothing. Serves as the binary's default when
/// no model runtime is configured, so a deployment can exercise
/// ingest/tracking/streaming end to end (counts stay at zero) before a
/// real detector is wired in.
pub struct NullDetector;

#[async_trait]
impl Detector for NullDetector {
    async fn detect(&self, _frame: &crate::frame::Frame) -> Result<Vec<Detection>, Error> {
        Ok(Vec::new())
    }
}

/// A test double returning a canned, deterministic sequence of
/// detections keyed by frame index. Frames past the end of the fixture
/// yield no detections, matching an idle scene rather than erroring.
pub struct FixtureDetector {
    by_frame: Vec<Vec<Detection>>,
}

impl FixtureDetector {
    pub fn new(by_frame: Vec<Vec<Detection>>) -> Self {
        FixtureDetector { by_frame }
    }
}

#[async_trait]
impl Detector for FixtureDetector {
    async fn detect(&self, frame: &crate::frame::Frame) -> Result<Vec<Detection>, Error> {
        Ok(self
            .by_frame
            .get(frame.index as usize)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, conf: f32) -> Detection {
        Detection {
            bbox: BBox::new(0, 0, 10, 10).unwrap(),
            confidence: conf,
            class_id,
        }
    }

    #[test]
    fn filter_keeps_matching_class_and_confidence() {
        let dets = vec![det(0, 0.9), det(1, 0.9), det(0, 0.1)];
        let kept = filter_detections(dets, Some(0), 0.3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].class_id, 0);
        assert!(kept[0].confidence >= 0.3);
    }

    #[test]
    fn filter_with_no_target_class_keeps_all_classes_above_threshold() {
        let dets = vec![det(0, 0.9), det(5, 0.5), det(2, 0.1)];
        let kept = filter_detections(dets, None, 0.4);
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn null_detector_finds_nothing() {
        let frame = crate::frame::Frame {
            index: 0,
            timestamp: jiff::Timestamp::from_second(0).unwrap(),
            width: 10,
            height: 10,
            rgb: vec![0; 300],
        };
        assert!(NullDetector.detect(&frame).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fixture_detector_replays_canned_frames() {
        let fixture = FixtureDetector::new(vec![vec![det(0, 0.9)], vec![]]);
        let frame0 = crate::frame::Frame {
            index: 0,
            timestamp: jiff::Timestamp::from_second(0).unwrap(),
            width: 10,
            height: 10,
            rgb: vec![0; 300],
        };
        let got = fixture.detect(&frame0).await.unwrap();
        assert_eq!(got.len(), 1);

        let frame1 = crate::frame::Frame {
            index: 1,
            ..frame0.clone()
        };
        let got = fixture.detect(&frame1).await.unwrap();
        assert!(got.is_empty());

        let frame_beyond = crate::frame::Frame {
            index: 99,
            ..frame0
        };
        let got = fixture.detect(&frame_beyond).await.unwrap();
        assert!(got.is_empty());
    }
}
