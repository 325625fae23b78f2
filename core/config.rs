// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The process-wide tunable envelope, layered CLI-over-file-over-default
//! per the binary's config loading order. Every field has a hard-coded
//! default so a bare `linewatch run` works with no config file at all.

use crate::crossing::CrossingConfig;
use crate::manager::ManagerConfig;
use crate::track::TrackerConfig;
use crate::worker::WorkerConfig;
use std::time::Duration;

/// Mirrors the on-disk JSON config file's shape; every field is
/// optional there; absent fields fall back to `Config::default()`'s
/// values via `Config::merge`.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FileConfig {
    pub max_concurrent_jobs: Option<usize>,
    pub rtsp_reconnect_attempts: Option<u32>,
    pub rtsp_reconnect_delay_s: Option<f64>,
    pub rtsp_fps_cap: Option<f64>,
    pub jpeg_quality: Option<u8>,
    pub track_iou_min: Option<f64>,
    pub track_miss_max: Option<u32>,
    pub track_history_len: Option<usize>,
    pub crossing_threshold_px: Option<f64>,
    pub min_det_conf: Option<f32>,
    pub job_retention_minutes: Option<u64>,
    pub control_queue_cap: Option<usize>,
    pub stop_grace_s: Option<f64>,
    pub bind_addr: Option<String>,
}

/// The resolved, fully-defaulted configuration a running process acts
/// on.
#[derive(Clone, Debug)]
pub struct Config {
    pub max_concurrent_jobs: usize,
    pub rtsp_reconnect_attempts: u32,
    pub rtsp_reconnect_delay: Duration,
    pub rtsp_fps_cap: Option<f64>,
    pub jpeg_quality: u8,
    pub track_iou_min: f64,
    pub track_miss_max: u32,
    pub track_history_len: usize,
    pub crossing_threshold_px: f64,
    pub min_det_conf: f32,
    pub job_retention: Duration,
    pub control_queue_cap: usize,
    pub stop_grace: Duration,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_concurrent_jobs: 4,
            rtsp_reconnect_attempts: 3,
            rtsp_reconnect_delay: Duration::from_secs(5),
            rtsp_fps_cap: None,
            jpeg_quality: crate::encode::DEFAULT_JPEG_QUALITY,
            track_iou_min: 0.3,
            track_miss_max: 30,
            track_history_len: 30,
            crossing_threshold_px: 5.0,
            min_det_conf: 0.3,
            job_retention: Duration::from_secs(30 * 60),
            control_queue_cap: 8,
            stop_grace: Duration::from_secs(10),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Config {
    /// Applies a (possibly sparse) file-sourced overlay on top of
    /// `self`, returning the merged result.
    pub fn merge(mut self, file: FileConfig) -> Self {
        if let Some(v) = file.max_concurrent_jobs {
            self.max_concurrent_jobs = v;
        }
        if let Some(v) = file.rtsp_reconnect_attempts {
            self.rtsp_reconnect_attempts = v;
        }
        if let Some(v) = file.rtsp_reconnect_delay_s {
            self.rtsp_reconnect_delay = Duration::from_secs_f64(v);
        }
        if let Some(v) = file.rtsp_fps_cap {
            self.rtsp_fps_cap = Some(v);
        }
        if let Some(v) = file.jpeg_quality {
            self.jpeg_quality = v;
        }
        if let Some(v) = file.track_iou_min {
            self.track_iou_min = v;
        }
        if let Some(v) = file.track_miss_max {
            self.track_miss_max = v;
        }
        if let Some(v) = file.track_history_len {
            self.track_history_len = v;
        }
        if let Some(v) = file.crossing_threshold_px {
            self.crossing_threshold_px = v;
        }
        if let Some(v) = file.min_det_conf {
            self.min_det_conf = v;
        }
        if let Some(v) = file.job_retention_minutes {
            self.job_retention = Duration::from_secs(v * 60);
        }
        if let Some(v) = file.control_queue_cap {
            self.control_queue_cap = v;
        }
        if let Some(v) = file.stop_grace_s {
            self.stop_grace = Duration::from_secs_f64(v);
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        self
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            iou_min: self.track_iou_min,
            min_det_conf: self.min_det_conf,
            k_miss: self.track_miss_max,
            history_len: self.track_history_len,
        }
    }

    pub fn crossing_config(&self) -> CrossingConfig {
        CrossingConfig {
            threshold_px: self.crossing_threshold_px,
            reversal_policy: crate::crossing::ReversalPolicy::AllowReversal,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            tracker: self.tracker_config(),
            crossing: self.crossing_config(),
            min_det_conf: self.min_det_conf,
            jpeg_quality: self.jpeg_quality,
            fps_cap: self.rtsp_fps_cap,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            control_queue_cap: self.control_queue_cap,
            job_retention: self.job_retention,
            stop_grace: self.stop_grace,
            worker: self.worker_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let c = Config::default();
        assert_eq!(c.max_concurrent_jobs, 4);
        assert_eq!(c.track_iou_min, 0.3);
        assert_eq!(c.crossing_threshold_px, 5.0);
    }

    #[test]
    fn merge_only_overrides_present_fields() {
        let file = FileConfig {
            jpeg_quality: Some(50),
            ..Default::default()
        };
        let c = Config::default().merge(file);
        assert_eq!(c.jpeg_quality, 50);
        assert_eq!(c.max_concurrent_jobs, 4); // untouched
    }

    #[test]
    fn derived_configs_carry_the_right_values() {
        let mut file = FileConfig::default();
        file.track_miss_max = Some(10);
        let c = Config::default().merge(file);
        assert_eq!(c.tracker_config().k_miss, 10);
    }
}
