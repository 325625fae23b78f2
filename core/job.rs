// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Job-level types shared by `JobWorker` and `JobManager`: identifiers,
//! the submitted job description, the phase state machine, and the
//! control-channel protocol used to pause/resume/stop/seek a running
//! job.

use crate::crossing::{LineConfig, ReversalPolicy};
use crate::frame::StreamProperties;
use base::{err, Error};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(uuid::Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        uuid::Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| Error::wrap(base::ErrorKind::InvalidInput, format!("invalid job id {s:?}"), e))
    }
}

/// What kind of source a job was submitted against.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum JobKind {
    FileVideo {
        path: std::path::PathBuf,
        /// Where to write the annotated output, if the caller wants one
        /// back; `None` skips encoding a copy entirely.
        #[serde(default)]
        output_path: Option<std::path::PathBuf>,
        #[serde(default)]
        camera_id: Option<String>,
    },
    RtspStream {
        camera_id: String,
        url: url::Url,
    },
}

/// The request body for `POST /jobs/video` and `POST /jobs/rtsp`,
/// fully validated before a job is admitted.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct JobDescriptor {
    #[serde(flatten)]
    pub kind: JobKind,
    pub line: LineConfig,
    pub target_class: Option<u32>,
    #[serde(default)]
    pub reversal_policy: Option<ReversalPolicy>,
    /// Whether the line-crossing counter runs at all. A caller that only
    /// wants the annotated MJPEG stream (no counting) sets this `false`.
    #[serde(default = "default_count_enabled")]
    pub count_enabled: bool,
    /// Caps the effective processing rate for this job in frames per
    /// second; `None` or `Some(0.0)` runs unthrottled. Overrides the
    /// process-wide `rtsp_fps_cap` default for this job only.
    #[serde(default)]
    pub fps_cap: Option<f64>,
}

fn default_count_enabled() -> bool {
    true
}

impl JobDescriptor {
    pub fn validate(&self) -> Result<(), Error> {
        self.line.validate()?;
        if let JobKind::RtspStream { camera_id, .. } = &self.kind {
            if camera_id.trim().is_empty() {
                return Err(err!(InvalidInput, "camera_id must not be empty"));
            }
        }
        Ok(())
    }

    pub fn camera_id(&self) -> Option<&str> {
        match &self.kind {
            JobKind::RtspStream { camera_id, .. } => Some(camera_id),
            JobKind::FileVideo { camera_id, .. } => camera_id.as_deref(),
        }
    }
}

/// The job lifecycle. Transitions follow a strict order; see
/// `Phase::can_transition_to`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Stopped)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Stopped)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Paused, Failed)
        )
    }
}

/// A point-in-time snapshot of a job's progress, returned by
/// `GET /jobs/{id}` and cloned out from behind the worker's status
/// mutex on every read.
#[derive(Clone, Debug, serde::Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub camera_id: Option<String>,
    pub phase: Phase,
    pub frames_in: u64,
    pub frames_out: u64,
    pub entry_count: u64,
    pub exit_count: u64,
    pub last_frame_index: u64,
    pub fps_measured: Option<f64>,
    pub uptime_s: f64,
    pub stream_properties: Option<StreamProperties>,
    /// `frames_in / total_frames` for a `FileVideo` job once the source
    /// reports its frame count; `None` for a live RTSP job, which has no
    /// notion of completion percentage.
    pub progress: Option<f64>,
    pub error: Option<String>,
}

impl JobStatus {
    pub fn net_count(&self) -> i64 {
        self.entry_count as i64 - self.exit_count as i64
    }

    pub fn pending(id: JobId) -> Self {
        JobStatus {
            id,
            camera_id: None,
            phase: Phase::Pending,
            frames_in: 0,
            frames_out: 0,
            entry_count: 0,
            exit_count: 0,
            last_frame_index: 0,
            fps_measured: None,
            uptime_s: 0.0,
            stream_properties: None,
            progress: None,
            error: None,
        }
    }
}

/// Messages sent down a job's control channel. `Seek` and repeated
/// `Pause`/`Resume`/`Stop` are coalesced by the channel's bounded
/// capacity plus the worker's idempotent handling, not by inspecting
/// the queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlMsg {
    Pause,
    Resume,
    Stop,
    Seek(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_follow_the_state_machine() {
        assert!(Phase::Pending.can_transition_to(Phase::Running));
        assert!(Phase::Running.can_transition_to(Phase::Paused));
        assert!(Phase::Paused.can_transition_to(Phase::Running));
        assert!(!Phase::Completed.can_transition_to(Phase::Running));
        assert!(!Phase::Pending.can_transition_to(Phase::Paused));
    }

    #[test]
    fn terminal_phases_are_recognized() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Stopped.is_terminal());
        assert!(!Phase::Running.is_terminal());
    }

    #[test]
    fn job_id_round_trips_through_display_and_from_str() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn descriptor_rejects_blank_camera_id() {
        let d = JobDescriptor {
            kind: JobKind::RtspStream {
                camera_id: "  ".into(),
                url: "rtsp://example.test/1".parse().unwrap(),
            },
            line: LineConfig {
                p1: (0.0, 50.0),
                p2: (100.0, 50.0),
            },
            target_class: None,
            reversal_policy: None,
            count_enabled: true,
            fps_cap: None,
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn net_count_is_entries_minus_exits() {
        let mut status = JobStatus::pending(JobId::new());
        status.entry_count = 5;
        status.exit_count = 2;
        assert_eq!(status.net_count(), 3);
    }
}
