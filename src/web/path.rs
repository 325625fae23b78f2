// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2021 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decodes request paths.

use core_lib::job::JobId;

/// A decoded request path. Doesn't look at the method; `Service::serve_inner`
/// matches method + path together so e.g. `GET /jobs/{id}` and
/// `POST /jobs/{id}/pause` decode to distinct variants despite sharing a
/// prefix.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Path {
    SubmitVideo,       // POST /jobs/video
    SubmitRtsp,        // POST /jobs/rtsp
    ListJobs,          // GET /jobs
    Job(JobId),        // GET /jobs/<id>
    JobEvents(JobId),  // GET /jobs/<id>/events
    Pause(JobId),      // POST /jobs/<id>/pause
    Resume(JobId),     // POST /jobs/<id>/resume
    Stop(JobId),       // POST /jobs/<id>/stop
    Seek(JobId),       // POST /jobs/<id>/seek
    Stream(JobId),     // GET /stream/<id>
    RtspTest,          // POST /rtsp/test
    NotFound,
}

impl Path {
    /// Decodes a request path, notably not including any request parameters.
    pub(super) fn decode(path: &str) -> Self {
        let path = path.strip_prefix('/').unwrap_or(path);
        let mut segments = path.split('/');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some("jobs"), Some("video"), None, None) => Path::SubmitVideo,
            (Some("jobs"), Some("rtsp"), None, None) => Path::SubmitRtsp,
            (Some("jobs"), None, None, None) | (Some("jobs"), Some(""), None, None) => Path::ListJobs,
            (Some("jobs"), Some(id), None, None) => id.parse().map(Path::Job).unwrap_or(Path::NotFound),
            (Some("jobs"), Some(id), Some("events"), None) => id.parse().map(Path::JobEvents).unwrap_or(Path::NotFound),
            (Some("jobs"), Some(id), Some("pause"), None) => id.parse().map(Path::Pause).unwrap_or(Path::NotFound),
            (Some("jobs"), Some(id), Some("resume"), None) => id.parse().map(Path::Resume).unwrap_or(Path::NotFound),
            (Some("jobs"), Some(id), Some("stop"), None) => id.parse().map(Path::Stop).unwrap_or(Path::NotFound),
            (Some("jobs"), Some(id), Some("seek"), None) => id.parse().map(Path::Seek).unwrap_or(Path::NotFound),
            (Some("stream"), Some(id), None, None) => id.parse().map(Path::Stream).unwrap_or(Path::NotFound),
            (Some("rtsp"), Some("test"), None, None) => Path::RtspTest,
            _ => Path::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_lib::job::JobId;

    #[test]
    fn decodes_static_paths() {
        assert_eq!(Path::decode("/jobs/video"), Path::SubmitVideo);
        assert_eq!(Path::decode("/jobs/rtsp"), Path::SubmitRtsp);
        assert_eq!(Path::decode("/jobs"), Path::ListJobs);
        assert_eq!(Path::decode("/rtsp/test"), Path::RtspTest);
        assert_eq!(Path::decode("/nonsense"), Path::NotFound);
    }

    #[test]
    fn decodes_job_scoped_paths() {
        let id = JobId::new();
        assert_eq!(Path::decode(&format!("/jobs/{id}")), Path::Job(id));
        assert_eq!(Path::decode(&format!("/jobs/{id}/events")), Path::JobEvents(id));
        assert_eq!(Path::decode(&format!("/jobs/{id}/pause")), Path::Pause(id));
        assert_eq!(Path::decode(&format!("/stream/{id}")), Path::Stream(id));
    }

    #[test]
    fn rejects_malformed_job_ids() {
        assert_eq!(Path::decode("/jobs/not-a-uuid"), Path::NotFound);
        assert_eq!(Path::decode("/jobs/not-a-uuid/pause"), Path::NotFound);
    }
}
