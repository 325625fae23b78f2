// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2022 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration file (`/etc/linewatch.json`).
//!
//! This layers two binary-only concerns (where things are stored on
//! disk, how long shutdown waits) on top of `core_lib::config::FileConfig`,
//! which already owns every per-job tunable and the HTTP bind address.

use serde::Deserialize;
use std::path::PathBuf;

fn default_db_dir() -> PathBuf {
    "/var/lib/linewatch/db".into()
}

fn default_upload_dir() -> PathBuf {
    "/var/lib/linewatch/uploads".into()
}

fn default_drain_timeout_s() -> f64 {
    15.0
}

fn default_rtsp_probe_timeout_s() -> f64 {
    5.0
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Directory holding the SQLite3 event database and its journal
    /// fallback file.
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,

    /// Directory `POST /jobs/video` writes uploaded files to before
    /// submitting a job against them.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    ///
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// How long process shutdown waits for jobs to drain before forcing
    /// them closed. See `T_drain` in the exit-behavior section.
    #[serde(default = "default_drain_timeout_s")]
    pub drain_timeout_s: f64,

    /// Timeout for the `POST /rtsp/test` pre-flight probe.
    #[serde(default = "default_rtsp_probe_timeout_s")]
    pub rtsp_probe_timeout_s: f64,

    /// The per-job and per-process tunables shared with every consumer
    /// of `core_lib`, plus the HTTP bind address.
    #[serde(flatten)]
    pub limits: core_lib::config::FileConfig,
}

impl Default for ConfigFile {
    fn default() -> Self {
        ConfigFile {
            db_dir: default_db_dir(),
            upload_dir: default_upload_dir(),
            worker_threads: None,
            drain_timeout_s: default_drain_timeout_s(),
            rtsp_probe_timeout_s: default_rtsp_probe_timeout_s(),
            limits: core_lib::config::FileConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_fills_in_every_default() {
        let file: ConfigFile = serde_json::from_str("{}").unwrap();
        assert_eq!(file.db_dir, default_db_dir());
        assert_eq!(file.upload_dir, default_upload_dir());
        assert_eq!(file.drain_timeout_s, 15.0);
        assert!(file.worker_threads.is_none());
    }

    #[test]
    fn flattened_limits_parse_alongside_binary_fields() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"dbDir": "/tmp/db", "max_concurrent_jobs": 2, "bind_addr": "0.0.0.0:9000"}"#,
        )
        .unwrap();
        assert_eq!(file.db_dir, PathBuf::from("/tmp/db"));
        assert_eq!(file.limits.max_concurrent_jobs, Some(2));
        assert_eq!(file.limits.bind_addr.as_deref(), Some("0.0.0.0:9000"));
    }
}
