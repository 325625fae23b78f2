// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2022 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The binary's `SourceFactory`: the one place that decides which concrete
//! `FrameSource` backs a submitted job. A `FILE_VIDEO` job reads back
//! whatever `POST /jobs/video` already saved to disk; a `RTSP_STREAM` job
//! gets a real `retina`-backed session, credentials (if any) pulled from
//! the URL's userinfo since the wire request has no separate fields for
//! them.

use core_lib::frame::FrameSource;
use core_lib::job::{JobDescriptor, JobKind};
use core_lib::manager::SourceFactory;
use core_lib::source::{FileVideoSource, NullFrameDecoder, RtspConfig, RtspFrameSource};
use std::time::Duration;

/// Tunables carried from the process config into every RTSP session this
/// factory builds.
#[derive(Clone)]
pub struct RtspDefaults {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

pub struct ProcessSources {
    pub rtsp: RtspDefaults,
}

fn session_options(url: &url::Url) -> retina::client::SessionOptions {
    let creds = if url.username().is_empty() && url.password().is_none() {
        None
    } else {
        Some(retina::client::Credentials {
            username: url.username().to_owned(),
            password: url.password().unwrap_or("").to_owned(),
        })
    };
    retina::client::SessionOptions::default()
        .creds(creds)
        .user_agent(format!("linewatch {}", env!("CARGO_PKG_VERSION")))
}

impl SourceFactory for ProcessSources {
    fn build(&self, descriptor: &JobDescriptor) -> Result<Box<dyn FrameSource>, base::Error> {
        match &descriptor.kind {
            JobKind::FileVideo { path, .. } => Ok(Box::new(FileVideoSource::open(path)?)),
            JobKind::RtspStream { url, .. } => {
                let config = RtspConfig {
                    session: session_options(url),
                    setup: retina::client::SetupOptions::default(),
                    url: url.clone(),
                    reconnect_attempts: self.rtsp.reconnect_attempts,
                    reconnect_delay: self.rtsp.reconnect_delay,
                };
                // No codec is bundled (see DESIGN.md): frames never reach
                // the tracker, but session setup, reconnect and the
                // control surface all work end to end.
                Ok(Box::new(RtspFrameSource::new(config, Box::new(NullFrameDecoder))))
            }
        }
    }
}

/// Pre-flight probe backing `POST /rtsp/test`.
pub async fn probe(url: url::Url, timeout: Duration) -> Result<(), base::Error> {
    core_lib::source::probe(url.clone(), session_options(&url), timeout).await
}
