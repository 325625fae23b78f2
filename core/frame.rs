// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The decoded-frame type shared across the detector, tracker, annotator,
//! and broadcaster, plus the `FrameSource` capability boundary that
//! produces it.

use async_trait::async_trait;
use base::Error;
use bytes::Bytes;

/// One decoded video frame, already converted to packed 8-bit RGB.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonically increasing within a job, starting at 0. Used as the
    /// tracker/crossing-counter's time axis and as the index a `SEEK`
    /// control message moves relative to.
    pub index: u64,
    pub timestamp: jiff::Timestamp,
    pub width: u32,
    pub height: u32,
    /// Row-major, no padding: `rgb.len() == width * height * 3`.
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn validate(&self) -> Result<(), Error> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.rgb.len() != expected {
            return Err(base::err!(
                InvalidInput,
                "frame {} buffer is {} bytes, expected {} for {}x{} RGB",
                self.index,
                self.rgb.len(),
                expected,
                self.width,
                self.height
            ));
        }
        Ok(())
    }
}

/// A still JPEG/PNG encoded frame, the wire format published to MJPEG
/// subscribers and handed to the store for a crossing snapshot.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub index: u64,
    pub timestamp: jiff::Timestamp,
    pub jpeg: Bytes,
}

/// Properties discovered once a source starts producing frames, surfaced
/// in `JobStatus` so a client can learn the stream's actual resolution
/// and frame rate.
#[derive(Copy, Clone, Debug, serde::Serialize)]
pub struct StreamProperties {
    pub width: u32,
    pub height: u32,
    /// `None` until at least two frames have been observed.
    pub fps_measured: Option<f64>,
    /// Total frame count, known up front for a decoded file and never
    /// known for a live RTSP stream. Drives `JobStatus::progress`.
    pub total_frames: Option<u64>,
}

/// What `FrameSource::next` returned.
pub enum NextFrame {
    Frame(Frame),
    /// The source is exhausted (end of file, or the peer closed cleanly)
    /// and will never produce another frame.
    Ended,
}

/// A pluggable source of decoded frames: a still image, a local video
/// file, or a live RTSP stream. Implementations own whatever decoder
/// state and reconnect logic they need; the worker loop only calls
/// `next` and `properties`.
#[async_trait]
pub trait FrameSource: Send {
    /// Returns the source's properties, if known yet. A live RTSP
    /// source may not know its resolution until the first frame is
    /// decoded.
    fn properties(&self) -> Option<StreamProperties>;

    /// Produces the next frame, or `Ended` at end of stream. Errors are
    /// for source-level failures (`SOURCE_UNAVAILABLE`); the worker
    /// applies its own reconnect/retry policy around this call for RTSP
    /// sources.
    async fn next(&mut self) -> Result<NextFrame, Error>;

    /// Seeks forward or backward by `delta` frames from the current
    /// position (e.g. `-150` to rewind five seconds at 30fps). File
    /// sources support this; live RTSP sources return
    /// `ErrorKind::InvalidState`.
    async fn seek(&mut self, delta: i64) -> Result<(), Error>;
}
