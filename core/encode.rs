// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JPEG encoding of annotated frames, the wire format published to
//! MJPEG subscribers, plus `VideoEncoder`: the output side of a
//! `FILE_VIDEO` job that also wants its annotated frames written back
//! out to a file (`JobDescriptor`'s optional `output_path`).

use crate::frame::EncodedFrame;
use base::{Error, ErrorKind};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::io::{BufWriter, Write as _};
use std::path::Path;

/// Default JPEG quality (1-100) applied when a job doesn't override it.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Encodes `img` to a JPEG byte buffer at `quality` (clamped to 1-100).
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<bytes::Bytes, Error> {
    let quality = quality.clamp(1, 100);
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .encode(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)
        .map_err(|e| Error::wrap(ErrorKind::Fatal, "encoding JPEG frame", e))?;
    Ok(bytes::Bytes::from(buf))
}

/// The output side of a `FILE_VIDEO` job: every annotated frame the
/// worker publishes to the `FrameBroadcaster` is also handed here, in
/// the same order. `finish` is called exactly once, on every terminal
/// transition (`COMPLETED`, `STOPPED`, or `FAILED`), and must flush and
/// close whatever resource it holds — the spec's "no frame written to
/// encoder without also published to broadcaster" invariant is upheld
/// by the worker calling the two in that fixed order, not by anything
/// here.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), Error>;
    fn finish(self: Box<Self>) -> Result<(), Error>;
}

/// Discards every frame. Used for `RTSP_STREAM` jobs (which have no
/// output file) and `FILE_VIDEO` jobs that left `output_path` unset.
pub struct NullVideoEncoder;

impl VideoEncoder for NullVideoEncoder {
    fn write_frame(&mut self, _frame: &EncodedFrame) -> Result<(), Error> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

/// A minimal self-describing container for a sequence of JPEG frames:
/// each record is a big-endian `u32` byte length followed by that many
/// JPEG bytes. This crate doesn't bundle a general-purpose video muxer
/// (see `DESIGN.md`), so a job's `output_path` gets this format rather
/// than e.g. MP4; it's trivial to demux back into frames, which
/// `source::FileVideoSource` does for re-processing a job's own output.
/// Magic bytes identifying `FileVideoEncoder`'s container so
/// `source::FileVideoSource` can tell it apart from a plain uploaded
/// still image on read-back.
pub const CONTAINER_MAGIC: &[u8; 5] = b"LWV1\0";

pub struct FileVideoEncoder {
    out: BufWriter<std::fs::File>,
}

impl FileVideoEncoder {
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = std::fs::File::create(path)
            .map_err(|e| Error::wrap(ErrorKind::Fatal, format!("creating output file {}", path.display()), e))?;
        let mut out = BufWriter::new(file);
        out.write_all(CONTAINER_MAGIC)
            .map_err(|e| Error::wrap(ErrorKind::Fatal, "writing container magic", e))?;
        Ok(FileVideoEncoder { out })
    }
}

impl VideoEncoder for FileVideoEncoder {
    fn write_frame(&mut self, frame: &EncodedFrame) -> Result<(), Error> {
        let len = u32::try_from(frame.jpeg.len())
            .map_err(|e| Error::wrap(ErrorKind::Fatal, "encoded frame too large for container", e))?;
        self.out
            .write_all(&len.to_be_bytes())
            .and_then(|()| self.out.write_all(&frame.jpeg))
            .map_err(|e| Error::wrap(ErrorKind::Fatal, "writing output frame", e))
    }

    fn finish(mut self: Box<Self>) -> Result<(), Error> {
        self.out
            .flush()
            .map_err(|e| Error::wrap(ErrorKind::Fatal, "flushing output file", e))
    }
}
