// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Concrete `FrameSource` implementations: a still image (genuinely
//! decoded via the `image` crate), a canned fixture for tests, and a
//! live RTSP source built on `retina` for real session setup, describe,
//! setup and play, and reconnect-with-backoff.
//!
//! Pixel decode of the compressed video elementary stream itself is an
//! injected `FrameDecoder` capability (see below), the same boundary the
//! detector crosses: this crate does not bundle an H.264/H.265 decoder.

use crate::frame::{Frame, NextFrame, StreamProperties};
use async_trait::async_trait;
use base::{bail, err, Error, ErrorKind};
use futures::StreamExt;
use retina::client::Demuxed;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

/// Turns a compressed video sample into a displayable RGB frame.
/// Implementations own whatever decoder state (e.g. an openh264 or
/// ffmpeg session) they need; a sample that only updates decoder state
/// without producing a displayable frame (e.g. buffered B-frames)
/// returns `Ok(None)`.
pub trait FrameDecoder: Send {
    fn decode_sample(&mut self, data: &[u8], is_key: bool) -> Result<Option<Frame>, Error>;
    fn properties(&self) -> Option<StreamProperties>;
}

/// A `FrameDecoder` that treats every sample as an already-decoded,
/// fixed-size solid-color RGB frame: useful for exercising the RTSP
/// reconnect and pacing logic in tests without a real codec.
pub struct FixtureFrameDecoder {
    width: u32,
    height: u32,
    next_index: u64,
}

impl FixtureFrameDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        FixtureFrameDecoder {
            width,
            height,
            next_index: 0,
        }
    }
}

impl FrameDecoder for FixtureFrameDecoder {
    fn decode_sample(&mut self, data: &[u8], _is_key: bool) -> Result<Option<Frame>, Error> {
        let fill = data.first().copied().unwrap_or(0);
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame {
            index,
            timestamp: jiff::Timestamp::now(),
            width: self.width,
            height: self.height,
            rgb: vec![fill; self.width as usize * self.height as usize * 3],
        }))
    }

    fn properties(&self) -> Option<StreamProperties> {
        Some(StreamProperties {
            width: self.width,
            height: self.height,
            fps_measured: None,
            total_frames: None,
        })
    }
}

/// A `FrameDecoder` that never produces a displayable frame. Serves as
/// the binary's default for `RTSP_STREAM` jobs when no real codec is
/// configured, so a deployment can exercise session setup, reconnect
/// and the control surface end to end (no frames ever reach the
/// tracker) before a real decoder is wired in.
pub struct NullFrameDecoder;

impl FrameDecoder for NullFrameDecoder {
    fn decode_sample(&mut self, _data: &[u8], _is_key: bool) -> Result<Option<Frame>, Error> {
        Ok(None)
    }

    fn properties(&self) -> Option<StreamProperties> {
        None
    }
}

/// Replays a fixed list of frames, then ends. Used in worker/manager
/// tests where the exact frame sequence matters.
pub struct FixtureFrameSource {
    frames: Vec<Frame>,
    pos: usize,
}

impl FixtureFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        FixtureFrameSource { frames, pos: 0 }
    }
}

#[async_trait]
impl crate::frame::FrameSource for FixtureFrameSource {
    fn properties(&self) -> Option<StreamProperties> {
        self.frames.first().map(|f| StreamProperties {
            width: f.width,
            height: f.height,
            fps_measured: None,
            total_frames: Some(self.frames.len() as u64),
        })
    }

    async fn next(&mut self) -> Result<NextFrame, Error> {
        match self.frames.get(self.pos) {
            Some(f) => {
                self.pos += 1;
                Ok(NextFrame::Frame(f.clone()))
            }
            None => Ok(NextFrame::Ended),
        }
    }

    async fn seek(&mut self, delta: i64) -> Result<(), Error> {
        let new_pos = self.pos as i64 + delta;
        if new_pos < 0 || new_pos as usize > self.frames.len() {
            return Err(err!(InvalidInput, "seek {delta} out of range at position {}", self.pos));
        }
        self.pos = new_pos as usize;
        Ok(())
    }
}

/// A source producing the same decoded still image on every call,
/// forever. `POST /jobs/video` with an image upload uses this: there is
/// exactly one real frame, annotated and republished on every tick so
/// MJPEG subscribers always have something current to look at.
pub struct ImageFrameSource {
    frame: Frame,
    index: u64,
}

impl ImageFrameSource {
    /// Decodes `data` (JPEG or PNG) into a single RGB frame.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let img = image::load_from_memory(data)
            .map_err(|e| Error::wrap(ErrorKind::InvalidInput, "decoding image", e))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        Ok(ImageFrameSource {
            frame: Frame {
                index: 0,
                timestamp: jiff::Timestamp::now(),
                width,
                height,
                rgb: img.into_raw(),
            },
            index: 0,
        })
    }
}

#[async_trait]
impl crate::frame::FrameSource for ImageFrameSource {
    fn properties(&self) -> Option<StreamProperties> {
        Some(StreamProperties {
            width: self.frame.width,
            height: self.frame.height,
            fps_measured: None,
            total_frames: None,
        })
    }

    async fn next(&mut self) -> Result<NextFrame, Error> {
        let mut frame = self.frame.clone();
        frame.index = self.index;
        frame.timestamp = jiff::Timestamp::now();
        self.index += 1;
        Ok(NextFrame::Frame(frame))
    }

    async fn seek(&mut self, _delta: i64) -> Result<(), Error> {
        Err(err!(InvalidState, "cannot seek a still-image source"))
    }
}

/// A source for `POST /jobs/video` uploads: either a single still image,
/// decoded once and replayed forever (matching `ImageFrameSource`), or
/// a multi-frame file previously written by `encode::FileVideoEncoder`
/// (identified by its magic header), decoded eagerly into memory so
/// `total_frames` — and therefore `JobStatus::progress` — is known from
/// the first tick. This crate doesn't bundle a general-purpose
/// container demuxer/video codec (see `DESIGN.md`); an upload that is
/// neither a still image nor this system's own container fails to open
/// with `SOURCE_UNAVAILABLE`.
pub struct FileVideoSource {
    frames: Vec<Frame>,
    pos: usize,
    /// `None` for a still image, which has no notion of completion.
    total_frames: Option<u64>,
}

impl FileVideoSource {
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        let data = std::fs::read(path)
            .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, format!("opening {}", path.display()), e))?;
        Self::decode(&data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if let Some(rest) = data.strip_prefix(crate::encode::CONTAINER_MAGIC) {
            let frames = Self::decode_container(rest)?;
            if frames.is_empty() {
                return Err(err!(SourceUnavailable, "uploaded video container has no frames"));
            }
            let total = frames.len() as u64;
            return Ok(FileVideoSource {
                frames,
                pos: 0,
                total_frames: Some(total),
            });
        }
        let img = image::load_from_memory(data)
            .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, "decoding uploaded file as an image", e))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        Ok(FileVideoSource {
            frames: vec![Frame {
                index: 0,
                timestamp: jiff::Timestamp::now(),
                width,
                height,
                rgb: img.into_raw(),
            }],
            pos: 0,
            total_frames: None,
        })
    }

    fn decode_container(mut rest: &[u8]) -> Result<Vec<Frame>, Error> {
        let mut frames = Vec::new();
        let mut index = 0u64;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(err!(SourceUnavailable, "truncated video container (length prefix)"));
            }
            let (len_bytes, tail) = rest.split_at(4);
            let len = u32::from_be_bytes(len_bytes.try_into().expect("split_at(4)")) as usize;
            if tail.len() < len {
                return Err(err!(SourceUnavailable, "truncated video container (frame body)"));
            }
            let (jpeg, tail) = tail.split_at(len);
            let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
                .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, "decoding container frame", e))?
                .to_rgb8();
            let (width, height) = img.dimensions();
            frames.push(Frame {
                index,
                timestamp: jiff::Timestamp::now(),
                width,
                height,
                rgb: img.into_raw(),
            });
            index += 1;
            rest = tail;
        }
        Ok(frames)
    }
}

#[async_trait]
impl crate::frame::FrameSource for FileVideoSource {
    fn properties(&self) -> Option<StreamProperties> {
        self.frames.first().map(|f| StreamProperties {
            width: f.width,
            height: f.height,
            fps_measured: None,
            total_frames: self.total_frames,
        })
    }

    async fn next(&mut self) -> Result<NextFrame, Error> {
        // A single decoded still image has no end: it's republished
        // forever with an advancing index, same as `ImageFrameSource`.
        if self.total_frames.is_none() {
            let mut frame = self.frames[0].clone();
            frame.index = self.pos as u64;
            frame.timestamp = jiff::Timestamp::now();
            self.pos += 1;
            return Ok(NextFrame::Frame(frame));
        }
        match self.frames.get(self.pos) {
            Some(f) => {
                self.pos += 1;
                Ok(NextFrame::Frame(f.clone()))
            }
            None => Ok(NextFrame::Ended),
        }
    }

    async fn seek(&mut self, delta: i64) -> Result<(), Error> {
        if self.total_frames.is_none() {
            return Err(err!(InvalidState, "cannot seek a still-image source"));
        }
        let new_pos = self.pos as i64 + delta;
        if new_pos < 0 || new_pos as usize > self.frames.len() {
            return Err(err!(InvalidInput, "seek {delta} out of range at position {}", self.pos));
        }
        self.pos = new_pos as usize;
        Ok(())
    }
}

/// Tunables for RTSP session setup and the reconnect loop around it.
#[derive(Clone)]
pub struct RtspConfig {
    pub url: Url,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub session: retina::client::SessionOptions,
    pub setup: retina::client::SetupOptions,
}

static RETINA_TIMEOUT: Duration = Duration::from_secs(30);

/// A live RTSP source. Session establishment (`DESCRIBE`/`SETUP`/`PLAY`)
/// and reconnect-with-backoff are genuine, built on `retina`; pixel
/// decode of each received sample is delegated to an injected
/// `FrameDecoder`.
pub struct RtspFrameSource {
    config: RtspConfig,
    decoder: Box<dyn FrameDecoder>,
    session: Option<Demuxed>,
    video_stream_index: Option<usize>,
}

impl RtspFrameSource {
    pub fn new(config: RtspConfig, decoder: Box<dyn FrameDecoder>) -> Self {
        RtspFrameSource {
            config,
            decoder,
            session: None,
            video_stream_index: None,
        }
    }

    async fn connect(&mut self) -> Result<(), Error> {
        let mut last_err = None;
        for attempt in 0..=self.config.reconnect_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.reconnect_delay).await;
            }
            match self.try_connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "RTSP connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::wrap(
            ErrorKind::SourceUnavailable,
            format!(
                "could not connect to {} after {} attempts",
                self.config.url,
                self.config.reconnect_attempts + 1
            ),
            last_err.unwrap_or_else(|| err!(SourceUnavailable, "no attempts made")),
        ))
    }

    async fn try_connect_once(&mut self) -> Result<(), Error> {
        let fut = async {
            let mut session =
                retina::client::Session::describe(self.config.url.clone(), self.config.session.clone())
                    .await
                    .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, "describing RTSP session", e))?;
            let video_i = session
                .streams()
                .iter()
                .position(|s| {
                    s.media() == "video"
                        && matches!(s.encoding_name(), "h264" | "h265" | "jpeg")
                })
                .ok_or_else(|| err!(SourceUnavailable, "no supported video stream in RTSP session"))?;
            session
                .setup(video_i, self.config.setup.clone())
                .await
                .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, "setting up RTSP stream", e))?;
            let session = session
                .play(retina::client::PlayOptions::default())
                .await
                .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, "playing RTSP session", e))?;
            let demuxed = session
                .demuxed()
                .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, "demuxing RTSP session", e))?;
            Ok::<_, Error>((demuxed, video_i))
        };
        let (demuxed, video_i) = tokio::time::timeout(RETINA_TIMEOUT, fut)
            .await
            .map_err(|_| err!(SourceUnavailable, "timed out connecting within {RETINA_TIMEOUT:?}"))??;
        self.session = Some(demuxed);
        self.video_stream_index = Some(video_i);
        Ok(())
    }
}

#[async_trait]
impl crate::frame::FrameSource for RtspFrameSource {
    fn properties(&self) -> Option<StreamProperties> {
        self.decoder.properties()
    }

    async fn next(&mut self) -> Result<NextFrame, Error> {
        if self.session.is_none() {
            self.connect().await?;
        }
        loop {
            let session = self.session.as_mut().expect("just connected");
            let item = tokio::time::timeout(RETINA_TIMEOUT, Pin::new(session).next())
                .await
                .map_err(|_| err!(SourceUnavailable, "timed out waiting for next RTSP sample"))?;
            let item = match item {
                None => {
                    // Clean end of stream: reconnect rather than end the
                    // job outright, matching a live camera's normal
                    // transient drops.
                    self.session = None;
                    self.connect().await?;
                    continue;
                }
                Some(Err(e)) => {
                    self.session = None;
                    tracing::warn!(error = %e, "RTSP session error; reconnecting");
                    self.connect().await?;
                    continue;
                }
                Some(Ok(item)) => item,
            };
            if let retina::codec::CodecItem::VideoFrame(v) = item {
                let is_key = v.is_random_access_point();
                let data: bytes::Bytes = v.into_data().into();
                if let Some(frame) = self.decoder.decode_sample(&data, is_key)? {
                    return Ok(NextFrame::Frame(frame));
                }
            }
        }
    }

    async fn seek(&mut self, _delta: i64) -> Result<(), Error> {
        bail!(InvalidInput, "cannot seek a live RTSP source")
    }
}

/// Pre-flight reachability probe for `POST /rtsp/test`: a DESCRIBE only,
/// validating the URL is a reachable, authenticable RTSP source without
/// committing to a full play session. Pixel dimensions aren't available
/// at this stage — this crate doesn't bundle a codec to decode an SPS out
/// of the SDP — so a successful probe reports reachability only.
pub async fn probe(url: Url, session: retina::client::SessionOptions, timeout: Duration) -> Result<(), Error> {
    let fut = retina::client::Session::describe(url, session);
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| err!(SourceUnavailable, "timed out probing RTSP source within {timeout:?}"))?
        .map_err(|e| Error::wrap(ErrorKind::SourceUnavailable, "describing RTSP session", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::VideoEncoder;
    use crate::frame::FrameSource;

    fn frame(index: u64) -> Frame {
        Frame {
            index,
            timestamp: jiff::Timestamp::now(),
            width: 4,
            height: 4,
            rgb: vec![0; 48],
        }
    }

    #[tokio::test]
    async fn fixture_source_ends_after_its_frames() {
        let mut src = FixtureFrameSource::new(vec![frame(0), frame(1)]);
        assert!(matches!(src.next().await.unwrap(), NextFrame::Frame(_)));
        assert!(matches!(src.next().await.unwrap(), NextFrame::Frame(_)));
        assert!(matches!(src.next().await.unwrap(), NextFrame::Ended));
    }

    #[tokio::test]
    async fn fixture_source_seek_moves_position() {
        let mut src = FixtureFrameSource::new(vec![frame(0), frame(1), frame(2)]);
        src.next().await.unwrap();
        src.seek(1).await.unwrap();
        match src.next().await.unwrap() {
            NextFrame::Frame(f) => assert_eq!(f.index, 2),
            NextFrame::Ended => panic!("expected a frame after seek"),
        }
    }

    #[tokio::test]
    async fn fixture_source_seek_out_of_range_errors() {
        let mut src = FixtureFrameSource::new(vec![frame(0)]);
        assert!(src.seek(-5).await.is_err());
    }

    #[test]
    fn null_decoder_never_produces_a_frame() {
        let mut dec = NullFrameDecoder;
        assert!(dec.decode_sample(b"\0\0\0\x01", true).unwrap().is_none());
        assert!(dec.properties().is_none());
    }

    #[test]
    fn fixture_decoder_reports_configured_properties() {
        let decoder = FixtureFrameDecoder::new(640, 480);
        let props = decoder.properties().unwrap();
        assert_eq!(props.width, 640);
        assert_eq!(props.height, 480);
    }

    #[test]
    fn decode_png_still_image() {
        let mut img = image::RgbImage::new(2, 2);
        for p in img.pixels_mut() {
            *p = image::Rgb([10, 20, 30]);
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        let src = ImageFrameSource::decode(&buf).unwrap();
        let props = src.properties().unwrap();
        assert_eq!((props.width, props.height), (2, 2));
    }

    #[tokio::test]
    async fn image_source_cannot_seek() {
        let mut img = image::RgbImage::new(1, 1);
        img.put_pixel(0, 0, image::Rgb([1, 2, 3]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        let mut src = ImageFrameSource::decode(&buf).unwrap();
        assert!(src.seek(1).await.is_err());
        // Re-publishes the same still on every call, incrementing index.
        let f0 = match src.next().await.unwrap() {
            NextFrame::Frame(f) => f,
            _ => panic!("expected frame"),
        };
        let f1 = match src.next().await.unwrap() {
            NextFrame::Frame(f) => f,
            _ => panic!("expected frame"),
        };
        assert_eq!(f0.index, 0);
        assert_eq!(f1.index, 1);
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbImage::new(w, h);
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn file_video_source_treats_a_plain_image_as_a_stub_video() {
        let src = FileVideoSource::decode(&png_bytes(3, 3)).unwrap();
        let props = src.properties().unwrap();
        assert_eq!((props.width, props.height), (3, 3));
        assert!(props.total_frames.is_none());
    }

    #[tokio::test]
    async fn file_video_source_decodes_the_container_and_knows_total_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.lwv");
        let mut enc = crate::encode::FileVideoEncoder::create(&path).unwrap();
        for i in 0..3u64 {
            let jpeg = crate::encode::encode_jpeg(&image::RgbImage::new(4, 4), 80).unwrap();
            enc.write_frame(&crate::frame::EncodedFrame {
                index: i,
                timestamp: jiff::Timestamp::now(),
                jpeg,
            })
            .unwrap();
        }
        Box::new(enc).finish().unwrap();

        let mut src = FileVideoSource::open(&path).unwrap();
        let props = src.properties().unwrap();
        assert_eq!(props.total_frames, Some(3));
        for _ in 0..3 {
            assert!(matches!(src.next().await.unwrap(), NextFrame::Frame(_)));
        }
        assert!(matches!(src.next().await.unwrap(), NextFrame::Ended));
    }

    #[test]
    fn file_video_source_rejects_garbage() {
        assert!(FileVideoSource::decode(b"not an image or container").is_err());
    }
}
