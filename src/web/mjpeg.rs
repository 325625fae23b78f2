// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2021 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MJPEGStreamer: the thin HTTP adapter between a `FrameBroadcaster`
//! subscription and the bit-exact multipart/x-mixed-replace wire format
//! remote viewers expect.

use bytes::Bytes;
use core_lib::broadcaster::{NextOutcome, Subscription};
use futures::Stream;
use std::convert::Infallible;

/// A fresh boundary token, regenerated per response per spec: an ASCII
/// token at least 16 characters long, never derived from frame content
/// so it can't collide with anything a JPEG might contain.
pub fn new_boundary() -> String {
    format!("linewatch-mjpeg-{}", uuid::Uuid::now_v7().as_simple())
}

pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// One part of the multipart body for `jpeg`, framed exactly per spec
/// section 4.6: boundary line, two headers, a blank line, the JPEG bytes,
/// then a trailing CRLF. No terminating boundary is ever emitted; the
/// stream simply ends (cleanly on broadcaster close, or by being dropped
/// on client disconnect).
fn part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(jpeg.len() + boundary.len() + 64);
    buf.extend_from_slice(b"--");
    buf.extend_from_slice(boundary.as_bytes());
    buf.extend_from_slice(b"\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    buf.extend_from_slice(jpeg.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
    buf.extend_from_slice(jpeg);
    buf.extend_from_slice(b"\r\n");
    Bytes::from(buf)
}

/// Builds the response body stream for `GET /stream/{id}` against the
/// boundary already committed to in the response's `Content-Type`
/// header. Each item is one multipart part; the stream ends once the
/// broadcaster reports `Ended`. A client disconnect is handled by hyper
/// simply dropping this stream, which drops `sub` and unsubscribes.
pub fn stream(sub: Subscription, boundary: String) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures::stream::unfold((sub, boundary), |(mut sub, boundary)| async move {
        match sub.next(std::future::pending()).await {
            NextOutcome::Frame(frame) => {
                let chunk = part(&boundary, &frame.jpeg);
                Some((Ok(chunk), (sub, boundary)))
            }
            NextOutcome::Ended | NextOutcome::Canceled => None,
        }
    })
}
