// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2021 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Response body plumbing shared by every HTTP handler: a boxed,
//! type-erased `http_body::Body` so `/jobs/*`'s small JSON responses and
//! `/stream/{id}`'s unbounded MJPEG byte stream can share one return type.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;

pub type Body = BoxBody<Bytes, std::convert::Infallible>;

/// Wraps a single, already-in-memory chunk.
pub fn full(chunk: impl Into<Bytes>) -> Body {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> Body {
    full(Bytes::new())
}

/// Serializes `value` as a JSON response body.
pub fn json(value: &impl serde::Serialize) -> Body {
    full(serde_json::to_vec(value).expect("response type always serializes"))
}

/// Wraps an unbounded stream of byte chunks, e.g. the MJPEG multipart
/// stream in `web::mjpeg`, which has no natural end until the client
/// disconnects or the job terminates.
pub fn stream<S>(chunks: S) -> Body
where
    S: futures::Stream<Item = Result<Bytes, std::convert::Infallible>> + Send + 'static,
{
    StreamBody::new(futures::StreamExt::map(chunks, |r| r.map(Frame::data))).boxed()
}
