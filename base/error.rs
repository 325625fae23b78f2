// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2016 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A stable, machine-readable error taxonomy shared by every crate in this
//! workspace, with a `thiserror`-derived error type carrying it.

use std::fmt;

/// Stable, machine-readable error codes.
///
/// These are part of the HTTP/REST contract: `web::from_error` maps each
/// variant to a status code. Adding a variant is a minor-version change for
/// callers matching on this enum, so it's marked `#[non_exhaustive]`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed request, unsupported media, out-of-range line coordinates,
    /// seek on a non-file job.
    InvalidInput,

    /// Unknown job id (or other unknown resource).
    NotFound,

    /// An RTSP stream for this camera is already running.
    AlreadyExists,

    /// Control operation incompatible with the job's current phase.
    InvalidState,

    /// The concurrent-job cap has been reached.
    ResourceExhausted,

    /// RTSP could not connect after retries, or a file could not be opened
    /// or decoded.
    SourceUnavailable,

    /// The detector capability failed for a frame.
    DetectorError,

    /// The event store failed to persist an event.
    StoreError,

    /// A per-class error threshold was exceeded; the job is transitioning
    /// to `FAILED`.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorKind::DetectorError => "DETECTOR_ERROR",
            ErrorKind::StoreError => "STORE_ERROR",
            ErrorKind::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workspace's error type: a code plus a human-readable message and an
/// optional chained cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn wrap<E>(kind: ErrorKind, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Renders the full cause chain, one line per level.
    pub fn chain(&self) -> String {
        let mut s = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(c) = cause {
            s.push_str(": ");
            s.push_str(&c.to_string());
            cause = c.source();
        }
        s
    }
}

/// Adds an `ErrorKind` to a lower-level `Result`'s error, analogous to
/// `failure::ResultExt` in this codebase's earlier incarnation but built on
/// `thiserror` instead of the deprecated `failure` crate.
pub trait ResultExt<T> {
    fn err_kind(self, kind: ErrorKind) -> Result<T, Error>;
    fn err_kind_msg(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, kind: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| {
            let message = e.to_string();
            Error::wrap(kind, message, e)
        })
    }

    fn err_kind_msg(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(kind, message, e))
    }
}

/// Shorthand for constructing an [`Error`] with a formatted message, mirroring
/// `failure::format_err!` but attaching one of our stable kinds.
#[macro_export]
macro_rules! err {
    ($kind:ident, $fmt:expr $(, $arg:expr)* $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($fmt $(, $arg)*))
    };
}

/// Shorthand for early-returning an [`Error`], mirroring `failure::bail!`.
#[macro_export]
macro_rules! bail {
    ($kind:ident, $fmt:expr $(, $arg:expr)* $(,)?) => {
        return Err($crate::err!($kind, $fmt $(, $arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_as_str() {
        assert_eq!(ErrorKind::NotFound.as_str(), "NOT_FOUND");
        assert_eq!(ErrorKind::NotFound.to_string(), "NOT_FOUND");
    }

    #[test]
    fn wrap_preserves_kind_and_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = Error::wrap(ErrorKind::StoreError, "writing event", io_err);
        assert_eq!(e.kind(), ErrorKind::StoreError);
        assert!(e.chain().contains("disk full"));
    }

    #[test]
    fn err_and_bail_macros_attach_kind() {
        fn f() -> Result<(), Error> {
            bail!(InvalidInput, "bad bbox: {}x{}", -1, -1);
        }
        let e = f().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInput);
        assert!(e.to_string().contains("bad bbox"));
    }
}
