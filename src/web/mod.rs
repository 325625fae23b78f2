// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2021 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP control surface: everything under `/jobs`, `/stream`, and
//! `/rtsp/test`. One `Service::serve` call per request, dispatched by
//! method and decoded path onto small handler methods that each return
//! a `Response<Body>` or an `HttpError`.

mod mjpeg;
mod path;

use self::path::Path;
use crate::body::{self, Body};
use base::clock::RealClocks;
use base::{Error, ErrorKind};
use bytes::Bytes;
use core_lib::crossing::{LineConfig, ReversalPolicy};
use core_lib::job::{JobDescriptor, JobId, JobKind, JobStatus};
use core_lib::manager::JobManager;
use core_lib::store::EventStore;
use futures::StreamExt;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use std::borrow::Borrow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::form_urlencoded;

/// An HTTP error response. A thin wrapper so handlers can use `?` to
/// bail out of a `base::Error` or a response built directly (e.g. 400
/// on a malformed query parameter), then have `serve` flatten either
/// one into an actual reply.
struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        HttpError(from_error(err))
    }
}

type HandlerResult = Result<Response<Body>, HttpError>;

#[derive(serde::Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

fn json_response<B: serde::Serialize>(status: StatusCode, value: &B) -> Response<Body> {
    let mut resp = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(body::json(value))
        .expect("hardcoded head should be valid");
    resp.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, no-cache"),
    );
    resp
}

fn bad_req(message: impl Into<String>) -> HttpError {
    HttpError(json_response(
        StatusCode::BAD_REQUEST,
        &ErrorBody {
            error: ErrorDetail { code: "INVALID_INPUT", message: message.into() },
        },
    ))
}

fn not_found(message: impl Into<String>) -> HttpError {
    HttpError(json_response(
        StatusCode::NOT_FOUND,
        &ErrorBody {
            error: ErrorDetail { code: "NOT_FOUND", message: message.into() },
        },
    ))
}

fn method_not_allowed() -> HttpError {
    HttpError(
        Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(body::empty())
            .expect("hardcoded head should be valid"),
    )
}

/// Maps the workspace's stable error taxonomy onto HTTP status codes,
/// per the REST contract's error table.
fn from_error(err: Error) -> Response<Body> {
    use ErrorKind::*;
    let status = match err.kind() {
        InvalidInput => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        AlreadyExists => StatusCode::CONFLICT,
        InvalidState => StatusCode::CONFLICT,
        ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        SourceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        DetectorError | StoreError | Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(
        status,
        &ErrorBody {
            error: ErrorDetail { code: err.kind().as_str(), message: err.to_string() },
        },
    )
}

/// Everything `Service::new` needs: the job registry, the event store
/// `/jobs/{id}/events` reads from, and the two binary-only knobs
/// (where uploads land, how long an RTSP pre-flight probe waits).
pub struct Config {
    pub manager: Arc<JobManager<RealClocks>>,
    pub store: Arc<dyn EventStore>,
    pub upload_dir: PathBuf,
    pub rtsp_probe_timeout: Duration,
}

pub struct Service {
    manager: Arc<JobManager<RealClocks>>,
    store: Arc<dyn EventStore>,
    upload_dir: PathBuf,
    rtsp_probe_timeout: Duration,
}

fn default_line() -> LineConfig {
    LineConfig { p1: (0.0, 50.0), p2: (100.0, 50.0) }
}

/// Query parameters accepted by `POST /jobs/video`. The REST table only
/// names `count_enabled`/`camera_id`; the line and target-class fields a
/// `JobDescriptor` also requires are accepted here as additional,
/// optional parameters rather than widening the multipart body (see
/// DESIGN.md).
struct VideoJobParams {
    count_enabled: bool,
    camera_id: Option<String>,
    line: LineConfig,
    target_class: Option<u32>,
    reversal_policy: Option<ReversalPolicy>,
    fps_cap: Option<f64>,
}

fn parse_video_job_params(query: Option<&str>) -> Result<VideoJobParams, HttpError> {
    let mut count_enabled = true;
    let mut camera_id = None;
    let mut line = default_line();
    let mut target_class = None;
    let mut reversal_policy = None;
    let mut fps_cap = None;
    if let Some(q) = query {
        for (key, value) in form_urlencoded::parse(q.as_bytes()) {
            let (key, value): (_, &str) = (key.borrow(), value.borrow());
            match key {
                "count_enabled" => count_enabled = value == "true",
                "camera_id" => camera_id = Some(value.to_owned()),
                "target_class" => {
                    target_class = Some(
                        value
                            .parse()
                            .map_err(|_| bad_req(format!("invalid target_class {value:?}")))?,
                    )
                }
                "reversal_policy" => {
                    reversal_policy = Some(match value {
                        "ALLOW_REVERSAL" => ReversalPolicy::AllowReversal,
                        "FIRST_ONLY" => ReversalPolicy::FirstOnly,
                        other => return Err(bad_req(format!("unrecognized reversal_policy {other:?}"))),
                    })
                }
                "fps_cap" => {
                    fps_cap = Some(
                        value
                            .parse()
                            .map_err(|_| bad_req(format!("invalid fps_cap {value:?}")))?,
                    )
                }
                "line_p1_x" => line.p1.0 = parse_coord(value)?,
                "line_p1_y" => line.p1.1 = parse_coord(value)?,
                "line_p2_x" => line.p2.0 = parse_coord(value)?,
                "line_p2_y" => line.p2.1 = parse_coord(value)?,
                _ => {}
            }
        }
    }
    Ok(VideoJobParams { count_enabled, camera_id, line, target_class, reversal_policy, fps_cap })
}

fn parse_coord(value: &str) -> Result<f64, HttpError> {
    value.parse().map_err(|_| bad_req(format!("invalid line coordinate {value:?}")))
}

#[derive(serde::Serialize)]
struct SubmitVideoResponse {
    job_id: JobId,
}

#[derive(serde::Deserialize)]
struct SubmitRtspRequest {
    camera_id: String,
    rtsp_url: url::Url,
    /// Accepted for forward compatibility with the REST contract;
    /// `JobKind::RtspStream` has no separate display-name field today.
    #[serde(default)]
    #[allow(dead_code)]
    camera_name: Option<String>,
    #[serde(default = "default_line")]
    line: LineConfig,
    #[serde(default)]
    target_class: Option<u32>,
    #[serde(default)]
    reversal_policy: Option<ReversalPolicy>,
    #[serde(default = "default_count_enabled")]
    count_enabled: bool,
    #[serde(default)]
    fps_cap: Option<f64>,
}

fn default_count_enabled() -> bool {
    true
}

#[derive(serde::Serialize)]
struct SubmitRtspResponse {
    job_id: JobId,
    stream_url: String,
}

#[derive(serde::Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(serde::Serialize)]
struct StopResponse {
    ok: bool,
    status: JobStatus,
}

#[derive(serde::Deserialize)]
struct SeekRequest {
    delta_frames: i64,
}

#[derive(serde::Deserialize)]
struct RtspTestRequest {
    rtsp_url: url::Url,
}

#[derive(serde::Serialize)]
struct RtspTestResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Service {
            manager: config.manager,
            store: config.store,
            upload_dir: config.upload_dir,
            rtsp_probe_timeout: config.rtsp_probe_timeout,
        }
    }

    /// Serves an HTTP request. Always returns `Ok`: an error return from
    /// this method would cause hyper to drop the connection rather than
    /// respond, so `serve_inner`'s `Err` results (built with `?` against
    /// `HttpError`) are unwrapped into a real response here instead.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let method = req.method().clone();
        let p = Path::decode(req.uri().path());
        debug!(method = %method, path = %req.uri(), decoded = ?p, "request");
        Ok(self.serve_inner(req, method, p).await.unwrap_or_else(|e| e.0))
    }

    async fn serve_inner(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
        method: Method,
        p: Path,
    ) -> HandlerResult {
        match (method, p) {
            (Method::POST, Path::SubmitVideo) => self.submit_video(req).await,
            (Method::POST, Path::SubmitRtsp) => self.submit_rtsp(req).await,
            (Method::GET, Path::ListJobs) => self.list_jobs(),
            (Method::GET, Path::Job(id)) => self.job_status(id),
            (Method::GET, Path::JobEvents(id)) => self.job_events(id).await,
            (Method::POST, Path::Pause(id)) => self.pause(id).await,
            (Method::POST, Path::Resume(id)) => self.resume(id).await,
            (Method::POST, Path::Stop(id)) => self.stop(id).await,
            (Method::POST, Path::Seek(id)) => self.seek(id, req).await,
            (Method::GET, Path::Stream(id)) => self.stream(id),
            (Method::POST, Path::RtspTest) => self.rtsp_test(req).await,
            (_, Path::NotFound) => Err(not_found("no such route")),
            _ => Err(method_not_allowed()),
        }
    }

    async fn submit_video(&self, req: Request<hyper::body::Incoming>) -> HandlerResult {
        let (parts, body) = req.into_parts();
        let params = parse_video_job_params(parts.uri.query())?;
        let boundary = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| multer::parse_boundary(v).ok())
            .ok_or_else(|| bad_req("expected a multipart/form-data request with a file field"))?;

        let stream = http_body_util::BodyStream::new(body).filter_map(|result| async move {
            match result {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(e) => Some(Err(e)),
            }
        });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut path = None;
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_req(format!("invalid multipart body: {e}")))?
        {
            if field.name() != Some("file") {
                continue;
            }
            let ext = field
                .file_name()
                .and_then(|name| name.rsplit_once('.'))
                .map(|(_, ext)| ext)
                .unwrap_or("bin");
            let dest = self.upload_dir.join(format!("{}.{ext}", uuid::Uuid::now_v7()));
            let mut file = tokio::fs::File::create(&dest)
                .await
                .map_err(|e| Error::wrap(ErrorKind::StoreError, format!("creating {}", dest.display()), e))?;
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| bad_req(format!("reading uploaded file: {e}")))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::wrap(ErrorKind::StoreError, format!("writing {}", dest.display()), e))?;
            }
            path = Some(dest);
        }
        let path = path.ok_or_else(|| bad_req("multipart body has no \"file\" field"))?;

        let descriptor = JobDescriptor {
            kind: JobKind::FileVideo { path, output_path: None, camera_id: params.camera_id },
            line: params.line,
            target_class: params.target_class,
            reversal_policy: params.reversal_policy,
            count_enabled: params.count_enabled,
            fps_cap: params.fps_cap,
        };
        let job_id = self.manager.submit(descriptor)?;
        Ok(json_response(StatusCode::ACCEPTED, &SubmitVideoResponse { job_id }))
    }

    async fn submit_rtsp(&self, req: Request<hyper::body::Incoming>) -> HandlerResult {
        let bytes = read_json_body(req).await?;
        let r: SubmitRtspRequest =
            serde_json::from_slice(&bytes).map_err(|e| bad_req(format!("invalid request body: {e}")))?;
        let descriptor = JobDescriptor {
            kind: JobKind::RtspStream { camera_id: r.camera_id, url: r.rtsp_url },
            line: r.line,
            target_class: r.target_class,
            reversal_policy: r.reversal_policy,
            count_enabled: r.count_enabled,
            fps_cap: r.fps_cap,
        };
        let job_id = self.manager.submit(descriptor)?;
        Ok(json_response(
            StatusCode::ACCEPTED,
            &SubmitRtspResponse { job_id, stream_url: format!("/stream/{job_id}") },
        ))
    }

    fn list_jobs(&self) -> HandlerResult {
        let statuses: Vec<JobStatus> = self
            .manager
            .list()
            .into_iter()
            .filter_map(|id| self.manager.status(id).ok())
            .collect();
        Ok(json_response(StatusCode::OK, &statuses))
    }

    fn job_status(&self, id: JobId) -> HandlerResult {
        let status = self.manager.status(id)?;
        Ok(json_response(StatusCode::OK, &status))
    }

    async fn job_events(&self, id: JobId) -> HandlerResult {
        // Confirms the job exists before querying the store, so an
        // unknown id reads as 404 rather than an empty event list.
        self.manager.status(id)?;
        let events = self.store.read_events(&id.to_string()).await?;
        Ok(json_response(StatusCode::OK, &events))
    }

    async fn pause(&self, id: JobId) -> HandlerResult {
        self.manager.pause(id).await?;
        Ok(json_response(StatusCode::OK, &OkResponse { ok: true }))
    }

    async fn resume(&self, id: JobId) -> HandlerResult {
        self.manager.resume(id).await?;
        Ok(json_response(StatusCode::OK, &OkResponse { ok: true }))
    }

    async fn stop(&self, id: JobId) -> HandlerResult {
        self.manager.stop(id).await?;
        let status = self.manager.status(id)?;
        Ok(json_response(StatusCode::OK, &StopResponse { ok: true, status }))
    }

    async fn seek(&self, id: JobId, req: Request<hyper::body::Incoming>) -> HandlerResult {
        let bytes = read_json_body(req).await?;
        let r: SeekRequest =
            serde_json::from_slice(&bytes).map_err(|e| bad_req(format!("invalid request body: {e}")))?;
        self.manager.seek(id, r.delta_frames).await?;
        Ok(json_response(StatusCode::OK, &OkResponse { ok: true }))
    }

    fn stream(&self, id: JobId) -> HandlerResult {
        let broadcaster = self.manager.broadcaster(id).map_err(|e| match e.kind() {
            ErrorKind::NotFound => HttpError(
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(body::empty())
                    .expect("hardcoded head should be valid"),
            ),
            _ => HttpError::from(e),
        })?;
        let boundary = mjpeg::new_boundary();
        let content_type = mjpeg::content_type(&boundary);
        let body = body::stream(mjpeg::stream(broadcaster.subscribe(), boundary));
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_str(&content_type).expect("boundary is ASCII"),
            )
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .body(body)
            .expect("hardcoded head should be valid"))
    }

    async fn rtsp_test(&self, req: Request<hyper::body::Incoming>) -> HandlerResult {
        let bytes = read_json_body(req).await?;
        let r: RtspTestRequest =
            serde_json::from_slice(&bytes).map_err(|e| bad_req(format!("invalid request body: {e}")))?;
        let resp = match crate::sources::probe(r.rtsp_url, self.rtsp_probe_timeout).await {
            Ok(()) => RtspTestResponse { ok: true, width: None, height: None, fps: None, reason: None },
            Err(e) => {
                warn!(error = %e, "rtsp pre-flight probe failed");
                RtspTestResponse { ok: false, width: None, height: None, fps: None, reason: Some(e.to_string()) }
            }
        };
        Ok(json_response(StatusCode::OK, &resp))
    }
}

/// Reads a request body fully into memory. Every JSON-bodied endpoint
/// uses this; only `POST /jobs/video`'s multipart upload streams
/// directly to disk instead.
async fn read_json_body(req: Request<hyper::body::Incoming>) -> Result<Bytes, HttpError> {
    req.into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| bad_req(format!("reading request body: {e}")))
}
