// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2022 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::sources::{ProcessSources, RtspDefaults};
use crate::web;
use base::clock::RealClocks;
use base::{err, Error};
use bpaf::Bpaf;
use core_lib::detect::NullDetector;
use core_lib::manager::JobManager;
use core_lib::store::SqliteEventStore;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use self::config::ConfigFile;

mod config;

const DEFAULT_CONFIG_PATH: &str = "/etc/linewatch.json";

#[derive(Bpaf, Debug)]
pub struct Args {
    /// Path to the JSON configuration file.
    #[bpaf(short, long, argument("PATH"), fallback(DEFAULT_CONFIG_PATH.into()), debug_fallback)]
    config: PathBuf,

    /// Overrides the event database directory from the config file.
    #[bpaf(long, argument("PATH"))]
    db_dir: Option<PathBuf>,

    /// Overrides the multipart upload directory from the config file.
    #[bpaf(long, argument("PATH"))]
    upload_dir: Option<PathBuf>,

    /// Overrides the HTTP bind address from the config file.
    #[bpaf(long, argument("ADDR"))]
    bind_addr: Option<SocketAddr>,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long, argument("N"))]
    worker_threads: Option<usize>,
}

/// Everything `run` needs, after layering CLI overrides on top of the
/// (possibly absent) config file and the library's own defaults.
struct Resolved {
    db_dir: PathBuf,
    upload_dir: PathBuf,
    worker_threads: Option<usize>,
    drain_timeout: Duration,
    rtsp_probe_timeout: Duration,
    bind_addr: SocketAddr,
    core: core_lib::config::Config,
}

fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| Error::wrap(base::ErrorKind::InvalidInput, format!("parsing {}", path.display()), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file found; using defaults");
            Ok(ConfigFile::default())
        }
        Err(e) => Err(Error::wrap(base::ErrorKind::InvalidInput, format!("reading {}", path.display()), e)),
    }
}

fn resolve(file: ConfigFile, args: &Args) -> Result<Resolved, Error> {
    let core = core_lib::config::Config::default().merge(file.limits);
    let bind_addr = match &args.bind_addr {
        Some(a) => *a,
        None => core
            .bind_addr
            .parse()
            .map_err(|e| Error::wrap(base::ErrorKind::InvalidInput, format!("invalid bind_addr {:?}", core.bind_addr), e))?,
    };
    Ok(Resolved {
        db_dir: args.db_dir.clone().unwrap_or(file.db_dir),
        upload_dir: args.upload_dir.clone().unwrap_or(file.upload_dir),
        worker_threads: args.worker_threads.or(file.worker_threads),
        drain_timeout: Duration::from_secs_f64(file.drain_timeout_s),
        rtsp_probe_timeout: Duration::from_secs_f64(file.rtsp_probe_timeout_s),
        bind_addr,
        core,
    })
}

pub fn run(args: Args) -> Result<i32, Error> {
    let file = read_config(&args.config)?;
    let resolved = resolve(file, &args)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = resolved.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder
        .build()
        .map_err(|e| Error::wrap(base::ErrorKind::Fatal, "building the tokio runtime", e))?;
    let r = rt.block_on(async_run(resolved));

    // In the graceful path we've already waited for every job and
    // connection we care about; in the immediate-shutdown path we don't
    // want to wait for anything further.
    rt.shutdown_background();
    r
}

async fn async_run(resolved: Resolved) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();

    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| Error::wrap(base::ErrorKind::Fatal, "installing SIGINT handler", e))?;
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| Error::wrap(base::ErrorKind::Fatal, "installing SIGTERM handler", e))?;

    tokio::pin! {
        let inner = inner(resolved, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.shutdown();
        }
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.shutdown();
        }
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => {
            warn!("immediate shutdown due to a second SIGINT");
            Ok(1)
        }
        _ = term.recv() => {
            warn!("immediate shutdown due to a second SIGTERM");
            Ok(1)
        }
        result = &mut inner => result,
    }
}

async fn inner(resolved: Resolved, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    std::fs::create_dir_all(&resolved.db_dir)
        .map_err(|e| Error::wrap(base::ErrorKind::StoreError, format!("creating db dir {}", resolved.db_dir.display()), e))?;
    std::fs::create_dir_all(&resolved.upload_dir)
        .map_err(|e| Error::wrap(base::ErrorKind::StoreError, format!("creating upload dir {}", resolved.upload_dir.display()), e))?;

    let store = Arc::new(SqliteEventStore::open(
        &resolved.db_dir.join("events.db"),
        &resolved.db_dir.join("journal.jsonl"),
    )?);
    info!("Event store is open.");

    let detector: Arc<dyn core_lib::detect::Detector> = Arc::new(NullDetector);
    let sources = Arc::new(ProcessSources {
        rtsp: RtspDefaults {
            reconnect_attempts: resolved.core.rtsp_reconnect_attempts,
            reconnect_delay: resolved.core.rtsp_reconnect_delay,
        },
    });
    let manager = Arc::new(JobManager::new(
        resolved.core.manager_config(),
        detector,
        store.clone(),
        sources,
        RealClocks,
    ));

    let svc = Arc::new(web::Service::new(web::Config {
        manager: manager.clone(),
        store,
        upload_dir: resolved.upload_dir.clone(),
        rtsp_probe_timeout: resolved.rtsp_probe_timeout,
    }));

    let listener = TcpListener::bind(resolved.bind_addr)
        .await
        .map_err(|e| Error::wrap(base::ErrorKind::Fatal, format!("binding to {}", resolved.bind_addr), e))?;
    info!(addr = %resolved.bind_addr, "ready to serve HTTP requests");

    let web_result = serve(listener, svc, shutdown_rx).await;

    info!("waiting for jobs to drain");
    let graceful = manager.shutdown(resolved.drain_timeout).await;
    web_result?;

    if graceful {
        info!("exiting");
        Ok(0)
    } else {
        warn!("one or more jobs did not shut down gracefully");
        Ok(1)
    }
}

/// Accepts connections until shutdown is signaled, then waits for every
/// in-flight connection to finish (or be dropped by its client) before
/// returning. `hyper::Server::with_graceful_shutdown` doesn't exist in
/// hyper 1.x's stripped-down server surface, so this replaces it with
/// `hyper-util`'s `server-graceful` building blocks directly.
async fn serve(
    listener: TcpListener,
    svc: Arc<web::Service>,
    mut shutdown_rx: base::shutdown::Receiver,
) -> Result<(), Error> {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted
                    .map_err(|e| Error::wrap(base::ErrorKind::Fatal, "accepting a connection", e))?;
                let io = TokioIo::new(stream);
                let svc = svc.clone();
                let conn = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, hyper::service::service_fn(move |req| {
                        let svc = svc.clone();
                        async move { svc.serve(req).await }
                    }));
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %peer, error = %e, "connection error");
                    }
                });
            }
            _ = shutdown_rx.shutdown() => {
                info!("no longer accepting new connections");
                break;
            }
        }
    }

    graceful.shutdown().await;
    Ok(())
}
