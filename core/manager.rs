// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! C5: `JobManager`, the registry of all jobs a process is running:
//! admission control, routing control messages to the right worker, and
//! retention of terminated jobs' last-known status.

use crate::broadcaster::FrameBroadcaster;
use crate::detect::Detector;
use crate::encode::{FileVideoEncoder, NullVideoEncoder, VideoEncoder};
use crate::frame::FrameSource;
use crate::job::{ControlMsg, JobDescriptor, JobId, JobKind, JobStatus, Phase};
use crate::store::EventStore;
use crate::worker::{JobWorker, WorkerConfig};
use base::clock::Clocks;
use base::{err, Error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Process-wide caps and defaults applied to every submitted job.
#[derive(Clone)]
pub struct ManagerConfig {
    pub max_concurrent_jobs: usize,
    pub control_queue_cap: usize,
    pub job_retention: Duration,
    /// How long `stop()` waits for a worker to reach a terminal phase on
    /// its own before force-aborting its task. Distinct from an RTSP
    /// source's own internal reconnect-with-backoff, which lives below
    /// this watchdog and is never what it's waiting on.
    pub stop_grace: Duration,
    pub worker: WorkerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_concurrent_jobs: 4,
            control_queue_cap: 8,
            job_retention: Duration::from_secs(30 * 60),
            stop_grace: Duration::from_secs(10),
            worker: WorkerConfig::default(),
        }
    }
}

struct Entry {
    status: Arc<Mutex<JobStatus>>,
    control_tx: Option<mpsc::Sender<ControlMsg>>,
    broadcaster: Option<FrameBroadcaster>,
    camera_id: Option<String>,
    kind_is_file: bool,
    handle: Option<JoinHandle<Phase>>,
    abort: tokio::task::AbortHandle,
    /// Set when the job reaches a terminal phase; used to expire the
    /// entry after `job_retention`.
    terminated_at: Option<jiff::Timestamp>,
}

/// Constructs a `FrameSource` for a job descriptor. Injected so the
/// manager doesn't hard-code how RTSP sessions or file decoders are
/// built (and so tests can substitute fixtures).
pub trait SourceFactory: Send + Sync {
    fn build(&self, descriptor: &JobDescriptor) -> Result<Box<dyn FrameSource>, Error>;
}

pub struct JobManager<C: Clocks> {
    config: ManagerConfig,
    detector: Arc<dyn Detector>,
    store: Arc<dyn EventStore>,
    sources: Arc<dyn SourceFactory>,
    clocks: C,
    jobs: Mutex<HashMap<JobId, Entry>>,
}

impl<C: Clocks + Clone> JobManager<C> {
    pub fn new(
        config: ManagerConfig,
        detector: Arc<dyn Detector>,
        store: Arc<dyn EventStore>,
        sources: Arc<dyn SourceFactory>,
        clocks: C,
    ) -> Self {
        JobManager {
            config,
            detector,
            store,
            sources,
            clocks,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Admits and starts a new job, enforcing the concurrent-job cap and
    /// RTSP per-camera uniqueness.
    pub fn submit(&self, descriptor: JobDescriptor) -> Result<JobId, Error> {
        descriptor.validate()?;
        let camera_id = descriptor.camera_id().map(str::to_owned);

        let mut jobs = self.jobs.lock();
        self.expire_locked(&mut jobs);

        let running = jobs
            .values()
            .filter(|e| e.terminated_at.is_none())
            .count();
        if running >= self.config.max_concurrent_jobs {
            return Err(err!(
                ResourceExhausted,
                "at most {} concurrent jobs are allowed",
                self.config.max_concurrent_jobs
            ));
        }

        if let JobKind::RtspStream { camera_id: ref cam, .. } = descriptor.kind {
            let already_running = jobs.values().any(|e| {
                e.terminated_at.is_none() && e.camera_id.as_deref() == Some(cam.as_str())
            });
            if already_running {
                return Err(err!(
                    AlreadyExists,
                    "an RTSP job for camera {cam:?} is already running"
                ));
            }
        }

        let id = JobId::new();
        let kind_is_file = matches!(descriptor.kind, JobKind::FileVideo { .. });
        let source = self.sources.build(&descriptor)?;
        let encoder: Box<dyn VideoEncoder> = match &descriptor.kind {
            JobKind::FileVideo { output_path: Some(path), .. } => Box::new(FileVideoEncoder::create(path)?),
            JobKind::FileVideo { output_path: None, .. } | JobKind::RtspStream { .. } => Box::new(NullVideoEncoder),
        };
        let mut initial_status = JobStatus::pending(id);
        initial_status.camera_id = camera_id.clone();
        let status = Arc::new(Mutex::new(initial_status));
        let (control_tx, control_rx) = mpsc::channel(self.config.control_queue_cap);

        let worker = JobWorker::new(
            id,
            descriptor,
            self.config.worker.clone(),
            source,
            self.detector.clone(),
            self.store.clone(),
            encoder,
            status.clone(),
            control_rx,
            self.clocks.clone(),
        );
        let broadcaster = worker.broadcaster();

        let status_for_task = status.clone();
        let handle = tokio::spawn(async move {
            let phase = worker.run().await;
            status_for_task.lock().phase = phase;
            phase
        });
        let abort = handle.abort_handle();

        jobs.insert(
            id,
            Entry {
                status,
                control_tx: Some(control_tx),
                broadcaster: Some(broadcaster),
                camera_id,
                kind_is_file,
                handle: Some(handle),
                abort,
                terminated_at: None,
            },
        );
        Ok(id)
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus, Error> {
        let mut jobs = self.jobs.lock();
        self.expire_locked(&mut jobs);
        let entry = jobs.get(&id).ok_or_else(|| err!(NotFound, "no such job {id}"))?;
        Ok(entry.status.lock().clone())
    }

    pub fn broadcaster(&self, id: JobId) -> Result<FrameBroadcaster, Error> {
        let jobs = self.jobs.lock();
        let entry = jobs.get(&id).ok_or_else(|| err!(NotFound, "no such job {id}"))?;
        entry
            .broadcaster
            .clone()
            .ok_or_else(|| err!(NotFound, "job {id} has no live stream"))
    }

    pub fn list(&self) -> Vec<JobId> {
        let mut jobs = self.jobs.lock();
        self.expire_locked(&mut jobs);
        jobs.keys().copied().collect()
    }

    pub async fn pause(&self, id: JobId) -> Result<(), Error> {
        let phase = self.status(id)?.phase;
        if phase != Phase::Running {
            return Err(err!(InvalidState, "job {id} is {phase:?}, not RUNNING; cannot pause"));
        }
        self.send_control(id, ControlMsg::Pause).await
    }

    pub async fn resume(&self, id: JobId) -> Result<(), Error> {
        let phase = self.status(id)?.phase;
        if phase != Phase::Paused {
            return Err(err!(InvalidState, "job {id} is {phase:?}, not PAUSED; cannot resume"));
        }
        self.send_control(id, ControlMsg::Resume).await
    }

    /// Sends `Stop`, then arms a watchdog: if the job hasn't reached a
    /// terminal phase within `stop_grace`, its task is force-aborted and
    /// its status forced to `Stopped`. This is separate from an RTSP
    /// source's own internal reconnect-with-backoff, which the worker's
    /// read loop rides out on its own; the watchdog only guards against a
    /// worker that never observes the control message at all.
    pub async fn stop(&self, id: JobId) -> Result<(), Error> {
        self.send_control(id, ControlMsg::Stop).await?;

        let (status, abort) = {
            let jobs = self.jobs.lock();
            let entry = jobs.get(&id).ok_or_else(|| err!(NotFound, "no such job {id}"))?;
            (entry.status.clone(), entry.abort.clone())
        };
        let clocks = self.clocks.clone();
        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            clocks.sleep(grace).await;
            let mut status = status.lock();
            if !status.phase.is_terminal() {
                tracing::warn!(job = %id, "job did not stop within grace period; aborting");
                abort.abort();
                status.phase = Phase::Stopped;
            }
        });
        Ok(())
    }

    pub async fn seek(&self, id: JobId, delta: i64) -> Result<(), Error> {
        let kind_is_file = {
            let jobs = self.jobs.lock();
            let entry = jobs.get(&id).ok_or_else(|| err!(NotFound, "no such job {id}"))?;
            entry.kind_is_file
        };
        if !kind_is_file {
            return Err(err!(InvalidInput, "seek is only valid on a FILE_VIDEO job"));
        }
        self.send_control(id, ControlMsg::Seek(delta)).await
    }

    async fn send_control(&self, id: JobId, msg: ControlMsg) -> Result<(), Error> {
        let tx = {
            let jobs = self.jobs.lock();
            let entry = jobs.get(&id).ok_or_else(|| err!(NotFound, "no such job {id}"))?;
            match &entry.control_tx {
                Some(tx) => tx.clone(),
                None => return Err(err!(InvalidState, "job {id} is no longer accepting control messages")),
            }
        };
        tx.send(msg)
            .await
            .map_err(|_| err!(InvalidState, "job {id} already terminated"))
    }

    /// Broadcasts `Stop` to every running job, then waits up to
    /// `drain_timeout` for all of them to reach a terminal phase. Used
    /// on process shutdown. Returns `true` iff every job drained
    /// gracefully (no panic, no timeout) — the process uses this to
    /// pick its exit code.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        let handles: Vec<(JobId, mpsc::Sender<ControlMsg>, JoinHandle<Phase>)> = {
            let mut jobs = self.jobs.lock();
            jobs.iter_mut()
                .filter_map(|(id, e)| {
                    let tx = e.control_tx.clone()?;
                    let handle = e.handle.take()?;
                    Some((*id, tx, handle))
                })
                .collect()
        };
        for (_id, tx, _) in &handles {
            let _ = tx.send(ControlMsg::Stop).await;
        }
        let mut graceful = true;
        let deadline = tokio::time::sleep(drain_timeout);
        tokio::pin!(deadline);
        for (id, _, handle) in handles {
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::warn!(job = %id, error = %e, "job task panicked during shutdown");
                        graceful = false;
                    }
                }
                _ = &mut deadline => {
                    tracing::warn!(job = %id, "job did not stop within drain timeout");
                    graceful = false;
                }
            }
        }
        graceful
    }

    /// Drops entries whose terminal status has outlived `job_retention`.
    /// Must be called with `jobs` already locked.
    fn expire_locked(&self, jobs: &mut HashMap<JobId, Entry>) {
        let now = self.clocks.now();
        jobs.retain(|_, e| {
            if e.status.lock().phase.is_terminal() {
                let terminated_at = *e.terminated_at.get_or_insert(now);
                now.duration_since(terminated_at)
                    .try_into()
                    .map(|d: Duration| d < self.config.job_retention)
                    .unwrap_or(true)
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossing::LineConfig;
    use crate::detect::FixtureDetector;
    use crate::source::FixtureFrameSource;
    use crate::store::FixtureEventStore;
    use base::clock::SimulatedClocks;

    struct FixtureSources;

    impl SourceFactory for FixtureSources {
        fn build(&self, _descriptor: &JobDescriptor) -> Result<Box<dyn FrameSource>, Error> {
            Ok(Box::new(FixtureFrameSource::new(vec![])))
        }
    }

    fn descriptor_file() -> JobDescriptor {
        JobDescriptor {
            kind: JobKind::FileVideo {
                path: "/tmp/in.mp4".into(),
                output_path: None,
                camera_id: None,
            },
            line: LineConfig {
                p1: (50.0, 0.0),
                p2: (50.0, 100.0),
            },
            target_class: None,
            reversal_policy: None,
            count_enabled: true,
            fps_cap: None,
        }
    }

    fn descriptor_rtsp(camera: &str) -> JobDescriptor {
        JobDescriptor {
            kind: JobKind::RtspStream {
                camera_id: camera.to_string(),
                url: "rtsp://example.test/1".parse().unwrap(),
            },
            line: LineConfig {
                p1: (0.0, 50.0),
                p2: (100.0, 50.0),
            },
            target_class: None,
            reversal_policy: None,
            count_enabled: true,
            fps_cap: None,
        }
    }

    fn manager() -> JobManager<SimulatedClocks> {
        JobManager::new(
            ManagerConfig::default(),
            Arc::new(FixtureDetector::new(vec![])),
            Arc::new(FixtureEventStore::new()),
            Arc::new(FixtureSources),
            SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn submit_then_status_reports_pending_or_running() {
        let mgr = manager();
        let id = mgr.submit(descriptor_file()).unwrap();
        let status = mgr.status(id).unwrap();
        assert_eq!(status.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn resource_exhausted_past_concurrency_cap() {
        let mut config = ManagerConfig::default();
        config.max_concurrent_jobs = 1;
        let mgr = JobManager::new(
            config,
            Arc::new(FixtureDetector::new(vec![])),
            Arc::new(FixtureEventStore::new()),
            Arc::new(FixtureSources),
            SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap()),
        );
        mgr.submit(descriptor_file()).unwrap();
        let err = mgr.submit(descriptor_file()).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::ResourceExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_rtsp_camera_is_rejected() {
        let mgr = manager();
        mgr.submit(descriptor_rtsp("cam-a")).unwrap();
        let err = mgr.submit(descriptor_rtsp("cam-a")).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::AlreadyExists);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_job_id_is_not_found() {
        let mgr = manager();
        let err = mgr.status(JobId::new()).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_shutdown_drains_cleanly() {
        let mgr = manager();
        let id = mgr.submit(descriptor_file()).unwrap();
        mgr.stop(id).await.unwrap();
        assert!(mgr.shutdown(Duration::from_secs(5)).await);
        let status = mgr.status(id).unwrap();
        assert_eq!(status.phase, Phase::Stopped);
    }
}
