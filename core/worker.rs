// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! C4: `JobWorker`, the tokio task that drives one job from `Pending`
//! to a terminal phase: read a frame, detect, track, test the line,
//! annotate, encode, publish, repeat.

use crate::broadcaster::FrameBroadcaster;
use crate::crossing::{CrossingConfig, LineCrossingCounter};
use crate::detect::{filter_detections, Detector};
use crate::encode::{encode_jpeg, VideoEncoder, DEFAULT_JPEG_QUALITY};
use crate::frame::{EncodedFrame, FrameSource, NextFrame};
use crate::job::{ControlMsg, JobDescriptor, JobId, JobStatus, Phase};
use crate::store::EventStore;
use crate::track::{MultiObjectTracker, TrackerConfig};
use base::clock::Clocks;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tunables a `JobWorker` needs beyond the job descriptor itself; these
/// come from the process-wide config envelope.
#[derive(Clone)]
pub struct WorkerConfig {
    pub tracker: TrackerConfig,
    pub crossing: CrossingConfig,
    pub min_det_conf: f32,
    pub jpeg_quality: u8,
    pub fps_cap: Option<f64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            tracker: TrackerConfig::default(),
            crossing: CrossingConfig::default(),
            min_det_conf: 0.3,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            fps_cap: None,
        }
    }
}

pub struct JobWorker<C: Clocks> {
    id: JobId,
    descriptor: JobDescriptor,
    config: WorkerConfig,
    source: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    store: Arc<dyn EventStore>,
    encoder: Box<dyn VideoEncoder>,
    broadcaster: FrameBroadcaster,
    status: Arc<Mutex<JobStatus>>,
    control_rx: mpsc::Receiver<ControlMsg>,
    clocks: C,
}

impl<C: Clocks> JobWorker<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: JobId,
        descriptor: JobDescriptor,
        config: WorkerConfig,
        source: Box<dyn FrameSource>,
        detector: Arc<dyn Detector>,
        store: Arc<dyn EventStore>,
        encoder: Box<dyn VideoEncoder>,
        status: Arc<Mutex<JobStatus>>,
        control_rx: mpsc::Receiver<ControlMsg>,
        clocks: C,
    ) -> Self {
        JobWorker {
            id,
            descriptor,
            config,
            source,
            detector,
            store,
            encoder,
            broadcaster: FrameBroadcaster::new(),
            status,
            control_rx,
            clocks,
        }
    }

    pub fn broadcaster(&self) -> FrameBroadcaster {
        self.broadcaster.clone()
    }

    fn set_phase(&self, phase: Phase) {
        let mut status = self.status.lock();
        status.phase = phase;
    }

    /// Runs the job to completion (or until stopped/failed). Consumes
    /// `self`; the returned phase is always terminal.
    pub async fn run(mut self) -> Phase {
        self.set_phase(Phase::Running);
        let start = self.clocks.now();

        let mut tracker = MultiObjectTracker::new(self.config.tracker);
        let mut crossing_config = self.config.crossing;
        if let Some(policy) = self.descriptor.reversal_policy {
            crossing_config.reversal_policy = policy;
        }
        let mut counter = LineCrossingCounter::new(crossing_config);
        let mut last_tick = self.clocks.now();
        let mut ewma_fps: Option<f64> = None;
        // A descriptor's own `fps_cap` overrides the process-wide default
        // for this job only; `Some(0.0)` or below means unthrottled.
        let fps_cap = self.descriptor.fps_cap.or(self.config.fps_cap).filter(|&cap| cap > 0.0);

        let final_phase = 'outer: loop {
            // 1. Drain pending control messages without blocking.
            while let Ok(msg) = self.control_rx.try_recv() {
                match msg {
                    ControlMsg::Stop => break 'outer Phase::Stopped,
                    ControlMsg::Pause => {
                        self.set_phase(Phase::Paused);
                        match self.wait_while_paused().await {
                            Some(Phase::Stopped) => break 'outer Phase::Stopped,
                            _ => self.set_phase(Phase::Running),
                        }
                    }
                    ControlMsg::Resume => {} // idempotent: already running
                    ControlMsg::Seek(delta) => {
                        if let Err(e) = self.source.seek(delta).await {
                            tracing::warn!(job = %self.id, error = %e, "seek failed");
                        } else {
                            tracker.reset();
                            counter.reset_trajectories();
                        }
                    }
                }
            }

            // 2. fps-cap pacing.
            if let Some(cap) = fps_cap {
                let min_interval = Duration::from_secs_f64(1.0 / cap);
                let elapsed = self.clocks.now().duration_since(last_tick);
                if let Ok(elapsed) = elapsed.try_into() {
                    let elapsed: Duration = elapsed;
                    if elapsed < min_interval {
                        self.clocks.sleep(min_interval - elapsed).await;
                    }
                }
            }
            let tick_start = self.clocks.now();

            // 3. Read the next frame. A live RTSP source's own
            // reconnect-with-backoff lives inside this call and can
            // legitimately take much longer than one tick; the manager's
            // `stop()` watchdog, not a per-frame timeout here, is what
            // force-unblocks a truly stuck job.
            let frame = match self.source.next().await {
                Ok(NextFrame::Frame(f)) => f,
                Ok(NextFrame::Ended) => break 'outer Phase::Completed,
                Err(e) => {
                    tracing::error!(job = %self.id, error = %e, "frame source failed");
                    self.status.lock().error = Some(e.to_string());
                    break 'outer Phase::Failed;
                }
            };
            if let Err(e) = frame.validate() {
                tracing::error!(job = %self.id, error = %e, "frame validation failed");
                self.status.lock().error = Some(e.to_string());
                break 'outer Phase::Failed;
            }

            // 4. Detect + filter. A DETECTOR_ERROR is retried once for
            // this frame before the frame is dropped (empty detections,
            // job keeps running) rather than failing the whole job.
            let detections = match self.detector.detect(&frame).await {
                Ok(d) => d,
                Err(first_err) => {
                    tracing::warn!(job = %self.id, error = %first_err, "detector failed for frame; retrying once");
                    match self.detector.detect(&frame).await {
                        Ok(d) => d,
                        Err(e) => {
                            tracing::warn!(job = %self.id, error = %e, "detector failed again; dropping frame's detections");
                            Vec::new()
                        }
                    }
                }
            };
            let detections = filter_detections(detections, self.descriptor.target_class, self.config.min_det_conf);

            // 5. Track.
            let tracks = tracker.step(frame.index, &detections);

            // 6. Line-crossing test, then persist + count. Skipped
            // entirely when the job opted out of counting: the line is
            // still annotated below, but no track ever crosses it.
            let line = self.descriptor.line.resolve(frame.width, frame.height);
            let counter_step = if self.descriptor.count_enabled {
                counter.step(frame.index, frame.timestamp, line, tracks)
            } else {
                Ok(Vec::new())
            };
            match counter_step {
                Ok(events) => {
                    for event in &events {
                        let recorded = self
                            .store
                            .record(&self.id.to_string(), self.descriptor.camera_id(), event)
                            .await;
                        match recorded {
                            Ok(_) => {
                                let mut status = self.status.lock();
                                match event.direction {
                                    crate::crossing::Direction::Entry => status.entry_count += 1,
                                    crate::crossing::Direction::Exit => status.exit_count += 1,
                                }
                            }
                            Err(e) => {
                                // Not journaled either: counting this event
                                // would inflate the in-memory total past what
                                // GET /jobs/{id}/events can ever show.
                                tracing::warn!(job = %self.id, error = %e, "event lost; not counted");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(job = %self.id, error = %e, "crossing test rejected this frame");
                }
            }

            // 7. Annotate + encode + publish.
            let (entry_count, exit_count) = {
                let status = self.status.lock();
                (status.entry_count, status.exit_count)
            };
            let mut img = match image::RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone()) {
                Some(img) => img,
                None => {
                    tracing::error!(job = %self.id, "frame buffer size mismatch during annotate");
                    self.status.lock().error = Some("frame buffer size mismatch".to_string());
                    break 'outer Phase::Failed;
                }
            };
            crate::annotate::annotate(&mut img, tracker.tracks(), line, entry_count, exit_count);
            match encode_jpeg(&img, self.config.jpeg_quality) {
                Ok(jpeg) => {
                    let encoded = EncodedFrame {
                        index: frame.index,
                        timestamp: frame.timestamp,
                        jpeg,
                    };
                    self.broadcaster.publish(encoded.clone());
                    if let Err(e) = self.encoder.write_frame(&encoded) {
                        tracing::warn!(job = %self.id, error = %e, "writing output video frame failed");
                    }
                }
                Err(e) => tracing::warn!(job = %self.id, error = %e, "JPEG encode failed; skipping publish"),
            }

            // 8. Update status (fps EWMA, counters, stream properties).
            let now = self.clocks.now();
            let frame_dt = now.duration_since(tick_start);
            if let Ok(frame_dt) = Duration::try_from(frame_dt) {
                if frame_dt > Duration::ZERO {
                    let inst_fps = 1.0 / frame_dt.as_secs_f64();
                    ewma_fps = Some(match ewma_fps {
                        Some(prev) => 0.8 * prev + 0.2 * inst_fps,
                        None => inst_fps,
                    });
                }
            }
            last_tick = tick_start;
            {
                let mut status = self.status.lock();
                status.frames_in += 1;
                status.frames_out += 1;
                status.last_frame_index = frame.index;
                status.fps_measured = ewma_fps;
                status.stream_properties = self.source.properties();
                status.progress = status
                    .stream_properties
                    .and_then(|p| p.total_frames)
                    .filter(|&total| total > 0)
                    .map(|total| (status.frames_in as f64 / total as f64).min(1.0));
                if let Ok(uptime) = now.duration_since(start).try_into() {
                    let uptime: Duration = uptime;
                    status.uptime_s = uptime.as_secs_f64();
                }
            }
        };

        self.broadcaster.close();
        if let Err(e) = self.encoder.finish() {
            tracing::error!(job = %self.id, error = %e, "finishing output video failed");
        }
        self.set_phase(final_phase);
        final_phase
    }

    /// Blocks until a `Resume` or `Stop` control message arrives while
    /// paused. Returns `Some(Phase::Stopped)` if stopped while paused,
    /// `None` on resume.
    async fn wait_while_paused(&mut self) -> Option<Phase> {
        loop {
            match self.control_rx.recv().await {
                Some(ControlMsg::Resume) | None => return None,
                Some(ControlMsg::Stop) => return Some(Phase::Stopped),
                Some(ControlMsg::Pause) => continue,
                Some(ControlMsg::Seek(_)) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossing::LineConfig;
    use crate::detect::FixtureDetector;
    use crate::frame::Frame;
    use crate::job::{JobDescriptor, JobKind};
    use crate::source::FixtureFrameSource;
    use crate::store::FixtureEventStore;
    use base::clock::SimulatedClocks;

    fn solid_frame(index: u64, fill: u8) -> Frame {
        Frame {
            index,
            timestamp: jiff::Timestamp::from_second(index as i64).unwrap(),
            width: 10,
            height: 10,
            rgb: vec![fill; 300],
        }
    }

    fn descriptor() -> JobDescriptor {
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

    #[tokio::test(start_paused = true)]
    async fn worker_completes_when_source_ends() {
        let id = JobId::new();
        let status = Arc::new(Mutex::new(JobStatus::pending(id)));
        let (_tx, rx) = mpsc::channel(8);
        let worker = JobWorker::new(
            id,
            descriptor(),
            WorkerConfig::default(),
            Box::new(FixtureFrameSource::new(vec![solid_frame(0, 10), solid_frame(1, 20)])),
            Arc::new(FixtureDetector::new(vec![])),
            Arc::new(FixtureEventStore::new()),
            Box::new(crate::encode::NullVideoEncoder),
            status.clone(),
            rx,
            SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap()),
        );
        let phase = worker.run().await;
        assert_eq!(phase, Phase::Completed);
        assert_eq!(status.lock().frames_in, 2);
    }

    // A box sliding back and forth across the vertical line at x=100 in a
    // 200x200 frame: frames 0-1 sit left of the line, frame 2 crosses right,
    // frame 3 crosses back left, frame 4 crosses right again (same direction
    // as the first crossing).
    fn sliding_box_frames_and_detections() -> (Vec<Frame>, Vec<Vec<crate::detect::Detection>>) {
        let centers = [70, 90, 110, 90, 110];
        let frames = centers
            .iter()
            .enumerate()
            .map(|(i, _)| Frame {
                index: i as u64,
                timestamp: jiff::Timestamp::from_second(i as i64).unwrap(),
                width: 200,
                height: 200,
                rgb: vec![0; 200 * 200 * 3],
            })
            .collect();
        let detections = centers
            .iter()
            .map(|&cx| {
                vec![crate::detect::Detection {
                    bbox: crate::geometry::BBox::new(cx - 20, 80, cx + 20, 120).unwrap(),
                    confidence: 0.9,
                    class_id: 0,
                }]
            })
            .collect();
        (frames, detections)
    }

    async fn run_sliding_box(reversal_policy: Option<crate::crossing::ReversalPolicy>) -> (u64, u64) {
        let id = JobId::new();
        let status = Arc::new(Mutex::new(JobStatus::pending(id)));
        let (_tx, rx) = mpsc::channel(8);
        let mut d = descriptor();
        d.line = LineConfig {
            p1: (50.0, 0.0),
            p2: (50.0, 100.0),
        };
        d.reversal_policy = reversal_policy;
        let (frames, detections) = sliding_box_frames_and_detections();
        let worker = JobWorker::new(
            id,
            d,
            WorkerConfig::default(),
            Box::new(FixtureFrameSource::new(frames)),
            Arc::new(FixtureDetector::new(detections)),
            Arc::new(FixtureEventStore::new()),
            Box::new(crate::encode::NullVideoEncoder),
            status.clone(),
            rx,
            SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap()),
        );
        let phase = worker.run().await;
        assert_eq!(phase, Phase::Completed);
        let status = status.lock();
        (status.entry_count, status.exit_count)
    }

    #[tokio::test(start_paused = true)]
    async fn default_reversal_policy_allows_reversal() {
        let (entry, exit) = run_sliding_box(None).await;
        assert_eq!(entry + exit, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn descriptor_reversal_policy_overrides_the_process_default() {
        let (entry, exit) = run_sliding_box(Some(crate::crossing::ReversalPolicy::FirstOnly)).await;
        assert_eq!(entry + exit, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_control_message_stops_the_job() {
        let id = JobId::new();
        let status = Arc::new(Mutex::new(JobStatus::pending(id)));
        let (tx, rx) = mpsc::channel(8);
        tx.send(ControlMsg::Stop).await.unwrap();
        let worker = JobWorker::new(
            id,
            descriptor(),
            WorkerConfig::default(),
            Box::new(FixtureFrameSource::new(vec![solid_frame(0, 10), solid_frame(1, 20)])),
            Arc::new(FixtureDetector::new(vec![])),
            Arc::new(FixtureEventStore::new()),
            Box::new(crate::encode::NullVideoEncoder),
            status.clone(),
            rx,
            SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap()),
        );
        let phase = worker.run().await;
        assert_eq!(phase, Phase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn descriptor_fps_cap_overrides_the_process_default() {
        let id = JobId::new();
        let status = Arc::new(Mutex::new(JobStatus::pending(id)));
        let (_tx, rx) = mpsc::channel(8);
        let mut d = descriptor();
        // Process default paces to 1 fps; the job asks for effectively no cap.
        d.fps_cap = Some(1000.0);
        let mut config = WorkerConfig::default();
        config.fps_cap = Some(1.0);
        let worker = JobWorker::new(
            id,
            d,
            config,
            Box::new(FixtureFrameSource::new(vec![
                solid_frame(0, 10),
                solid_frame(1, 20),
                solid_frame(2, 30),
            ])),
            Arc::new(FixtureDetector::new(vec![])),
            Arc::new(FixtureEventStore::new()),
            Box::new(crate::encode::NullVideoEncoder),
            status.clone(),
            rx,
            SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap()),
        );
        let phase = worker.run().await;
        assert_eq!(phase, Phase::Completed);
        // At 1000fps, three frames take well under the 1fps cap's ~2s.
        assert!(status.lock().uptime_s < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn process_default_fps_cap_applies_when_job_has_none() {
        let id = JobId::new();
        let status = Arc::new(Mutex::new(JobStatus::pending(id)));
        let (_tx, rx) = mpsc::channel(8);
        let d = descriptor();
        let mut config = WorkerConfig::default();
        config.fps_cap = Some(1.0);
        let worker = JobWorker::new(
            id,
            d,
            config,
            Box::new(FixtureFrameSource::new(vec![
                solid_frame(0, 10),
                solid_frame(1, 20),
                solid_frame(2, 30),
            ])),
            Arc::new(FixtureDetector::new(vec![])),
            Arc::new(FixtureEventStore::new()),
            Box::new(crate::encode::NullVideoEncoder),
            status.clone(),
            rx,
            SimulatedClocks::new(jiff::Timestamp::from_second(0).unwrap()),
        );
        let phase = worker.run().await;
        assert_eq!(phase, Phase::Completed);
        // Three frames at 1fps: ~2s of pacing between them.
        assert!(status.lock().uptime_s >= 1.9);
    }
}
