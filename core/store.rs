// This file is part of linewatch, a video line-crossing counting service.
// Copyright (C) 2020 The linewatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Durable storage for crossing events: a small SQLite-backed store with
//! a bounded retry-with-backoff policy, falling back to an append-only
//! on-disk journal if the database itself is unavailable.

use crate::crossing::{CrossingEvent, Direction};
use crate::geometry::BBox;
use async_trait::async_trait;
use base::{err, Error, ErrorKind};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Column names are the REST/analytics contract, not an implementation
/// detail: `event_type`, a single JSON-array `bbox`, and `line_id` (always
/// 0 today; reserved for a job configuring more than one line) match what
/// `GET /jobs/{id}/events` promises callers.
const CREATE_EVENTS_SQL: &str = r#"
    create table if not exists event (
        id integer primary key,
        job_id text not null,
        camera_id text,
        track_id integer not null,
        event_type text not null,
        confidence real not null,
        timestamp text not null,
        frame_index integer not null,
        bbox text not null,
        line_id integer not null,
        notes text
    )
"#;

const CREATE_INDEXES_SQL: &[&str] = &[
    "create index if not exists event_timestamp on event (timestamp)",
    "create index if not exists event_job_id on event (job_id)",
    "create index if not exists event_event_type on event (event_type)",
    "create index if not exists event_camera_id on event (camera_id)",
];

const INSERT_EVENT_SQL: &str = r#"
    insert into event
        (job_id, camera_id, track_id, event_type, confidence, timestamp,
         frame_index, bbox, line_id, notes)
    values
        (:job_id, :camera_id, :track_id, :event_type, :confidence, :timestamp,
         :frame_index, :bbox, :line_id, :notes)
"#;

const SELECT_EVENTS_SQL: &str = r#"
    select
        id, job_id, camera_id, track_id, event_type, confidence, timestamp,
        frame_index, bbox, line_id, notes
    from event
    where job_id = :job_id
    order by frame_index
"#;

/// Every job today configures exactly one line; this is the `line_id`
/// persisted for all of its events until multi-line jobs exist.
const DEFAULT_LINE_ID: i64 = 0;

/// A persisted crossing event row, as read back via `EventStore::read_events`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub job_id: String,
    pub camera_id: Option<String>,
    pub track_id: u64,
    pub event_type: Direction,
    pub confidence: f32,
    pub timestamp: jiff::Timestamp,
    pub frame_index: u64,
    pub bbox: BBox,
    pub line_id: i64,
    pub notes: Option<String>,
}

/// What became of an event passed to `EventStore::record`. The worker
/// uses this to decide whether the in-memory entry/exit counters may be
/// incremented: only `Lost` means the event has no record anywhere, and
/// inflating the count for it would contradict the numbers a caller can
/// otherwise reconstruct from `GET /jobs/{id}/events`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Written to the primary store.
    Persisted,
    /// The primary store was unavailable after retrying; the event was
    /// appended to the durable fallback journal instead.
    Journaled,
}

/// Durable storage for crossing events, backing `POST /jobs/{id}` event
/// logs and any future analytics query. An `Err` from `record` means
/// the event was not persisted anywhere, not even the fallback journal;
/// the worker loop logs it and must not count it. A `Journaled` outcome
/// still means the event is safely recorded, just not yet queryable
/// through the primary store.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record(&self, job_id: &str, camera_id: Option<&str>, event: &CrossingEvent) -> Result<RecordOutcome, Error>;
    async fn read_events(&self, job_id: &str) -> Result<Vec<EventRecord>, Error>;
}

fn direction_str(d: Direction) -> &'static str {
    match d {
        Direction::Entry => "entry",
        Direction::Exit => "exit",
    }
}

fn direction_from_str(s: &str) -> Result<Direction, Error> {
    match s {
        "entry" => Ok(Direction::Entry),
        "exit" => Ok(Direction::Exit),
        other => Err(err!(StoreError, "unrecognized direction {other:?} in event row")),
    }
}

/// SQLite-backed `EventStore`. Connection access is serialized behind a
/// `parking_lot::Mutex`; rusqlite's blocking calls are therefore run on
/// the blocking thread pool via `tokio::task::spawn_blocking` rather
/// than held across an `.await`.
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
    journal_path: PathBuf,
}

impl SqliteEventStore {
    /// Opens (creating if needed) the event database at `db_path`, with
    /// `journal_path` as the durable fallback file used when a write
    /// fails after retrying.
    pub fn open(db_path: &Path, journal_path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(db_path)
            .map_err(|e| Error::wrap(ErrorKind::StoreError, format!("opening {}", db_path.display()), e))?;
        conn.execute(CREATE_EVENTS_SQL, [])
            .map_err(|e| Error::wrap(ErrorKind::StoreError, "creating event table", e))?;
        for stmt in CREATE_INDEXES_SQL {
            conn.execute(stmt, [])
                .map_err(|e| Error::wrap(ErrorKind::StoreError, "creating event index", e))?;
        }
        Ok(SqliteEventStore {
            conn: Arc::new(Mutex::new(conn)),
            journal_path: journal_path.to_owned(),
        })
    }

    fn insert_once(conn: &Connection, job_id: &str, camera_id: Option<&str>, event: &CrossingEvent) -> rusqlite::Result<()> {
        let bbox_json = serde_json::to_string(&event.bbox.as_array()).expect("array serializes");
        conn.execute(
            INSERT_EVENT_SQL,
            params![
                job_id,
                camera_id,
                event.track_id.0 as i64,
                direction_str(event.direction),
                event.confidence,
                event.timestamp.to_string(),
                event.frame_index as i64,
                bbox_json,
                DEFAULT_LINE_ID,
                Option::<&str>::None,
            ],
        )?;
        Ok(())
    }

    /// Appends a journal line so the event is not silently lost while
    /// the database is unavailable. Best-effort: a failure here is
    /// logged by the caller but does not itself escalate the job.
    fn journal(&self, job_id: &str, camera_id: Option<&str>, event: &CrossingEvent) -> std::io::Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        let line = serde_json::json!({
            "job_id": job_id,
            "camera_id": camera_id,
            "track_id": event.track_id.0,
            "event_type": direction_str(event.direction),
            "confidence": event.confidence,
            "timestamp": event.timestamp.to_string(),
            "frame_index": event.frame_index,
            "bbox": event.bbox.as_array(),
            "line_id": DEFAULT_LINE_ID,
        });
        writeln!(f, "{line}")
    }
}

const MAX_ATTEMPTS: u32 = 3;

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn record(&self, job_id: &str, camera_id: Option<&str>, event: &CrossingEvent) -> Result<RecordOutcome, Error> {
        let conn = self.conn.clone();
        let job_id_owned = job_id.to_owned();
        let camera_id_owned = camera_id.map(str::to_owned);
        let event_owned = event.clone();

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(50 * 2u64.pow(attempt))).await;
            }
            let conn = conn.clone();
            let job_id = job_id_owned.clone();
            let camera_id = camera_id_owned.clone();
            let event = event_owned.clone();
            let result = tokio::task::spawn_blocking(move || {
                let conn = conn.lock();
                Self::insert_once(&conn, &job_id, camera_id.as_deref(), &event)
            })
            .await;
            match result {
                Ok(Ok(())) => return Ok(RecordOutcome::Persisted),
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(e) => last_err = Some(e.to_string()),
            }
        }

        if let Err(io_err) = self.journal(job_id, camera_id, event) {
            return Err(err!(
                StoreError,
                "event insert failed after {MAX_ATTEMPTS} attempts ({}) and journal fallback also failed: {io_err}",
                last_err.unwrap_or_default()
            ));
        }
        tracing::warn!(
            job_id,
            attempts = MAX_ATTEMPTS,
            last_error = %last_err.unwrap_or_default(),
            journal = %self.journal_path.display(),
            "event insert failed; fell back to the durable journal",
        );
        Ok(RecordOutcome::Journaled)
    }

    async fn read_events(&self, job_id: &str) -> Result<Vec<EventRecord>, Error> {
        let conn = self.conn.clone();
        let job_id = job_id.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(SELECT_EVENTS_SQL)
                .map_err(|e| Error::wrap(ErrorKind::StoreError, "preparing select", e))?;
            let rows = stmt
                .query_map(params![job_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                })
                .map_err(|e| Error::wrap(ErrorKind::StoreError, "querying events", e))?;

            let mut out = Vec::new();
            for row in rows {
                let (id, job_id, camera_id, track_id, event_type, confidence, timestamp, frame_index, bbox_json, line_id, notes) =
                    row.map_err(|e| Error::wrap(ErrorKind::StoreError, "reading event row", e))?;
                let [x1, y1, x2, y2]: [i32; 4] = serde_json::from_str(&bbox_json)
                    .map_err(|e| Error::wrap(ErrorKind::StoreError, "parsing event bbox", e))?;
                out.push(EventRecord {
                    id,
                    job_id,
                    camera_id,
                    track_id: track_id as u64,
                    event_type: direction_from_str(&event_type)?,
                    confidence: confidence as f32,
                    timestamp: timestamp
                        .parse()
                        .map_err(|e| Error::wrap(ErrorKind::StoreError, "parsing event timestamp", e))?,
                    frame_index: frame_index as u64,
                    bbox: BBox::new(x1, y1, x2, y2)?,
                    line_id,
                    notes,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::wrap(ErrorKind::StoreError, "event read task panicked", e))?
    }
}

/// An in-memory test double, also handy for jobs that opt out of
/// persistence entirely.
#[derive(Default)]
pub struct FixtureEventStore {
    events: Mutex<Vec<(String, Option<String>, CrossingEvent)>>,
}

impl FixtureEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded_count(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl EventStore for FixtureEventStore {
    async fn record(&self, job_id: &str, camera_id: Option<&str>, event: &CrossingEvent) -> Result<RecordOutcome, Error> {
        self.events
            .lock()
            .push((job_id.to_owned(), camera_id.map(str::to_owned), event.clone()));
        Ok(RecordOutcome::Persisted)
    }

    async fn read_events(&self, job_id: &str) -> Result<Vec<EventRecord>, Error> {
        let events = self.events.lock();
        Ok(events
            .iter()
            .filter(|(j, _, _)| j == job_id)
            .enumerate()
            .map(|(i, (job_id, camera_id, event))| EventRecord {
                id: i as i64,
                job_id: job_id.clone(),
                camera_id: camera_id.clone(),
                track_id: event.track_id.0,
                event_type: event.direction,
                confidence: event.confidence,
                timestamp: event.timestamp,
                frame_index: event.frame_index,
                bbox: event.bbox,
                line_id: DEFAULT_LINE_ID,
                notes: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackId;

    fn event(track_id: u64, dir: Direction) -> CrossingEvent {
        CrossingEvent {
            track_id: TrackId(track_id),
            direction: dir,
            frame_index: 7,
            timestamp: jiff::Timestamp::from_second(1700000000).unwrap(),
            confidence: 0.92,
            bbox: BBox::new(0, 0, 10, 10).unwrap(),
        }
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_an_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db"), &dir.path().join("journal.jsonl")).unwrap();
        store.record("job-1", Some("cam-a"), &event(1, Direction::Entry)).await.unwrap();
        let rows = store.read_events("job-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].track_id, 1);
        assert_eq!(rows[0].event_type, Direction::Entry);
        assert_eq!(rows[0].camera_id.as_deref(), Some("cam-a"));
    }

    #[tokio::test]
    async fn read_events_is_scoped_to_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db"), &dir.path().join("journal.jsonl")).unwrap();
        store.record("job-1", None, &event(1, Direction::Entry)).await.unwrap();
        store.record("job-2", None, &event(2, Direction::Exit)).await.unwrap();
        let rows = store.read_events("job-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, "job-1");
    }

    #[tokio::test]
    async fn fixture_store_tracks_recorded_count() {
        let store = FixtureEventStore::new();
        store.record("job-1", None, &event(1, Direction::Entry)).await.unwrap();
        store.record("job-1", None, &event(1, Direction::Exit)).await.unwrap();
        assert_eq!(store.recorded_count(), 2);
        assert_eq!(store.read_events("job-1").await.unwrap().len(), 2);
    }
}
