//! NDJSON spill files for telemetry rows the store could not take.
//!
//! Segments are named `heimdall_queue_YYYYMMDD_HHMMSS.queue` and hold one
//! `{"timestamp":…,"log":{…}}` object per line. Appends go to the newest segment;
//! draining reads from the oldest. A drained batch stays on disk until it is
//! committed, so a crash mid-flush replays rows instead of losing them.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::gateway::Clock;
use crate::gateway::store_types::HeimdallRequestLog;

pub const DEFAULT_SEGMENT_SIZE: u64 = 100 * 1024 * 1024;
/// Entries and segments older than this are discarded.
pub const MAX_ENTRY_AGE_SECS: i64 = 24 * 3600;

const SEGMENT_PREFIX: &str = "heimdall_queue_";
const SEGMENT_SUFFIX: &str = ".queue";

#[derive(Debug, Error)]
pub enum DiskQueueError {
    #[error("disk queue io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("disk queue json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("disk queue is closed")]
    Closed,
    #[error("disk queue lock poisoned")]
    Poisoned,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueEntry {
    /// Unix seconds at spill time.
    timestamp: i64,
    log: HeimdallRequestLog,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskQueueStats {
    pub available: bool,
    pub current_size: u64,
    pub segment_size: u64,
    pub file_count: usize,
}

/// Entries read from the head of the oldest segment, still present on disk.
#[derive(Debug, Default)]
pub struct QueueBatch {
    segment: Option<PathBuf>,
    /// Lines covered, including skipped stale or undecodable ones.
    consumed: usize,
    pub logs: Vec<HeimdallRequestLog>,
}

#[derive(Debug)]
struct Active {
    path: PathBuf,
    file: File,
    size: u64,
}

#[derive(Debug, Default)]
struct State {
    active: Option<Active>,
    closed: bool,
}

#[derive(Clone)]
pub struct DiskQueue {
    dir: PathBuf,
    segment_size: u64,
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DiskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQueue")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .finish()
    }
}

impl DiskQueue {
    /// Creates the directory and reopens the newest segment for appends.
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, DiskQueueError> {
        Self::with_segment_size(dir, DEFAULT_SEGMENT_SIZE, clock)
    }

    pub fn with_segment_size(
        dir: impl Into<PathBuf>,
        segment_size: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DiskQueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut state = State::default();
        if let Some(path) = list_segments(&dir)?.pop() {
            let file = OpenOptions::new().append(true).open(&path)?;
            let size = file.metadata()?.len();
            tracing::info!(path = %path.display(), size, "recovered telemetry disk queue segment");
            state.active = Some(Active { path, file, size });
        }

        Ok(Self {
            dir,
            segment_size: segment_size.max(1),
            state: Arc::new(Mutex::new(state)),
            clock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, log: &HeimdallRequestLog) -> Result<(), DiskQueueError> {
        let entry = QueueEntry {
            timestamp: self.clock.now_unix(),
            log: log.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut state = self.state.lock().map_err(|_| DiskQueueError::Poisoned)?;
        if state.closed {
            return Err(DiskQueueError::Closed);
        }
        let rotate = state
            .active
            .as_ref()
            .is_none_or(|active| active.size >= self.segment_size);
        if rotate {
            state.active = Some(self.new_segment()?);
        }
        let Some(active) = state.active.as_mut() else {
            return Err(DiskQueueError::Closed);
        };
        active.file.write_all(&line)?;
        active.file.sync_data()?;
        active.size += line.len() as u64;
        Ok(())
    }

    /// Reads up to `max` fresh entries from the oldest segment without removing them.
    pub fn peek_batch(&self, max: usize) -> Result<QueueBatch, DiskQueueError> {
        let state = self.state.lock().map_err(|_| DiskQueueError::Poisoned)?;
        if state.closed {
            return Err(DiskQueueError::Closed);
        }
        let Some(oldest) = list_segments(&self.dir)?.into_iter().next() else {
            return Ok(QueueBatch::default());
        };

        let cutoff = self.clock.now_unix().saturating_sub(MAX_ENTRY_AGE_SECS);
        let mut logs = Vec::new();
        let mut consumed = 0usize;
        let mut stale = 0usize;
        for line in BufReader::new(File::open(&oldest)?).lines() {
            if logs.len() >= max {
                break;
            }
            let line = line?;
            consumed += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry: QueueEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable disk queue entry");
                    continue;
                }
            };
            if entry.timestamp < cutoff {
                stale += 1;
                continue;
            }
            logs.push(entry.log);
        }
        if stale > 0 {
            tracing::info!(stale, "discarding expired disk queue entries");
        }
        Ok(QueueBatch {
            segment: Some(oldest),
            consumed,
            logs,
        })
    }

    /// Drops the lines a peeked batch covered; an emptied inactive segment is deleted.
    pub fn commit(&self, batch: &QueueBatch) -> Result<(), DiskQueueError> {
        let Some(segment) = batch.segment.as_ref() else {
            return Ok(());
        };
        let mut state = self.state.lock().map_err(|_| DiskQueueError::Poisoned)?;
        if state.closed {
            return Err(DiskQueueError::Closed);
        }
        if !segment.exists() {
            return Ok(());
        }
        let rest = BufReader::new(File::open(segment)?)
            .lines()
            .skip(batch.consumed)
            .filter(|line| !matches!(line, Ok(line) if line.trim().is_empty()))
            .collect::<Result<Vec<_>, _>>()?;

        let is_active = state
            .active
            .as_ref()
            .is_some_and(|active| &active.path == segment);
        if rest.is_empty() && !is_active {
            fs::remove_file(segment)?;
            return Ok(());
        }
        if batch.consumed == 0 {
            return Ok(());
        }

        let tmp = segment.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for line in &rest {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, segment)?;

        if is_active {
            let file = OpenOptions::new().append(true).open(segment)?;
            let size = file.metadata()?.len();
            state.active = Some(Active {
                path: segment.clone(),
                file,
                size,
            });
        }
        Ok(())
    }

    /// Peeks and commits in one step.
    pub fn dequeue_batch(&self, max: usize) -> Result<Vec<HeimdallRequestLog>, DiskQueueError> {
        let batch = self.peek_batch(max)?;
        self.commit(&batch)?;
        Ok(batch.logs)
    }

    /// Deletes inactive segments last modified more than a day ago.
    pub fn cleanup(&self) -> Result<usize, DiskQueueError> {
        let state = self.state.lock().map_err(|_| DiskQueueError::Poisoned)?;
        let active = state.active.as_ref().map(|active| active.path.clone());
        let cutoff = self.clock.now_unix().saturating_sub(MAX_ENTRY_AGE_SECS);

        let mut removed = 0;
        for path in list_segments(&self.dir)? {
            if active.as_ref() == Some(&path) {
                continue;
            }
            let modified = fs::metadata(&path)?
                .modified()?
                .duration_since(std::time::UNIX_EPOCH)
                .map(|age| i64::try_from(age.as_secs()).unwrap_or(i64::MAX))
                .unwrap_or(0);
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        tracing::info!(path = %path.display(), "removed old disk queue segment");
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove disk queue segment");
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Entries still spilled, across all segments.
    pub fn pending(&self) -> Result<usize, DiskQueueError> {
        let _guard = self.state.lock().map_err(|_| DiskQueueError::Poisoned)?;
        let mut total = 0;
        for path in list_segments(&self.dir)? {
            total += BufReader::new(File::open(&path)?)
                .lines()
                .map_while(Result::ok)
                .filter(|line| !line.trim().is_empty())
                .count();
        }
        Ok(total)
    }

    pub fn stats(&self) -> DiskQueueStats {
        let file_count = list_segments(&self.dir).map(|files| files.len()).unwrap_or(0);
        match self.state.lock() {
            Ok(state) => DiskQueueStats {
                available: !state.closed,
                current_size: state.active.as_ref().map(|active| active.size).unwrap_or(0),
                segment_size: self.segment_size,
                file_count,
            },
            Err(_) => DiskQueueStats {
                available: false,
                segment_size: self.segment_size,
                file_count,
                ..DiskQueueStats::default()
            },
        }
    }

    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.active = None;
        }
    }

    fn new_segment(&self) -> Result<Active, DiskQueueError> {
        let now = OffsetDateTime::from_unix_timestamp(self.clock.now_unix())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let stamp = now
            .format(format_description!("[year][month][day]_[hour][minute][second]"))
            .unwrap_or_else(|_| "00000000_000000".to_string());

        let mut path = self.dir.join(format!("{SEGMENT_PREFIX}{stamp}{SEGMENT_SUFFIX}"));
        let mut n = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("{SEGMENT_PREFIX}{stamp}_{n}{SEGMENT_SUFFIX}"));
            n += 1;
        }
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), "opened disk queue segment");
        Ok(Active {
            path,
            file,
            size: 0,
        })
    }
}

/// Segment files sorted oldest first.
fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, DiskQueueError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_segment = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX));
        if is_segment {
            segments.push(path);
        }
    }
    segments.sort_by_cached_key(|path| segment_order(path));
    Ok(segments)
}

/// `(stamp, n)` for `heimdall_queue_<stamp>[_<n>].queue`; the unsuffixed name sorts first.
fn segment_order(path: &Path) -> (String, u64) {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let core = name
        .strip_prefix(SEGMENT_PREFIX)
        .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        .unwrap_or(name);
    // Stamps are `YYYYMMDD_HHMMSS`.
    match core.get(15..).and_then(|tail| tail.strip_prefix('_')) {
        Some(seq) => (
            core[..15].to_string(),
            seq.parse::<u64>().unwrap_or(u64::MAX),
        ),
        None => (core.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gateway::ManualClock;

    fn log(id: &str) -> HeimdallRequestLog {
        HeimdallRequestLog {
            request_id: id.to_string(),
            ..HeimdallRequestLog::default()
        }
    }

    #[test]
    fn append_then_drain_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let queue = DiskQueue::open(dir.path(), clock).expect("open");
        for id in ["a", "b", "c"] {
            queue.append(&log(id)).expect("append");
        }
        assert_eq!(queue.pending().expect("pending"), 3);

        let first = queue.dequeue_batch(2).expect("batch");
        assert_eq!(
            first.iter().map(|l| l.request_id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
        let second = queue.dequeue_batch(2).expect("batch");
        assert_eq!(second.len(), 1);
        assert_eq!(queue.pending().expect("pending"), 0);
    }

    #[test]
    fn rotates_segments_and_recovers_on_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let queue = DiskQueue::with_segment_size(dir.path(), 10, clock.clone()).expect("open");
        queue.append(&log("a")).expect("append");
        queue.append(&log("b")).expect("append");
        let stats = queue.stats();
        assert_eq!(stats.file_count, 2);
        assert!(stats.available);

        let name = list_segments(dir.path()).expect("list")[0]
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .expect("name");
        assert_eq!(name, "heimdall_queue_20231114_221320.queue");
        queue.close();
        assert!(matches!(queue.append(&log("c")), Err(DiskQueueError::Closed)));

        let reopened = DiskQueue::open(dir.path(), clock).expect("reopen");
        assert_eq!(reopened.pending().expect("pending"), 2);
        let drained = reopened.dequeue_batch(10).expect("batch");
        assert_eq!(drained[0].request_id, "a");
        assert_eq!(list_segments(dir.path()).expect("list").len(), 1);
    }

    #[test]
    fn collision_suffixes_sort_numerically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let queue = DiskQueue::with_segment_size(dir.path(), 1, clock).expect("open");
        for i in 0..12 {
            queue.append(&log(&format!("r{i}"))).expect("append");
        }
        let names: Vec<String> = list_segments(dir.path())
            .expect("list")
            .iter()
            .filter_map(|path| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "heimdall_queue_20231114_221320.queue");
        assert_eq!(names[2], "heimdall_queue_20231114_221320_2.queue");
        assert_eq!(names[10], "heimdall_queue_20231114_221320_10.queue");

        let drained: Vec<String> = (0..12)
            .flat_map(|_| queue.dequeue_batch(1).expect("batch"))
            .map(|log| log.request_id)
            .collect();
        let expected: Vec<String> = (0..12).map(|i| format!("r{i}")).collect();
        assert_eq!(drained, expected);
    }

    #[test]
    fn peeked_rows_stay_until_committed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let queue = DiskQueue::open(dir.path(), clock.clone()).expect("open");
        for id in ["a", "b", "c"] {
            queue.append(&log(id)).expect("append");
        }

        let batch = queue.peek_batch(2).expect("peek");
        assert_eq!(batch.logs.len(), 2);
        // Nothing is removed before the commit, so a restart replays the batch.
        let reopened = DiskQueue::open(dir.path(), clock).expect("reopen");
        assert_eq!(reopened.pending().expect("pending"), 3);

        queue.append(&log("d")).expect("append");
        queue.commit(&batch).expect("commit");
        let rest: Vec<String> = queue
            .dequeue_batch(10)
            .expect("batch")
            .into_iter()
            .map(|log| log.request_id)
            .collect();
        assert_eq!(rest, ["c", "d"]);
    }

    #[test]
    fn stale_entries_are_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let queue = DiskQueue::open(dir.path(), clock.clone()).expect("open");
        queue.append(&log("old")).expect("append");
        clock.advance(Duration::from_secs(25 * 3600));
        queue.append(&log("new")).expect("append");

        let drained = queue.dequeue_batch(10).expect("batch");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].request_id, "new");
    }
}
