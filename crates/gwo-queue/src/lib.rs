// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-queue
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The job queue contract and its two interchangeable backends: an
//! ephemeral in-memory priority heap, and a named append-only stream on
//! disk. Both accept a serializable job record and expose the same
//! `enqueue` / bounded-wait `drain` surface.
//!
//! Ordering: the memory backend pops strictly by priority, FIFO within a
//! priority. The stream backend is FIFO in append order (priority is
//! recorded with the entry and preserved for re-enqueue). Fairness across
//! tenants is admission's job, not the queue's.

use async_trait::async_trait;
use gwo_core::{Dag, Run};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue has reached its maximum capacity.
    #[error("queue is full (max {max})")]
    Full {
        /// Maximum number of jobs the queue can hold.
        max: usize,
    },
    /// Stream backend I/O failure.
    #[error("queue io: {0}")]
    Io(#[from] std::io::Error),
    /// A job record could not be (de)serialized.
    #[error("queue serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A queued unit of work: the run record plus the DAG it executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// The run, still in `queued` state.
    pub run: Run,
    /// The DAG to execute.
    pub dag: Dag,
    /// Priority this job was submitted with (kept for re-enqueue).
    pub prio: u8,
}

/// The queue contract shared by both backends.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job at the given priority.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] for a bounded backend at capacity, or I/O and
    /// serialization failures from the stream backend.
    fn enqueue(&self, job: Job, prio: u8) -> Result<(), QueueError>;

    /// Remove and return the next job, waiting up to `timeout` for one to
    /// arrive. `None` on timeout.
    async fn drain(&self, timeout: Duration) -> Option<Job>;

    /// Number of jobs currently waiting.
    fn len(&self) -> usize;

    /// `true` when no jobs are waiting.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct HeapEntry {
    prio: u8,
    seq: u64,
    job: Job,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.prio == other.prio && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap: higher priority wins; within a priority the lower sequence
    // number (older entry) wins.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.prio
            .cmp(&other.prio)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Ephemeral in-memory priority queue. Contents are lost at shutdown,
/// which is accepted for this backend.
pub struct MemoryQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    seq: AtomicU64,
    notify: Notify,
    max_size: usize,
}

impl MemoryQueue {
    /// Create an effectively unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Create a queue that rejects jobs beyond `max_size`.
    #[must_use]
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            max_size,
        }
    }

    fn pop(&self) -> Option<Job> {
        self.heap
            .lock()
            .ok()
            .and_then(|mut h| h.pop())
            .map(|e| e.job)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn enqueue(&self, job: Job, prio: u8) -> Result<(), QueueError> {
        {
            let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
            if heap.len() >= self.max_size {
                return Err(QueueError::Full { max: self.max_size });
            }
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            heap.push(HeapEntry { prio, seq, job });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.pop() {
                return Some(job);
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    fn len(&self) -> usize {
        self.heap.lock().map(|h| h.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Append-only stream backend
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StreamEntry {
    prio: u8,
    job: Job,
}

/// Named append-only stream on disk.
///
/// Entries are JSON lines appended to the stream file; a sidecar cursor
/// file records how many entries have been consumed. `drain` reads the
/// next entry past the cursor and advances it (the best-effort delete of
/// the upstream contract). Queue contents survive restarts.
pub struct StreamQueue {
    path: PathBuf,
    cursor_path: PathBuf,
    lock: Mutex<()>,
    notify: Notify,
}

/// How often the stream backend re-checks the file for entries appended by
/// other processes.
const STREAM_POLL: Duration = Duration::from_millis(100);

impl StreamQueue {
    /// Open (or create) the stream at `path`. The cursor lives alongside
    /// it as `<path>.cursor`.
    ///
    /// # Errors
    ///
    /// I/O failures creating the files.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let mut cursor_os = path.as_os_str().to_os_string();
        cursor_os.push(".cursor");
        let cursor_path = PathBuf::from(cursor_os);
        if !path.exists() {
            std::fs::write(&path, b"")?;
        }
        if !cursor_path.exists() {
            std::fs::write(&cursor_path, b"0")?;
        }
        Ok(Self {
            path,
            cursor_path,
            lock: Mutex::new(()),
            notify: Notify::new(),
        })
    }

    fn read_cursor(&self) -> usize {
        std::fs::read_to_string(&self.cursor_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn entries(&self) -> Result<Vec<String>, QueueError> {
        Ok(std::fs::read_to_string(&self.path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn try_consume(&self) -> Result<Option<Job>, QueueError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = self.read_cursor();
        let entries = self.entries()?;
        let Some(line) = entries.get(cursor) else {
            return Ok(None);
        };
        let entry: StreamEntry = serde_json::from_str(line)?;
        // Best-effort delete: advancing the cursor consumes the entry.
        let _ = std::fs::write(&self.cursor_path, (cursor + 1).to_string());
        Ok(Some(entry.job))
    }
}

#[async_trait]
impl JobQueue for StreamQueue {
    fn enqueue(&self, job: Job, prio: u8) -> Result<(), QueueError> {
        use std::io::Write;
        {
            let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            let line = serde_json::to_string(&StreamEntry { prio, job })?;
            let mut f = std::fs::OpenOptions::new().append(true).open(&self.path)?;
            writeln!(f, "{line}")?;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_consume() {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(_) => return None,
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(STREAM_POLL) => {}
                () = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    fn len(&self) -> usize {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let total = self.entries().map(|e| e.len()).unwrap_or(0);
        total.saturating_sub(self.read_cursor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwo_core::step::CANONICAL_STEPS;

    fn job(tenant: &str) -> Job {
        let dag = Dag::from_steps(&CANONICAL_STEPS[..2]);
        let run = Run::new(dag.digest(), tenant);
        Job { run, dag, prio: 5 }
    }

    #[tokio::test]
    async fn memory_priority_strictly_wins() {
        let q = MemoryQueue::new();
        q.enqueue(job("low"), 1).unwrap();
        q.enqueue(job("high"), 9).unwrap();
        let first = q.drain(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.run.tenant, "high");
        let second = q.drain(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.run.tenant, "low");
    }

    #[tokio::test]
    async fn memory_fifo_within_priority() {
        let q = MemoryQueue::new();
        for name in ["a", "b", "c"] {
            q.enqueue(job(name), 5).unwrap();
        }
        for name in ["a", "b", "c"] {
            let j = q.drain(Duration::from_millis(10)).await.unwrap();
            assert_eq!(j.run.tenant, name);
        }
    }

    #[tokio::test]
    async fn memory_drain_times_out_empty() {
        let q = MemoryQueue::new();
        let started = std::time::Instant::now();
        assert!(q.drain(Duration::from_millis(20)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn memory_drain_wakes_on_enqueue() {
        let q = std::sync::Arc::new(MemoryQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.drain(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue(job("late"), 5).unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.run.tenant, "late");
    }

    #[tokio::test]
    async fn memory_capacity_rejects_overflow() {
        let q = MemoryQueue::with_capacity(1);
        q.enqueue(job("a"), 5).unwrap();
        assert!(matches!(
            q.enqueue(job("b"), 5),
            Err(QueueError::Full { max: 1 })
        ));
    }

    #[tokio::test]
    async fn stream_round_trip_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let q = StreamQueue::open(dir.path().join("queue.jsonl")).unwrap();
        q.enqueue(job("first"), 9).unwrap();
        q.enqueue(job("second"), 1).unwrap();
        assert_eq!(q.len(), 2);
        // Append order, not priority order.
        let a = q.drain(Duration::from_millis(50)).await.unwrap();
        assert_eq!(a.run.tenant, "first");
        let b = q.drain(Duration::from_millis(50)).await.unwrap();
        assert_eq!(b.run.tenant, "second");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn stream_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        {
            let q = StreamQueue::open(&path).unwrap();
            q.enqueue(job("persisted"), 5).unwrap();
            let _ = q.drain(Duration::from_millis(10)).await;
            q.enqueue(job("pending"), 5).unwrap();
        }
        let q = StreamQueue::open(&path).unwrap();
        assert_eq!(q.len(), 1);
        let j = q.drain(Duration::from_millis(50)).await.unwrap();
        assert_eq!(j.run.tenant, "pending");
    }
}
