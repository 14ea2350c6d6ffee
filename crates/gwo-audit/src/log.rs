// SPDX-License-Identifier: MIT OR Apache-2.0
//! The append-only audit log file.
//!
//! One compact canonical JSON object per line. Appends are serialized by a
//! mutex so readers only ever observe whole lines; line bytes are never
//! rewritten. Each line carries a strictly-increasing `seq` and a timestamp
//! that never regresses even if the wall clock does.

use crate::merkle::{ProofStep, merkle_root, proof_path};
use chrono::Utc;
use gwo_core::Event;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// Errors from audit log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Filesystem failure.
    #[error("audit io: {0}")]
    Io(#[from] std::io::Error),
    /// A line could not be serialized.
    #[error("audit serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// A proof was requested for a line that does not exist.
    #[error("audit index {index} out of range (log has {len} lines)")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Number of lines in the current log generation.
        len: usize,
    },
    /// The appender lock was poisoned by a panicking writer.
    #[error("audit log lock poisoned")]
    Poisoned,
}

/// An inclusion proof for one audit line, as served over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditProof {
    /// Merkle root over the current log generation.
    pub root: String,
    /// Index of the proven line.
    pub index: usize,
    /// Sibling path, bottom level first.
    pub path: Vec<ProofStep>,
    /// The proven line's exact bytes (without the newline).
    pub line: String,
}

struct Inner {
    path: PathBuf,
    file: File,
    rotate_bytes: u64,
    size: u64,
    seq: u64,
    last_ts_micros: i64,
}

/// Append-only audit log with size-based rotation.
///
/// When the current file would exceed the rotation limit it is renamed to
/// `<path>.1` (replacing any previous generation) and a fresh file starts.
/// `seq` keeps increasing across rotations; proof indexes are relative to
/// the current generation.
pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Open (or create) the audit log at `path`.
    ///
    /// Existing lines are scanned once to restore `seq` and the size
    /// counter.
    ///
    /// # Errors
    ///
    /// Filesystem failures.
    pub fn open(path: impl Into<PathBuf>, rotate_bytes: u64) -> Result<Self, AuditError> {
        let path = path.into();
        let mut existing = String::new();
        if let Ok(mut f) = File::open(&path) {
            f.read_to_string(&mut existing)?;
        }
        let seq = existing.lines().filter(|l| !l.trim().is_empty()).count() as u64;
        let size = existing.len() as u64;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                path,
                file,
                rotate_bytes,
                size,
                seq,
                last_ts_micros: 0,
            }),
        })
    }

    /// Append an event as one canonical line, returning its `seq`.
    ///
    /// The event's timestamp is replaced by the log's monotonic clock.
    ///
    /// # Errors
    ///
    /// Filesystem or serialization failures.
    pub fn append(&self, event: &Event) -> Result<u64, AuditError> {
        let mut inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;

        let now = Utc::now().timestamp_micros();
        let ts_micros = now.max(inner.last_ts_micros + 1);
        inner.last_ts_micros = ts_micros;
        let seq = inner.seq;
        inner.seq += 1;

        let mut value = serde_json::to_value(event)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("seq".into(), serde_json::json!(seq));
            obj.insert("ts_micros".into(), serde_json::json!(ts_micros));
        }
        let line = serde_json::to_string(&value)?;

        if inner.size + line.len() as u64 + 1 > inner.rotate_bytes && inner.size > 0 {
            let rotated = rotated_path(&inner.path);
            std::fs::rename(&inner.path, rotated)?;
            inner.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&inner.path)?;
            inner.size = 0;
        }

        writeln!(inner.file, "{line}")?;
        inner.file.flush()?;
        inner.size += line.len() as u64 + 1;
        Ok(seq)
    }

    /// All lines of the current generation, in append order.
    ///
    /// # Errors
    ///
    /// Filesystem failures.
    pub fn lines(&self) -> Result<Vec<String>, AuditError> {
        let inner = self.inner.lock().map_err(|_| AuditError::Poisoned)?;
        read_lines(&inner.path)
    }

    /// The most recent up-to-`n` lines, oldest first.
    ///
    /// # Errors
    ///
    /// Filesystem failures.
    pub fn tail(&self, n: usize) -> Result<Vec<String>, AuditError> {
        let mut lines = self.lines()?;
        if lines.len() > n {
            lines.drain(..lines.len() - n);
        }
        Ok(lines)
    }

    /// Merkle root over the current generation's lines.
    ///
    /// # Errors
    ///
    /// Filesystem failures.
    pub fn root(&self) -> Result<String, AuditError> {
        Ok(merkle_root(&self.lines()?))
    }

    /// Inclusion proof for line `index` of the current generation.
    ///
    /// # Errors
    ///
    /// [`AuditError::OutOfRange`] when fewer than `index + 1` lines exist.
    pub fn proof(&self, index: usize) -> Result<AuditProof, AuditError> {
        let lines = self.lines()?;
        let path = proof_path(&lines, index).ok_or(AuditError::OutOfRange {
            index,
            len: lines.len(),
        })?;
        Ok(AuditProof {
            root: merkle_root(&lines),
            index,
            path,
            line: lines[index].clone(),
        })
    }
}

fn rotated_path(path: &std::path::Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".1");
    PathBuf::from(os)
}

fn read_lines(path: &std::path::Path) -> Result<Vec<String>, AuditError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::verify_inclusion;
    use gwo_core::EventBody;
    use uuid::Uuid;

    fn event() -> Event {
        Event::now(EventBody::RunStart {
            run_id: Uuid::new_v4(),
            tenant: "public".into(),
        })
    }

    #[test]
    fn appends_are_sequential_canonical_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl"), u64::MAX).unwrap();
        assert_eq!(log.append(&event()).unwrap(), 0);
        assert_eq!(log.append(&event()).unwrap(), 1);

        let lines = log.lines().unwrap();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["type"], "run_start");
            assert!(v["seq"].is_u64());
            assert!(v["ts_micros"].is_i64() || v["ts_micros"].is_u64());
        }
    }

    #[test]
    fn timestamps_never_regress() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl"), u64::MAX).unwrap();
        for _ in 0..50 {
            log.append(&event()).unwrap();
        }
        let stamps: Vec<i64> = log
            .lines()
            .unwrap()
            .iter()
            .map(|l| {
                serde_json::from_str::<serde_json::Value>(l).unwrap()["ts_micros"]
                    .as_i64()
                    .unwrap()
            })
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn seq_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path, u64::MAX).unwrap();
            log.append(&event()).unwrap();
            log.append(&event()).unwrap();
        }
        let log = AuditLog::open(&path, u64::MAX).unwrap();
        assert_eq!(log.append(&event()).unwrap(), 2);
    }

    #[test]
    fn tail_returns_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl"), u64::MAX).unwrap();
        for _ in 0..5 {
            log.append(&event()).unwrap();
        }
        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        let v: serde_json::Value = serde_json::from_str(&tail[1]).unwrap();
        assert_eq!(v["seq"], 4);
    }

    #[test]
    fn proof_round_trip_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl"), u64::MAX).unwrap();
        for _ in 0..5 {
            log.append(&event()).unwrap();
        }
        let proof = log.proof(3).unwrap();
        assert_eq!(proof.path.len(), 3);
        assert!(verify_inclusion(
            &proof.root,
            proof.line.as_bytes(),
            proof.index,
            &proof.path
        ));
    }

    #[test]
    fn proof_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("audit.jsonl"), u64::MAX).unwrap();
        log.append(&event()).unwrap();
        assert!(matches!(
            log.proof(1),
            Err(AuditError::OutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn rotation_starts_fresh_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path, 256).unwrap();
        for _ in 0..20 {
            log.append(&event()).unwrap();
        }
        assert!(std::path::Path::new(&format!("{}.1", path.display())).exists());
        // seq stays monotonic across the rotation
        let lines = log.lines().unwrap();
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert!(first["seq"].as_u64().unwrap() > 0);
    }
}
