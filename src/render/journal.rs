use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context as _;

use crate::compose::fingerprint::Fingerprint;
use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::foundation::ids::JobId;
use crate::foundation::paths::unix_millis;
use crate::render::job::{JobKind, JobStatus};

/// One job transition, written as a JSON line.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JournalRecord {
    pub job: JobId,
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub status: JobStatus,
    pub at_ms: u64,
}

impl JournalRecord {
    /// Record stamped with the current time.
    pub fn now(job: JobId, fingerprint: Fingerprint, kind: JobKind, status: JobStatus) -> Self {
        Self {
            job,
            fingerprint,
            kind,
            status,
            at_ms: unix_millis(SystemTime::now()),
        }
    }
}

/// Outcome of reading an existing journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// First job id not used by any journaled job.
    pub next_id: u64,
    /// Last record of every job that never reached a terminal state, by job id.
    pub unfinished: Vec<JournalRecord>,
    /// Last record of the highest journaled job id, kept across compaction so ids keep growing.
    pub highest: Option<JournalRecord>,
    /// Lines that could not be parsed (typically a torn final write).
    pub skipped_lines: usize,
}

/// Append-only log of job transitions.
pub struct JobJournal {
    path: PathBuf,
    file: File,
}

impl JobJournal {
    /// Replay `path` (if present) and open it for appending.
    pub fn open(path: impl Into<PathBuf>) -> AnimakeResult<(Self, Replay)> {
        let path = path.into();
        let replay = replay(&path)?;
        if replay.skipped_lines > 0 {
            tracing::warn!(
                path = %path.display(),
                skipped = replay.skipped_lines,
                "ignored unreadable job journal lines"
            );
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create journal directory '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open job journal '{}'", path.display()))?;

        Ok((Self { path, file }, replay))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the journal with `records`, one line each, and keep appending after them.
    pub fn compact(&mut self, records: &[JournalRecord]) -> AnimakeResult<()> {
        let mut out = Vec::new();
        for record in records {
            serde_json::to_writer(&mut out, record).map_err(|e| AnimakeError::serde(e.to_string()))?;
            out.push(b'\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, &out)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .with_context(|| format!("failed to compact job journal '{}'", self.path.display()))?;
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to reopen job journal '{}'", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "job journal compacted");
        Ok(())
    }

    /// Append one record and flush it.
    pub fn append(&mut self, record: &JournalRecord) -> AnimakeResult<()> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| AnimakeError::serde(e.to_string()))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .with_context(|| format!("failed to append to job journal '{}'", self.path.display()))?;
        Ok(())
    }
}

fn replay(path: &Path) -> AnimakeResult<Replay> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Replay {
                next_id: 1,
                ..Replay::default()
            });
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("failed to read job journal '{}'", path.display()))
                .into());
        }
    };

    let mut last = BTreeMap::<JobId, JournalRecord>::new();
    let mut skipped_lines = 0;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read job journal '{}'", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(&line) {
            Ok(rec) => {
                last.insert(rec.job, rec);
            }
            Err(_) => skipped_lines += 1,
        }
    }

    let next_id = last.keys().next_back().map(|id| id.0 + 1).unwrap_or(1);
    let highest = last.values().next_back().cloned();
    let unfinished = last
        .into_values()
        .filter(|rec| !rec.status.is_terminal())
        .collect();
    Ok(Replay {
        next_id,
        unfinished,
        highest,
        skipped_lines,
    })
}

#[cfg(test)]
#[path = "../../tests/unit/render/journal.rs"]
mod tests;
