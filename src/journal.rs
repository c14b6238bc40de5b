//! ## Transfer Journal
//!
//! Durable, idempotent record of in-flight reads and writes. Every
//! mutation appends one JSON line to a write-ahead log and syncs it;
//! load replays the log last-write-wins and compacts it back to one
//! line per record.
//!

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JournalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Active,
    Paused,
    Failed,
    Done,
}

/// ### TransferRecord
///
/// One row of the journal. `committed_bytes` only ever grows.
///
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub device_id: String,
    pub kind: TransferKind,
    pub handle: Option<u32>,
    pub parent_handle: Option<u32>,
    pub name: String,
    pub total_bytes: Option<u64>,
    pub committed_bytes: u64,
    pub supports_partial: bool,
    pub local_temp_path: PathBuf,
    pub final_path: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
    pub remote_handle: Option<u32>,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub state: TransferState,
    pub throughput_mbps: Option<f64>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

struct Inner {
    path: PathBuf,
    records: HashMap<Uuid, TransferRecord>,
    wal: Option<File>,
    wal_lines: usize,
}

/// ### TransferJournal
///
/// Single-writer, multi-reader store shared by every session in the
/// process.
///
pub struct TransferJournal {
    inner: Mutex<Inner>,
}

impl TransferJournal {
    /// Replay the log at `path` (creating it if absent) and compact it
    /// when it has grown well past one line per live record.
    pub fn open(path: &Path) -> Result<TransferJournal, JournalError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut records = HashMap::new();
        let mut wal_lines = 0usize;
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                wal_lines += 1;
                match serde_json::from_str::<TransferRecord>(&line) {
                    Ok(record) => {
                        records.insert(record.id, record);
                    }
                    // a torn tail from a crash is expected; anything
                    // else is worth a warning
                    Err(e) => warn!("skipping corrupt journal line: {e}"),
                }
            }
        }

        let journal = TransferJournal {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                records,
                wal: None,
                wal_lines,
            }),
        };
        {
            let mut inner = journal.inner.lock().unwrap();
            if inner.wal_lines > inner.records.len().saturating_mul(4).max(64) {
                inner.compact()?;
            }
            inner.open_wal()?;
        }
        Ok(journal)
    }

    // ==========
    // MUTATIONS
    // ==========

    /// Begin journaling a device-to-host transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_read(
        &self,
        device_id: &str,
        handle: u32,
        name: &str,
        total_bytes: Option<u64>,
        supports_partial: bool,
        temp_path: &Path,
        final_path: &Path,
        etag: Option<String>,
    ) -> Result<Uuid, JournalError> {
        let record = TransferRecord {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            kind: TransferKind::Read,
            handle: Some(handle),
            parent_handle: None,
            name: name.to_string(),
            total_bytes,
            committed_bytes: 0,
            supports_partial,
            local_temp_path: temp_path.to_path_buf(),
            final_path: Some(final_path.to_path_buf()),
            source_path: None,
            remote_handle: None,
            content_hash: None,
            etag,
            state: TransferState::Active,
            throughput_mbps: None,
            error: None,
            updated_at: Utc::now(),
        };
        let id = record.id;
        self.upsert(record)?;
        Ok(id)
    }

    /// Begin journaling a host-to-device transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_write(
        &self,
        device_id: &str,
        parent_handle: u32,
        name: &str,
        total_bytes: Option<u64>,
        supports_partial: bool,
        temp_path: &Path,
        source_path: &Path,
    ) -> Result<Uuid, JournalError> {
        let record = TransferRecord {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            kind: TransferKind::Write,
            handle: None,
            parent_handle: Some(parent_handle),
            name: name.to_string(),
            total_bytes,
            committed_bytes: 0,
            supports_partial,
            local_temp_path: temp_path.to_path_buf(),
            final_path: None,
            source_path: Some(source_path.to_path_buf()),
            remote_handle: None,
            content_hash: None,
            etag: None,
            state: TransferState::Active,
            throughput_mbps: None,
            error: None,
            updated_at: Utc::now(),
        };
        let id = record.id;
        self.upsert(record)?;
        Ok(id)
    }

    /// Idempotent progress update; decreases are ignored.
    pub fn update_progress(&self, id: Uuid, committed: u64) -> Result<(), JournalError> {
        self.mutate(id, |r| {
            if committed > r.committed_bytes {
                r.committed_bytes = committed;
                true
            } else {
                false
            }
        })
    }

    pub fn record_remote_handle(&self, id: Uuid, handle: u32) -> Result<(), JournalError> {
        self.mutate(id, |r| {
            r.remote_handle = Some(handle);
            true
        })
    }

    pub fn add_content_hash(&self, id: Uuid, hash: &str) -> Result<(), JournalError> {
        self.mutate(id, |r| {
            r.content_hash = Some(hash.to_string());
            true
        })
    }

    pub fn record_throughput(&self, id: Uuid, mbps: f64) -> Result<(), JournalError> {
        self.mutate(id, |r| {
            r.throughput_mbps = Some(mbps);
            true
        })
    }

    /// Record the failure and keep the row resumable. Never deletes
    /// data.
    pub fn fail(&self, id: Uuid, error: &str) -> Result<(), JournalError> {
        self.mutate(id, |r| {
            r.state = TransferState::Failed;
            r.error = Some(error.to_string());
            true
        })
    }

    pub fn pause(&self, id: Uuid) -> Result<(), JournalError> {
        self.mutate(id, |r| {
            r.state = TransferState::Paused;
            true
        })
    }

    pub fn complete(&self, id: Uuid) -> Result<(), JournalError> {
        self.mutate(id, |r| {
            r.state = TransferState::Done;
            r.error = None;
            true
        })
    }

    // ==========
    // QUERIES
    // ==========

    pub fn get(&self, id: Uuid) -> Option<TransferRecord> {
        self.inner.lock().unwrap().records.get(&id).cloned()
    }

    /// Records of `device_id` worth resuming, oldest first.
    pub fn resumables(&self, device_id: &str) -> Vec<TransferRecord> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<TransferRecord> = inner
            .records
            .values()
            .filter(|r| r.device_id == device_id)
            .filter(|r| matches!(r.state, TransferState::Active | TransferState::Failed))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.updated_at);
        out
    }

    /// ### Clear Stale Temps
    ///
    /// Delete temp files of records untouched for `older_than` and
    /// purge the rows. Done rows past the threshold are purged too
    /// (their temp was already promoted).
    ///
    pub fn clear_stale_temps(&self, older_than: Duration) -> Result<usize, JournalError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<Uuid> = inner
            .records
            .values()
            .filter(|r| r.updated_at < cutoff)
            .map(|r| r.id)
            .collect();
        let mut purged = 0;
        for id in stale {
            if let Some(record) = inner.records.remove(&id) {
                if record.state != TransferState::Done && record.local_temp_path.exists() {
                    if let Err(e) = fs::remove_file(&record.local_temp_path) {
                        warn!(
                            "could not remove stale temp {}: {e}",
                            record.local_temp_path.display()
                        );
                    }
                }
                purged += 1;
            }
        }
        if purged > 0 {
            debug!("purged {purged} stale journal records");
            inner.compact()?;
            inner.open_wal()?;
        }
        Ok(purged)
    }

    // ==========
    // INTERNALS
    // ==========

    fn upsert(&self, record: TransferRecord) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().unwrap();
        inner.append(&record)?;
        inner.records.insert(record.id, record);
        Ok(())
    }

    fn mutate(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut TransferRecord) -> bool,
    ) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().unwrap();
        let mut record = inner
            .records
            .get(&id)
            .cloned()
            .ok_or(JournalError::UnknownTransfer(id))?;
        if f(&mut record) {
            record.updated_at = Utc::now();
            inner.append(&record)?;
            inner.records.insert(id, record);
        }
        Ok(())
    }
}

impl Inner {
    fn open_wal(&mut self) -> Result<(), JournalError> {
        if self.wal.is_none() {
            self.wal = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        Ok(())
    }

    fn append(&mut self, record: &TransferRecord) -> Result<(), JournalError> {
        self.open_wal()?;
        let file = self.wal.as_mut().expect("wal opened above");
        let line = serde_json::to_string(record)
            .map_err(|e| JournalError::Corrupt(e.to_string()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        self.wal_lines += 1;
        Ok(())
    }

    /// Rewrite the log as one line per live record, atomically.
    fn compact(&mut self) -> Result<(), JournalError> {
        self.wal = None;
        let tmp = self.path.with_extension("compact");
        {
            let mut f = File::create(&tmp)?;
            for record in self.records.values() {
                let line = serde_json::to_string(record)
                    .map_err(|e| JournalError::Corrupt(e.to_string()))?;
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")?;
            }
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.wal_lines = self.records.len();
        Ok(())
    }
}

/// ### Promote Temp
///
/// Move a finished temp file to its final location: plain rename on
/// the same filesystem, copy + sync + rename across filesystems.
///
pub fn promote_temp(temp: &Path, final_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = final_path.parent() {
        fs::create_dir_all(dir)?;
    }
    match fs::rename(temp, final_path) {
        Ok(()) => Ok(()),
        Err(_) => {
            let staging = final_path.with_extension("staging");
            fs::copy(temp, &staging)?;
            let f = File::open(&staging)?;
            f.sync_all()?;
            drop(f);
            fs::rename(&staging, final_path)?;
            fs::remove_file(temp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn journal_in(dir: &Path) -> TransferJournal {
        TransferJournal::open(&dir.join("transfers.jsonl")).unwrap()
    }

    fn begin_sample_read(journal: &TransferJournal, dir: &Path, device: &str) -> Uuid {
        journal
            .begin_read(
                device,
                0xAAAA,
                "movie.mp4",
                Some(10_000),
                true,
                &dir.join("movie.mp4.part"),
                &dir.join("movie.mp4"),
                None,
            )
            .unwrap()
    }

    #[test]
    fn progress_is_monotonic() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let id = begin_sample_read(&journal, dir.path(), "dev-1");
        journal.update_progress(id, 3_000).unwrap();
        journal.update_progress(id, 2_000).unwrap(); // ignored decrease
        journal.update_progress(id, 3_000).unwrap(); // idempotent
        assert_eq!(journal.get(id).unwrap().committed_bytes, 3_000);
    }

    #[test]
    fn failed_records_are_resumable_with_state() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let id = begin_sample_read(&journal, dir.path(), "dev-1");
        journal.update_progress(id, 3_000).unwrap();
        journal.fail(id, "device detached").unwrap();

        let resumable = journal.resumables("dev-1");
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].state, TransferState::Failed);
        assert_eq!(resumable[0].committed_bytes, 3_000);
        assert_eq!(resumable[0].handle, Some(0xAAAA));
    }

    #[test]
    fn completed_records_are_not_resumable() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let id = begin_sample_read(&journal, dir.path(), "dev-1");
        journal.complete(id).unwrap();
        assert!(journal.resumables("dev-1").is_empty());
        assert_eq!(journal.get(id).unwrap().state, TransferState::Done);
    }

    #[test]
    fn resumables_are_isolated_per_device() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        begin_sample_read(&journal, dir.path(), "dev-1");
        begin_sample_read(&journal, dir.path(), "dev-2");
        let r = journal.resumables("dev-1");
        assert_eq!(r.len(), 1);
        assert!(r.iter().all(|rec| rec.device_id == "dev-1"));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let id;
        {
            let journal = journal_in(dir.path());
            id = begin_sample_read(&journal, dir.path(), "dev-1");
            journal.update_progress(id, 5_000).unwrap();
            journal.record_remote_handle(id, 42).unwrap();
        }
        let journal = journal_in(dir.path());
        let record = journal.get(id).unwrap();
        assert_eq!(record.committed_bytes, 5_000);
        assert_eq!(record.remote_handle, Some(42));
        assert_eq!(record.state, TransferState::Active);
    }

    #[test]
    fn corrupt_tail_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transfers.jsonl");
        let id;
        {
            let journal = TransferJournal::open(&path).unwrap();
            id = begin_sample_read(&journal, dir.path(), "dev-1");
        }
        // simulate a torn write
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"id\":\"trunc").unwrap();
        drop(f);
        let journal = TransferJournal::open(&path).unwrap();
        assert!(journal.get(id).is_some());
    }

    #[test]
    fn stale_temps_are_swept() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let temp = dir.path().join("old.part");
        fs::write(&temp, b"partial").unwrap();
        let id = journal
            .begin_read(
                "dev-1",
                1,
                "old.bin",
                None,
                false,
                &temp,
                &dir.path().join("old.bin"),
                None,
            )
            .unwrap();
        // zero threshold: everything is stale
        let purged = journal.clear_stale_temps(Duration::from_secs(0)).unwrap();
        assert_eq!(purged, 1);
        assert!(!temp.exists());
        assert!(journal.get(id).is_none());
    }

    #[test]
    fn fail_never_deletes_data() {
        let dir = tempdir().unwrap();
        let journal = journal_in(dir.path());
        let temp = dir.path().join("keep.part");
        fs::write(&temp, b"partial").unwrap();
        let id = journal
            .begin_read(
                "dev-1",
                1,
                "keep.bin",
                None,
                false,
                &temp,
                &dir.path().join("keep.bin"),
                None,
            )
            .unwrap();
        journal.fail(id, "timeout").unwrap();
        assert!(temp.exists());
    }

    #[test]
    fn promote_temp_renames() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join("a.part");
        let final_path = dir.path().join("nested").join("a.bin");
        fs::write(&temp, b"data").unwrap();
        promote_temp(&temp, &final_path).unwrap();
        assert!(!temp.exists());
        assert_eq!(fs::read(&final_path).unwrap(), b"data");
    }
}
