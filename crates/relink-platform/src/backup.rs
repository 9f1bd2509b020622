//! Redundant, checksum-verified session backups with a JSON index per location.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use relink_core::BackupRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    atomic_file::{read_optional, remove_if_exists, write_atomic},
    envelope::{EnvelopeError, SealedSession},
};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("backup I/O failure: {0}")]
    Io(String),
    #[error("snapshot failed in every location: {0}")]
    AllLocationsFailed(String),
    #[error("no valid backup found")]
    NotFound,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl BackupError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "backup_io_error",
            Self::AllLocationsFailed(_) => "backup_failed",
            Self::NotFound => "backup_not_found",
            Self::Envelope(_) => "backup_encode_failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BackupIndex {
    records: Vec<BackupRecord>,
}

/// Writes, prunes and restores session replicas across prioritized locations.
///
/// Writes are serialized through an internal lock, so one manager can be
/// shared between the periodic backup task and the lifecycle runtime.
#[derive(Debug)]
pub struct BackupManager {
    locations: Vec<PathBuf>,
    retention: usize,
    write_lock: Mutex<()>,
}

impl BackupManager {
    /// `locations` are in priority order; retention is clamped to at least one.
    pub fn new(locations: Vec<PathBuf>, retention: usize) -> Self {
        Self {
            locations,
            retention: retention.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Write `sealed` to every location, verifying each copy after write.
    ///
    /// Succeeds when at least one location holds a verified replica. A
    /// location whose write or verification fails keeps its previous
    /// records untouched.
    pub fn snapshot(
        &self,
        sealed: &SealedSession,
        now_ms: u64,
    ) -> Result<Vec<BackupRecord>, BackupError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BackupError::Io("backup lock poisoned".to_owned()))?;
        let bytes = sealed.envelope.to_bytes()?;

        let mut written = Vec::new();
        let mut failures = Vec::new();
        for location in &self.locations {
            match self.snapshot_into(location, sealed, &bytes, now_ms) {
                Ok(record) => written.push(record),
                Err(err) => {
                    warn!(location = %location.display(), error = %err, "backup location failed");
                    failures.push(format!("{}: {err}", location.display()));
                }
            }
        }

        if written.is_empty() {
            return Err(BackupError::AllLocationsFailed(failures.join("; ")));
        }
        info!(
            session_id = %sealed.session.id,
            replicas = written.len(),
            failed = failures.len(),
            "backup snapshot completed"
        );
        Ok(written)
    }

    fn snapshot_into(
        &self,
        location: &Path,
        sealed: &SealedSession,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<BackupRecord, BackupError> {
        fs::create_dir_all(location).map_err(|err| io_error("creating", location, err))?;
        let mut index = load_index(location);

        let timestamp_ms = index
            .records
            .iter()
            .map(|record| record.timestamp_ms.saturating_add(1))
            .max()
            .map_or(now_ms, |next| next.max(now_ms));
        let path = location.join(format!("session-{timestamp_ms}.json"));

        write_atomic(&path, bytes).map_err(|err| io_error("writing", &path, err))?;
        if let Err(err) = verify_replica(&path, sealed.checksum()) {
            let _ = remove_if_exists(&path);
            return Err(err);
        }

        let record = BackupRecord {
            timestamp_ms,
            location: path,
            checksum: sealed.checksum().to_owned(),
            source_session_id: sealed.session.id.clone(),
        };
        index.records.push(record.clone());
        let pruned = self.prune_index(&mut index);

        // Old replicas go only once the index no longer points at them.
        if let Err(err) = persist_index(location, &index) {
            let _ = remove_if_exists(&record.location);
            return Err(err);
        }
        for stale in &pruned {
            match remove_if_exists(&stale.location) {
                Ok(_) => debug!(path = %stale.location.display(), "pruned backup"),
                Err(err) => {
                    warn!(path = %stale.location.display(), error = %err, "failed pruning backup")
                }
            }
        }
        Ok(record)
    }

    /// Drop records beyond the retention window from `index`, returning them.
    fn prune_index(&self, index: &mut BackupIndex) -> Vec<BackupRecord> {
        index.records.sort_by_key(|record| record.timestamp_ms);
        let excess = index.records.len().saturating_sub(self.retention);
        index.records.drain(..excess).collect()
    }

    /// Newest verified replica across all locations.
    ///
    /// Candidates are ordered by timestamp, newest first, with location
    /// priority breaking ties. Invalid replicas are skipped.
    pub fn restore_latest(&self) -> Result<(SealedSession, BackupRecord), BackupError> {
        let mut candidates: Vec<(usize, BackupRecord)> = self
            .locations
            .iter()
            .enumerate()
            .flat_map(|(priority, location)| {
                load_index(location)
                    .records
                    .into_iter()
                    .map(move |record| (priority, record))
            })
            .collect();
        candidates.sort_by(|(pa, a), (pb, b)| {
            b.timestamp_ms.cmp(&a.timestamp_ms).then(pa.cmp(pb))
        });

        for (_, record) in candidates {
            match read_replica(&record) {
                Ok(sealed) => {
                    info!(
                        path = %record.location.display(),
                        session_id = %record.source_session_id,
                        "restored session from backup"
                    );
                    return Ok((sealed, record));
                }
                Err(err) => {
                    warn!(
                        path = %record.location.display(),
                        error = %err,
                        "skipping invalid backup"
                    );
                }
            }
        }
        Err(BackupError::NotFound)
    }

    /// All indexed records, grouped by location priority and oldest first.
    pub fn records(&self) -> Vec<BackupRecord> {
        self.locations
            .iter()
            .flat_map(|location| {
                let mut index = load_index(location);
                index.records.sort_by_key(|record| record.timestamp_ms);
                index.records
            })
            .collect()
    }

    /// Delete every replica taken from `session_id`. Returns how many went.
    pub fn purge_session(&self, session_id: &str) -> Result<usize, BackupError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BackupError::Io("backup lock poisoned".to_owned()))?;

        let mut purged = 0;
        for location in &self.locations {
            let mut index = load_index(location);
            let before = index.records.len();
            let (revoked, kept): (Vec<_>, Vec<_>) = index
                .records
                .into_iter()
                .partition(|record| record.source_session_id == session_id);
            index.records = kept;
            if index.records.len() == before {
                continue;
            }
            persist_index(location, &index)?;
            for record in &revoked {
                remove_if_exists(&record.location)
                    .map_err(|err| io_error("deleting", &record.location, err))?;
            }
            purged += revoked.len();
        }
        if purged > 0 {
            info!(session_id, purged, "purged backups of revoked session");
        }
        Ok(purged)
    }
}

fn verify_replica(path: &Path, expected_checksum: &str) -> Result<(), BackupError> {
    let bytes = fs::read(path).map_err(|err| io_error("reading back", path, err))?;
    let sealed = SealedSession::from_bytes(&bytes)?;
    if sealed.checksum() != expected_checksum {
        return Err(BackupError::Envelope(EnvelopeError::ChecksumMismatch {
            expected: expected_checksum.to_owned(),
            actual: sealed.checksum().to_owned(),
        }));
    }
    Ok(())
}

fn read_replica(record: &BackupRecord) -> Result<SealedSession, BackupError> {
    let bytes = read_optional(&record.location)
        .map_err(|err| io_error("reading", &record.location, err))?
        .ok_or(BackupError::NotFound)?;
    let sealed = SealedSession::from_bytes(&bytes)?;
    if sealed.checksum() != record.checksum || sealed.session.id != record.source_session_id {
        return Err(BackupError::Envelope(EnvelopeError::ChecksumMismatch {
            expected: record.checksum.clone(),
            actual: sealed.checksum().to_owned(),
        }));
    }
    Ok(sealed)
}

/// Index of `location`, rebuilt from the replicas on disk when the index
/// file is missing or unreadable.
fn load_index(location: &Path) -> BackupIndex {
    let path = location.join(INDEX_FILE);
    match read_optional(&path) {
        Ok(Some(bytes)) => match serde_json::from_slice::<BackupIndex>(&bytes) {
            Ok(index) => return index,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "backup index unreadable; rebuilding");
            }
        },
        Ok(None) => {}
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed reading backup index; rebuilding");
        }
    }
    rebuild_index(location)
}

fn rebuild_index(location: &Path) -> BackupIndex {
    let entries = match fs::read_dir(location) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(location = %location.display(), error = %err, "failed listing backups");
            }
            return BackupIndex::default();
        }
    };

    let mut records = Vec::new();
    for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
        let Some(timestamp_ms) = replica_timestamp(&path) else {
            continue;
        };
        let sealed = fs::read(&path)
            .map_err(|err| io_error("reading", &path, err))
            .and_then(|bytes| SealedSession::from_bytes(&bytes).map_err(BackupError::from));
        match sealed {
            Ok(sealed) => records.push(BackupRecord {
                timestamp_ms,
                checksum: sealed.checksum().to_owned(),
                source_session_id: sealed.session.id,
                location: path,
            }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring invalid replica");
            }
        }
    }
    records.sort_by_key(|record| record.timestamp_ms);
    if !records.is_empty() {
        info!(
            location = %location.display(),
            recovered = records.len(),
            "rebuilt backup index from replicas"
        );
    }
    BackupIndex { records }
}

/// Timestamp encoded in a `session-{ts}.json` replica name.
fn replica_timestamp(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("session-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn persist_index(location: &Path, index: &BackupIndex) -> Result<(), BackupError> {
    let path = location.join(INDEX_FILE);
    let encoded =
        serde_json::to_vec_pretty(index).map_err(|err| BackupError::Io(err.to_string()))?;
    write_atomic(&path, &encoded).map_err(|err| io_error("writing", &path, err))
}

fn io_error(action: &str, path: &Path, err: io::Error) -> BackupError {
    BackupError::Io(format!("failed {action} {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use relink_core::Session;

    use super::*;

    fn sealed(device: &str) -> SealedSession {
        SealedSession::seal(Session::new(vec![1, 2, 3, 4], device, 100), 100).expect("seal")
    }

    #[test]
    fn restore_returns_snapshot_byte_for_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BackupManager::new(vec![dir.path().join("a")], 5);
        let original = sealed("device-1");

        let records = manager.snapshot(&original, 1_000).expect("snapshot");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].checksum, original.checksum());

        let (restored, record) = manager.restore_latest().expect("restore");
        assert_eq!(restored, original);
        assert_eq!(
            restored.envelope.to_bytes().expect("encode"),
            original.envelope.to_bytes().expect("encode")
        );
        assert_eq!(record, records[0]);
    }

    #[test]
    fn retention_keeps_exactly_the_newest_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("backups");
        let session = sealed("device-1");

        let seeding = BackupManager::new(vec![location.clone()], 10);
        for step in 0..7 {
            seeding.snapshot(&session, 1_000 + step).expect("seed snapshot");
        }
        assert_eq!(seeding.records().len(), 7);

        let manager = BackupManager::new(vec![location.clone()], 5);
        let latest = manager.snapshot(&session, 2_000).expect("eighth snapshot");

        let remaining = manager.records();
        assert_eq!(remaining.len(), 5);
        let timestamps: Vec<u64> = remaining.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1_003, 1_004, 1_005, 1_006, 2_000]);
        assert_eq!(remaining.last(), latest.first());

        let files = fs::read_dir(&location)
            .expect("list")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("session-"))
            .count();
        assert_eq!(files, 5);
    }

    #[test]
    fn zero_retention_still_keeps_latest_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BackupManager::new(vec![dir.path().to_path_buf()], 0);
        manager.snapshot(&sealed("a"), 1).expect("first");
        manager.snapshot(&sealed("b"), 2).expect("second");

        let records = manager.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms, 2);
    }

    #[test]
    fn timestamps_are_strictly_increasing_per_location() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BackupManager::new(vec![dir.path().to_path_buf()], 5);
        let session = sealed("device-1");
        manager.snapshot(&session, 500).expect("first");
        manager.snapshot(&session, 500).expect("same clock");
        manager.snapshot(&session, 400).expect("clock went backwards");

        let timestamps: Vec<u64> = manager.records().iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![500, 501, 502]);
    }

    #[test]
    fn restore_skips_corrupt_replica_for_older_valid_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BackupManager::new(vec![dir.path().to_path_buf()], 5);
        let older = sealed("older");
        let newer = sealed("newer");
        manager.snapshot(&older, 10).expect("older");
        let newest = manager.snapshot(&newer, 20).expect("newer");

        fs::write(&newest[0].location, b"{\"format\":1").expect("corrupt newest");

        let (restored, record) = manager.restore_latest().expect("fallback restore");
        assert_eq!(restored, older);
        assert_eq!(record.timestamp_ms, 10);
    }

    #[test]
    fn restore_prefers_higher_priority_location_on_tie() {
        let dir = tempfile::tempdir().expect("tempdir");
        let primary = dir.path().join("primary");
        let secondary = dir.path().join("secondary");
        let manager = BackupManager::new(vec![primary.clone(), secondary], 5);
        manager.snapshot(&sealed("device-1"), 10).expect("snapshot");

        let (_, record) = manager.restore_latest().expect("restore");
        assert!(record.location.starts_with(&primary));
    }

    #[test]
    fn unwritable_location_does_not_fail_whole_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"a file, not a directory").expect("block location");
        let manager = BackupManager::new(vec![blocked, dir.path().join("ok")], 5);

        let records = manager.snapshot(&sealed("device-1"), 10).expect("partial success");
        assert_eq!(records.len(), 1);
        assert!(records[0].location.starts_with(dir.path().join("ok")));
    }

    #[test]
    fn snapshot_fails_when_every_location_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"not a directory").expect("block location");
        let manager = BackupManager::new(vec![blocked], 5);

        let err = manager
            .snapshot(&sealed("device-1"), 10)
            .expect_err("nowhere to write");
        assert_eq!(err.code(), "backup_failed");
    }

    #[test]
    fn restore_without_backups_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BackupManager::new(vec![dir.path().join("empty")], 5);
        assert_eq!(
            manager.restore_latest().expect_err("nothing stored"),
            BackupError::NotFound
        );
    }

    #[test]
    fn purge_removes_only_revoked_session_replicas() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BackupManager::new(vec![dir.path().to_path_buf()], 10);
        let revoked = sealed("revoked");
        let fresh = sealed("fresh");
        manager.snapshot(&revoked, 1).expect("revoked 1");
        manager.snapshot(&revoked, 2).expect("revoked 2");
        manager.snapshot(&fresh, 3).expect("fresh");

        assert_eq!(
            manager.purge_session(&revoked.session.id).expect("purge"),
            2
        );
        let records = manager.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_session_id, fresh.session.id);

        let (restored, _) = manager.restore_latest().expect("restore");
        assert_eq!(restored, fresh);
    }

    #[test]
    fn lost_index_is_rebuilt_from_replicas_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("backups");
        let manager = BackupManager::new(vec![location.clone()], 2);
        let session = sealed("device-1");
        for ts in 1..=3 {
            manager.snapshot(&session, ts).expect("snapshot");
        }

        fs::write(location.join(INDEX_FILE), b"not json").expect("clobber index");

        let (restored, record) = manager.restore_latest().expect("restore from scan");
        assert_eq!(restored, session);
        assert_eq!(record.timestamp_ms, 3);

        for ts in 4..=6 {
            manager.snapshot(&session, ts).expect("snapshot after rebuild");
        }
        let timestamps: Vec<u64> = manager.records().iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![5, 6]);

        let replicas = fs::read_dir(&location)
            .expect("list")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("session-"))
            .count();
        assert_eq!(replicas, 2);
    }

    #[test]
    fn rebuild_ignores_invalid_replica_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = BackupManager::new(vec![dir.path().to_path_buf()], 5);
        let session = sealed("device-1");
        manager.snapshot(&session, 10).expect("snapshot");

        fs::remove_file(dir.path().join(INDEX_FILE)).expect("drop index");
        fs::write(dir.path().join("session-99.json"), b"garbage").expect("bogus replica");
        fs::write(dir.path().join("notes.txt"), b"unrelated").expect("unrelated file");

        let records = manager.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms, 10);
        assert_eq!(records[0].source_session_id, session.session.id);
    }

    #[test]
    fn failed_index_write_keeps_previous_replica() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("backups");
        let manager = BackupManager::new(vec![location.clone()], 1);
        let older = sealed("older");
        manager.snapshot(&older, 1_000).expect("first snapshot");

        let index = location.join(INDEX_FILE);
        fs::remove_file(&index).expect("drop index file");
        fs::create_dir(&index).expect("block index path");

        let err = manager
            .snapshot(&sealed("newer"), 2_000)
            .expect_err("index cannot be written");
        assert_eq!(err.code(), "backup_failed");
        assert!(location.join("session-1000.json").exists());
        assert!(!location.join("session-2000.json").exists());

        fs::remove_dir(&index).expect("unblock index path");
        let (restored, record) = manager.restore_latest().expect("older replica survives");
        assert_eq!(restored, older);
        assert_eq!(record.timestamp_ms, 1_000);
    }
}
