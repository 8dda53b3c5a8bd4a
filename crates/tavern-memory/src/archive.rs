//! Archival Manager.
//!
//! Writes immutable JSON snapshots of consolidated short-term records into
//! the tenant's `archive/` directory.  A successful return from
//! [`ArchivalManager::archive`] means the artifact is durably on disk; only
//! then may the short-term log be truncated.
//!
//! # Artifact format
//!
//! `archive/short_term_archive_<UTC yyyymmddThhmmss.ffffff>_<seq>.json`:
//!
//! ```json
//! {
//!   "archived_at": "2024-05-01T12:00:00.123456Z",
//!   "message_count": 2,
//!   "messages": [ { "message_id": "…", "author_id": "…", … }, … ]
//! }
//! ```
//!
//! # Write protocol
//!
//! 1. serialise the batch;
//! 2. write a hidden temp file opened with `create_new`, then `fsync` it;
//! 3. hard-link it to the final name (fails instead of clobbering an
//!    existing artifact), remove the temp name; where the filesystem has no
//!    hard links, rename it after checking the final name is free;
//! 4. `fsync` the directory so the new entry survives a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use chrono::Utc;
use tavern_types::{ArchiveBatch, ArchiveId, MemoryError, ShortTermRecord};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::TenantStore;

/// File-name prefix shared by every archive artifact.
pub const ARCHIVE_PREFIX: &str = "short_term_archive_";
const ARCHIVE_EXT: &str = "json";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from archive operations.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Archive not found: {0}")]
    NotFound(ArchiveId),
}

impl From<ArchiveError> for MemoryError {
    fn from(err: ArchiveError) -> Self {
        MemoryError::ArchivalWriteFailed(err.to_string())
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ArchivalManager
// ─────────────────────────────────────────────────────────────────────────────

/// View over a tenant's archive directory.
#[derive(Clone, Copy)]
pub struct ArchivalManager<'a> {
    store: &'a TenantStore,
}

impl<'a> ArchivalManager<'a> {
    pub(crate) fn new(store: &'a TenantStore) -> Self {
        Self { store }
    }

    /// Durably write `records` as a new, uniquely named artifact.
    pub fn archive(&self, records: &[ShortTermRecord]) -> Result<ArchiveId, ArchiveError> {
        let archived_at = Utc::now();
        let batch = ArchiveBatch {
            archived_at,
            record_count: records.len(),
            records: records.to_vec(),
        };
        let body = serde_json::to_vec_pretty(&batch)?;

        let dir = self.store.archive_dir();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let stamp = archived_at.format("%Y%m%dT%H%M%S%.6f");

        loop {
            let seq = self.store.archive_seq.fetch_add(1, Ordering::Relaxed);
            let id = ArchiveId(format!("{ARCHIVE_PREFIX}{stamp}_{seq:04}"));
            let final_path = artifact_path(&dir, &id);
            if final_path.exists() {
                continue;
            }
            let tmp_path = dir.join(format!(".{id}.{ARCHIVE_EXT}.tmp"));
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(io_err(&tmp_path)(e)),
            };

            let written = file
                .write_all(&body)
                .and_then(|()| file.sync_all())
                .map_err(io_err(&tmp_path));
            drop(file);
            if let Err(e) = written {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }

            match publish(&tmp_path, &final_path, |from, to| fs::hard_link(from, to)) {
                Ok(Published::Linked) => {
                    fs::remove_file(&tmp_path).map_err(io_err(&tmp_path))?;
                }
                Ok(Published::Renamed) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let _ = fs::remove_file(&tmp_path);
                    continue;
                }
                Err(e) => {
                    let _ = fs::remove_file(&tmp_path);
                    return Err(io_err(&final_path)(e));
                }
            }
            sync_dir(&dir)?;

            info!(
                tenant = %self.store.tenant_id(),
                archive_id = %id,
                records = records.len(),
                "short-term snapshot archived"
            );
            return Ok(id);
        }
    }

    /// Archive ids in this tenant, oldest first.
    pub fn list(&self) -> Result<Vec<ArchiveId>, ArchiveError> {
        let dir = self.store.archive_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(&format!(".{ARCHIVE_EXT}"))
                && stem.starts_with(ARCHIVE_PREFIX)
            {
                ids.push(ArchiveId(stem.to_string()));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Read one artifact back.
    pub fn load(&self, id: &ArchiveId) -> Result<ArchiveBatch, ArchiveError> {
        if !id.0.starts_with(ARCHIVE_PREFIX) || id.0.contains(['/', '\\']) || id.0.contains("..") {
            return Err(ArchiveError::NotFound(id.clone()));
        }
        let path = artifact_path(&self.store.archive_dir(), id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(id.clone()));
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        debug!(archive_id = %id, bytes = raw.len(), "archive loaded");
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Published {
    /// Hard-linked; the temp name still exists.
    Linked,
    /// Renamed because the filesystem has no hard links.
    Renamed,
}

/// Give the synced temp file its final name without clobbering.
///
/// Filesystems without hard links (vfat reports `EPERM`, some network mounts
/// `EOPNOTSUPP`) fall back to an existence check plus `rename`.  That check
/// is not atomic, but archive names are already unique per store.
fn publish<F>(tmp: &Path, target: &Path, link: F) -> io::Result<Published>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match link(tmp, target) {
        Ok(()) => Ok(Published::Linked),
        Err(e) if matches!(e.kind(), io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied) => {
            if target.exists() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            debug!(error = %e, "hard links unavailable; renaming archive into place");
            fs::rename(tmp, target)?;
            Ok(Published::Renamed)
        }
        Err(e) => Err(e),
    }
}

fn artifact_path(dir: &Path, id: &ArchiveId) -> PathBuf {
    dir.join(format!("{id}.{ARCHIVE_EXT}"))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), ArchiveError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io_err(dir))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), ArchiveError> {
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::store::tests::temp_store;

    fn records(n: usize) -> Vec<ShortTermRecord> {
        (0..n)
            .map(|i| ShortTermRecord {
                message_id: format!("m{i}"),
                author_id: format!("u{}", i % 3),
                author_display_name: "Ada".into(),
                text: format!("message {i}"),
                timestamp: Utc::now(),
                directed_at_assistant: i % 2 == 0,
            })
            .collect()
    }

    #[test]
    fn archive_writes_artifact_with_contract_fields() {
        let (_dir, store) = temp_store();
        let id = store.archive().archive(&records(3)).unwrap();

        let path = artifact_path(&store.archive_dir(), &id);
        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["message_count"], 3);
        assert_eq!(json["messages"].as_array().unwrap().len(), 3);
        assert!(json["archived_at"].as_str().unwrap().ends_with('Z'));
        assert_eq!(json["messages"][1]["message_id"], "m1");
    }

    fn no_hard_links(_: &Path, _: &Path) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    #[test]
    fn publish_renames_when_hard_links_are_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join(".a.json.tmp");
        let target = dir.path().join("a.json");
        fs::write(&tmp, b"{}").unwrap();

        assert_eq!(publish(&tmp, &target, no_hard_links).unwrap(), Published::Renamed);
        assert!(!tmp.exists());
        assert_eq!(fs::read(&target).unwrap(), b"{}");
    }

    #[test]
    fn publish_fallback_never_clobbers() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join(".a.json.tmp");
        let target = dir.path().join("a.json");
        fs::write(&tmp, b"new").unwrap();
        fs::write(&target, b"old").unwrap();

        let err = publish(&tmp, &target, no_hard_links).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn publish_hard_links_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join(".a.json.tmp");
        let target = dir.path().join("a.json");
        fs::write(&tmp, b"{}").unwrap();

        let published = publish(&tmp, &target, |from, to| fs::hard_link(from, to)).unwrap();
        assert_eq!(published, Published::Linked);
        assert!(tmp.exists() && target.exists());
    }

    #[test]
    fn archive_leaves_no_temp_files() {
        let (_dir, store) = temp_store();
        store.archive().archive(&records(1)).unwrap();
        let names: Vec<_> = fs::read_dir(store.archive_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(ARCHIVE_PREFIX));
    }

    #[test]
    fn rapid_archives_get_distinct_ids() {
        let (_dir, store) = temp_store();
        let ids: HashSet<_> = (0..20)
            .map(|_| store.archive().archive(&records(1)).unwrap())
            .collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(store.archive().list().unwrap().len(), 20);
    }

    #[test]
    fn list_is_chronological() {
        let (_dir, store) = temp_store();
        let first = store.archive().archive(&records(1)).unwrap();
        let second = store.archive().archive(&records(2)).unwrap();
        assert_eq!(store.archive().list().unwrap(), vec![first, second]);
    }

    #[test]
    fn load_returns_the_written_batch() {
        let (_dir, store) = temp_store();
        let written = records(4);
        let id = store.archive().archive(&written).unwrap();
        let batch = store.archive().load(&id).unwrap();
        assert_eq!(batch.record_count, 4);
        assert_eq!(batch.records, written);
    }

    #[test]
    fn load_rejects_unknown_and_path_like_ids() {
        let (_dir, store) = temp_store();
        let missing = ArchiveId(format!("{ARCHIVE_PREFIX}19700101T000000.000000_0000"));
        assert!(matches!(
            store.archive().load(&missing),
            Err(ArchiveError::NotFound(_))
        ));
        let sneaky = ArchiveId(format!("{ARCHIVE_PREFIX}../../data"));
        assert!(matches!(
            store.archive().load(&sneaky),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn archive_fails_when_directory_is_unusable() {
        let (_dir, store) = temp_store();
        fs::remove_dir_all(store.archive_dir()).unwrap();
        fs::write(store.archive_dir(), b"not a directory").unwrap();
        let err = store.archive().archive(&records(2)).unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
        assert!(matches!(MemoryError::from(err), MemoryError::ArchivalWriteFailed(_)));
    }
}
