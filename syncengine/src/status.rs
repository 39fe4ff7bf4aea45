//! Status snapshot (G): the read-only progress surface the out-of-scope
//! GUI/CLI layer polls. Extends spec §8's single inequality
//! (`bytesuploaded <= bytestouploadcurrent`) into the fuller struct
//! `psynclib.h` exposes, per SPEC_FULL's supplemented-features note —
//! current/total bytes per direction, a `DiskFull` state, and per-sync-root
//! health, the same way the teacher surfaces a typed metrics/status struct
//! rather than ad hoc globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use utils::id::SyncRootId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFull {
    Ok,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRootHealth {
    pub healthy: bool,
    pub last_error: Option<String>,
}

/// Quota/business-account snapshot (`pbusinessaccount.c`'s supplemented
/// feature): read over the same API connection as everything else and
/// consulted by the speed governor's disk-full pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl QuotaSnapshot {
    pub fn disk_full(&self) -> DiskFull {
        if self.used_bytes >= self.quota_bytes {
            DiskFull::Full
        } else {
            DiskFull::Ok
        }
    }
}

/// Shared, lock-free counters updated by the upload/download worker
/// threads and read by whatever polls status; one writer per field per
/// §5's "bandwidth counters are lock-free single-writer per direction".
pub struct SyncStatus {
    bytes_to_upload_current: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_to_download_current: AtomicU64,
    bytes_downloaded: AtomicU64,
    disk_full: AtomicBool,
    roots: parking_lot::Mutex<HashMap<SyncRootId, SyncRootHealth>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            bytes_to_upload_current: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            bytes_to_download_current: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            disk_full: AtomicBool::new(false),
            roots: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

impl SyncStatus {
    /// Registers additional bytes this pass intends to upload, keeping the
    /// §8 invariant `bytesuploaded <= bytestouploadcurrent` true by
    /// construction (never shrinking the total below what's progressed).
    pub fn add_bytes_to_upload(&self, bytes: u64) {
        self.bytes_to_upload_current.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_uploaded(&self, bytes: u64) {
        let total = self.bytes_to_upload_current.load(Ordering::Relaxed);
        let new_uploaded = self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        debug_assert!(
            new_uploaded <= total,
            "uploaded more bytes than were ever registered as pending"
        );
    }

    pub fn add_bytes_to_download(&self, bytes: u64) {
        self.bytes_to_download_current.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset_upload_totals(&self) {
        self.bytes_to_upload_current.store(0, Ordering::Relaxed);
        self.bytes_uploaded.store(0, Ordering::Relaxed);
    }

    pub fn set_disk_full(&self, quota: QuotaSnapshot) {
        self.disk_full
            .store(quota.disk_full() == DiskFull::Full, Ordering::Relaxed);
    }

    pub fn disk_full(&self) -> DiskFull {
        if self.disk_full.load(Ordering::Relaxed) {
            DiskFull::Full
        } else {
            DiskFull::Ok
        }
    }

    pub fn set_root_health(&self, root: SyncRootId, health: SyncRootHealth) {
        self.roots.lock().insert(root, health);
    }

    pub fn root_health(&self, root: SyncRootId) -> Option<SyncRootHealth> {
        self.roots.lock().get(&root).cloned()
    }

    pub fn snapshot(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            bytes_to_upload_current: self.bytes_to_upload_current.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_to_download_current: self.bytes_to_download_current.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            disk_full: self.disk_full(),
        }
    }
}

/// An immutable point-in-time copy of the counters, cheap to hand across
/// an API boundary (e.g. to the out-of-scope UI layer) without holding
/// any lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatusSnapshot {
    pub bytes_to_upload_current: u64,
    pub bytes_uploaded: u64,
    pub bytes_to_download_current: u64,
    pub bytes_downloaded: u64,
    pub disk_full: DiskFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uploaded_never_exceeds_registered_total() {
        let status = SyncStatus::default();
        status.add_bytes_to_upload(100);
        status.add_bytes_uploaded(60);
        let snap = status.snapshot();
        assert!(snap.bytes_uploaded <= snap.bytes_to_upload_current);
    }

    #[test]
    fn quota_snapshot_reports_full_at_or_above_limit() {
        let quota = QuotaSnapshot {
            used_bytes: 100,
            quota_bytes: 100,
        };
        assert_eq!(quota.disk_full(), DiskFull::Full);
    }

    #[test]
    fn root_health_round_trips() {
        let status = SyncStatus::default();
        let root = SyncRootId::generate();
        status.set_root_health(
            root,
            SyncRootHealth {
                healthy: false,
                last_error: Some("device mismatch".into()),
            },
        );
        let health = status.root_health(root).unwrap();
        assert!(!health.healthy);
    }
}
