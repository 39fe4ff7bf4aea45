//! The resumable-upload task queue (F): drains the `task` table the scanner
//! fills in, dispatching each row to the matching RPC call and deleting it
//! on success. Mirrors the teacher's `RemoteTimelineClient` queue — a
//! durable, restart-safe worklist consumed by a small pool of worker
//! threads rather than a single hot loop — generalized from "upload WAL
//! segments to S3" to "apply one filesystem change to the cloud API".
//!
//! Every worker thread drives its own async upload through
//! `tokio::runtime::Handle::block_on`: the catalog and local filesystem
//! calls in [`upload`] are blocking by construction, so there is no benefit
//! to spreading a single upload across the shared tokio reactor the way the
//! connection pool's sockets are.

mod upload;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use cloud_api::pool::ConnectionPool;
use cloud_api::protocol::{self, verbs, Request};
use cloud_api::CloudApiError;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::catalog::{self, Catalog, LocalFile, LocalFolder, Task, TaskType};
use crate::config::SyncConfig;
use crate::error::{SyncError, Severity};
use crate::speed::SpeedGovernor;
use crate::status::SyncStatus;
use upload::{dedupe_name, UploadContext};
use utils::id::{LocalFileId, LocalFolderId, RemoteFileId, RemoteFolderId, TaskId};

/// Application error code for a name already taken in the destination
/// folder, shared with the upload path's own conflict handling.
const NAME_CONFLICT_CODE: i64 = 2005;
const MAX_NAME_CONFLICT_RETRIES: u32 = 5;

/// How long a worker waits on no pending work before re-checking the queue,
/// so a task enqueued without a matching `wake()` is still picked up
/// eventually.
const IDLE_POLL: Duration = Duration::from_secs(5);
/// Backoff after a task fails with a retryable error, so a persistently
/// unreachable server doesn't spin a worker thread hot.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Resolves a sync-root's local path for a given local file/folder's
/// sync-id. The scanner already keeps one [`crate::catalog::SyncFolder`]
/// row per root; the task queue looks it up fresh per task rather than
/// caching, since roots can be added or removed while it runs.
pub trait RootPaths: Send + Sync {
    fn local_path(&self, syncid: utils::id::SyncId) -> Option<Utf8PathBuf>;
}

use camino::Utf8PathBuf;

/// In-memory exclusion set over local item rowids, guarding against two
/// worker threads dispatching two different tasks that touch the same
/// catalog row concurrently (the scanner can enqueue a fresh task for an
/// item while an older task on it is still in flight). Deliberately simple:
/// it does not skip past a locked head-of-line task to find other work, so
/// heavy contention on one item stalls the rest of the queue behind it —
/// acceptable given how rarely the same item is touched twice in quick
/// succession.
struct PathLocks {
    active: Mutex<HashSet<i64>>,
}

impl PathLocks {
    fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    fn try_acquire(self: &Arc<Self>, id: i64) -> Option<PathLockGuard> {
        let mut active = self.active.lock();
        if active.insert(id) {
            Some(PathLockGuard {
                locks: self.clone(),
                id,
            })
        } else {
            None
        }
    }
}

struct PathLockGuard {
    locks: Arc<PathLocks>,
    id: i64,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.locks.active.lock().remove(&self.id);
    }
}

pub struct TaskQueue {
    catalog: Catalog,
    pool: Arc<ConnectionPool>,
    rt: tokio::runtime::Handle,
    status: Arc<SyncStatus>,
    upload_speed: Arc<SpeedGovernor>,
    roots: Arc<dyn RootPaths>,
    cfg: parking_lot::RwLock<SyncConfig>,
    locks: Arc<PathLocks>,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    stop: AtomicBool,
    in_flight_uploads: AtomicUsize,
}

impl TaskQueue {
    pub fn new(
        catalog: Catalog,
        pool: Arc<ConnectionPool>,
        rt: tokio::runtime::Handle,
        status: Arc<SyncStatus>,
        upload_speed: Arc<SpeedGovernor>,
        roots: Arc<dyn RootPaths>,
        cfg: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            pool,
            rt,
            status,
            upload_speed,
            roots,
            cfg: parking_lot::RwLock::new(cfg),
            locks: Arc::new(PathLocks::new()),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            in_flight_uploads: AtomicUsize::new(0),
        })
    }

    pub fn set_config(&self, cfg: SyncConfig) {
        *self.cfg.write() = cfg;
    }

    pub fn wake(&self) {
        *self.wake.lock() = true;
        self.wake_cv.notify_all();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake_cv.notify_all();
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn wait_for_wake(&self, timeout: Duration) {
        let mut woken = self.wake.lock();
        if !*woken {
            self.wake_cv.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }

    /// Runs one worker loop until [`TaskQueue::stop`] is called. Intended to
    /// be called from `max_parallel_uploads` dedicated OS threads (plus a
    /// couple more for the cheap structural task types, or the same pool —
    /// either way every worker runs this same loop and the queue's own
    /// concurrency gates sort out who gets to do what).
    pub fn run_worker(self: &Arc<Self>) {
        while !self.stopping() {
            match self.claim_next() {
                Some((task, guard)) => {
                    let is_upload = task.kind == TaskType::UploadFile;
                    let result = self.rt.block_on(self.dispatch(&task));
                    self.finish(task, result);
                    drop(guard);
                    if is_upload {
                        self.in_flight_uploads.fetch_sub(1, Ordering::AcqRel);
                        metrics::UPLOADS_IN_PROGRESS.dec();
                    }
                    self.wake();
                }
                None => self.wait_for_wake(IDLE_POLL),
            }
        }
    }

    /// Picks the oldest not-in-progress task, subject to two gates: an
    /// `UPLOAD_FILE` task only claims a slot under `max_parallel_uploads`,
    /// and every other task type waits for zero uploads in flight (§4.6's
    /// "don't rename or delete out from under an upload that's still
    /// resolving its parent folder's remote id"). Neither gate skips ahead
    /// to a different, eligible task — see [`PathLocks`]'s doc comment for
    /// why that trade-off is acceptable here.
    fn claim_next(self: &Arc<Self>) -> Option<(Task, PathLockGuard)> {
        let txn = self.catalog.begin().ok()?;
        let task = catalog::next_pending_task(txn.conn()).ok()??;

        if task.kind == TaskType::UploadFile {
            let limit = self.cfg.read().max_parallel_uploads.max(1);
            if self.in_flight_uploads.load(Ordering::Acquire) >= limit {
                return None;
            }
        } else {
            let in_flight = catalog::count_in_progress_uploads(txn.conn(), None).ok()?;
            if in_flight > 0 {
                return None;
            }
        }

        let guard = self.locks.try_acquire(task.local_item_id)?;
        catalog::mark_task_in_progress(txn.conn(), task.id, true).ok()?;
        txn.commit().ok()?;

        if task.kind == TaskType::UploadFile {
            self.in_flight_uploads.fetch_add(1, Ordering::AcqRel);
            metrics::UPLOADS_IN_PROGRESS.inc();
        }
        Some((task, guard))
    }

    /// Deletes a task that finished, permanently failed, or can never
    /// succeed; leaves a retryable failure in place (un-claimed) for the
    /// next pass, pausing this worker briefly first so a persistent outage
    /// doesn't spin it.
    fn finish(&self, task: Task, result: Result<(), SyncError>) {
        let kind = task.kind.to_string();
        match result {
            Ok(()) => {
                metrics::TASKS_COMPLETED_TOTAL.with_label_values(&[&kind, "ok"]).inc();
                if let Ok(txn) = self.catalog.begin() {
                    let _ = catalog::delete_task(txn.conn(), task.id);
                    let _ = txn.commit();
                }
            }
            Err(e) => match e.severity() {
                Severity::RetryLater => {
                    warn!(task = task.id.0, kind = %task.kind, error = %e, "task failed, will retry");
                    metrics::TASKS_COMPLETED_TOTAL.with_label_values(&[&kind, "retry"]).inc();
                    if let Ok(txn) = self.catalog.begin() {
                        let _ = catalog::mark_task_in_progress(txn.conn(), task.id, false);
                        let _ = txn.commit();
                    }
                    std::thread::sleep(RETRY_BACKOFF);
                }
                Severity::Fatal | Severity::UserVisible => {
                    error!(task = task.id.0, kind = %task.kind, error = %e, "task abandoned");
                    metrics::TASKS_COMPLETED_TOTAL.with_label_values(&[&kind, "abandoned"]).inc();
                    if let Ok(txn) = self.catalog.begin() {
                        let _ = catalog::delete_task(txn.conn(), task.id);
                        let _ = txn.commit();
                    }
                }
            },
        }
    }

    async fn dispatch(&self, task: &Task) -> Result<(), SyncError> {
        match task.kind {
            TaskType::CreateRemoteFolder => self.dispatch_create_folder(task).await,
            TaskType::RenameRemoteFolder => self.dispatch_rename_folder(task).await,
            TaskType::RenameRemoteFile => self.dispatch_rename_file(task).await,
            TaskType::UploadFile => self.dispatch_upload(task).await,
            TaskType::DeleteRemoteFile => self.dispatch_delete_file(task).await,
            TaskType::DelrecRemoteFolder => self.dispatch_delete_folder(task).await,
        }
    }

    fn remote_parent_of(&self, parent: Option<LocalFolderId>) -> Result<RemoteFolderId, SyncError> {
        let conn = self.catalog.read_lock()?;
        let Some(parent_id) = parent else {
            return Err(SyncError::InvariantViolation(
                "a root local folder should never itself need a create-folder task".into(),
            ));
        };
        let parent_folder = catalog::get_local_folder(&conn, parent_id)?
            .ok_or_else(|| SyncError::InvariantViolation("task references a parent folder that no longer exists".into()))?;
        parent_folder
            .folder_id
            .ok_or_else(|| SyncError::InvariantViolation("parent folder has no remote id yet".into()))
    }

    fn get_folder(&self, id: LocalFolderId) -> Result<LocalFolder, SyncError> {
        let conn = self.catalog.read_lock()?;
        catalog::get_local_folder(&conn, id)?
            .ok_or_else(|| SyncError::InvariantViolation("task references a local folder that no longer exists".into()))
    }

    fn get_file(&self, id: LocalFileId) -> Result<LocalFile, SyncError> {
        let conn = self.catalog.read_lock()?;
        catalog::get_local_file(&conn, id)?
            .ok_or_else(|| SyncError::InvariantViolation("task references a local file that no longer exists".into()))
    }

    async fn dispatch_create_folder(&self, task: &Task) -> Result<(), SyncError> {
        let folder = self.get_folder(LocalFolderId(task.local_item_id))?;
        let parent_remote = self.remote_parent_of(folder.parent_id)?;

        let mut name = folder.name.clone();
        for attempt in 0..MAX_NAME_CONFLICT_RETRIES {
            let req = Request::new(verbs::CREATEFOLDERIFNOTEXISTS)
                .with("parentfolderid", parent_remote.0)
                .with("name", name.clone());
            match protocol::call_pooled(&self.pool, &req).await {
                Ok(resp) => {
                    let fields = resp.into_result()?;
                    let id = fields
                        .get("folderid")
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| SyncError::InvariantViolation("createfolderifnotexists missing folderid".into()))?;
                    let txn = self.catalog.begin()?;
                    catalog::set_local_folder_remote_id(txn.conn(), folder.id, RemoteFolderId(id))?;
                    if name != folder.name {
                        catalog::move_local_folder(txn.conn(), folder.id, folder.parent_id, &name)?;
                    }
                    txn.commit()?;
                    return Ok(());
                }
                Err(CloudApiError::Application { code, .. }) if code == NAME_CONFLICT_CODE => {
                    name = dedupe_name(&folder.name, attempt + 1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SyncError::InvariantViolation(format!(
            "exhausted name-conflict retries creating folder '{}'",
            folder.name
        )))
    }

    async fn dispatch_rename_folder(&self, task: &Task) -> Result<(), SyncError> {
        let folder = self.get_folder(LocalFolderId(task.local_item_id))?;
        let Some(remote_id) = folder.folder_id else {
            // Never made it to the server under its old name; nothing to
            // rename remotely, the eventual create will use the new name.
            return Ok(());
        };
        let name = task
            .name
            .clone()
            .ok_or_else(|| SyncError::InvariantViolation("rename-folder task missing a target name".into()))?;
        let req = Request::new(verbs::RENAMEFOLDER).with("folderid", remote_id.0).with("name", name);
        protocol::call_pooled(&self.pool, &req).await?.into_result()?;
        Ok(())
    }

    async fn dispatch_rename_file(&self, task: &Task) -> Result<(), SyncError> {
        let file = self.get_file(LocalFileId(task.local_item_id))?;
        let Some(remote_id) = file.file_id else {
            return Ok(());
        };
        let name = task
            .name
            .clone()
            .ok_or_else(|| SyncError::InvariantViolation("rename-file task missing a target name".into()))?;
        let req = Request::new(verbs::RENAMEFILE).with("fileid", remote_id.0).with("name", name);
        protocol::call_pooled(&self.pool, &req).await?.into_result()?;
        Ok(())
    }

    async fn dispatch_delete_file(&self, task: &Task) -> Result<(), SyncError> {
        let Some(remote) = task.item_id else {
            return Ok(());
        };
        let req = Request::new(verbs::DELETEFILE).with("fileid", remote as u64);
        match protocol::call_pooled(&self.pool, &req).await {
            Ok(resp) => {
                resp.into_result()?;
                Ok(())
            }
            Err(CloudApiError::Application { code, .. }) if code == upload::NOT_FOUND_CODE => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn dispatch_delete_folder(&self, task: &Task) -> Result<(), SyncError> {
        let Some(remote) = task.item_id else {
            return Ok(());
        };
        let req = Request::new(verbs::DELETEFOLDERRECURSIVE).with("folderid", remote as u64);
        match protocol::call_pooled(&self.pool, &req).await {
            Ok(resp) => {
                resp.into_result()?;
                Ok(())
            }
            Err(CloudApiError::Application { code, .. }) if code == upload::NOT_FOUND_CODE => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn dispatch_upload(&self, task: &Task) -> Result<(), SyncError> {
        let file = self.get_file(LocalFileId(task.local_item_id))?;
        let parent_folder = self.get_folder(file.parent_id)?;
        let parent_remote = parent_folder
            .folder_id
            .ok_or_else(|| SyncError::InvariantViolation("upload task's parent folder has no remote id yet".into()))?;
        let root_path = self
            .roots
            .local_path(file.syncid)
            .ok_or_else(|| SyncError::InvariantViolation("upload task references an unknown sync-root".into()))?;
        let disk_path = local_disk_path(&self.catalog, &root_path, &file)?;

        let cfg = self.cfg.read().clone();
        let ctx = UploadContext {
            catalog: &self.catalog,
            pool: &self.pool,
            status: &self.status,
            upload_speed: &self.upload_speed,
            min_size_for_checksums: cfg.min_size_for_checksums,
        };
        let outcome = upload::upload_file(&ctx, parent_remote, &file, &disk_path).await?;

        let txn = self.catalog.begin()?;
        catalog::set_local_file_remote(txn.conn(), file.id, outcome.file_id, &outcome.hash)?;
        txn.commit()?;
        Ok(())
    }
}

/// Reconstructs a local file's absolute path by walking its folder chain
/// back up to the sync-root, since the catalog stores only a parent-id
/// chain, not a denormalized path column (§6).
fn local_disk_path(catalog: &Catalog, root_path: &Utf8Path, file: &LocalFile) -> Result<Utf8PathBuf, SyncError> {
    let mut names = vec![file.name.clone()];
    let mut current = Some(file.parent_id);
    let conn = catalog.read_lock()?;
    while let Some(id) = current {
        let folder = catalog::get_local_folder(&conn, id)?
            .ok_or_else(|| SyncError::InvariantViolation("file's folder chain references a missing folder".into()))?;
        if folder.parent_id.is_some() {
            names.push(folder.name.clone());
        }
        current = folder.parent_id;
    }
    let mut path = root_path.to_owned();
    for name in names.into_iter().rev() {
        path.push(name);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{LocalFolder, SyncFolder, SyncType};
    use utils::id::SyncId;

    struct FixedRoot(Utf8PathBuf);
    impl RootPaths for FixedRoot {
        fn local_path(&self, _syncid: SyncId) -> Option<Utf8PathBuf> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn path_locks_prevent_acquiring_the_same_id_twice() {
        let locks = Arc::new(PathLocks::new());
        let _first = locks.try_acquire(7).unwrap();
        assert!(locks.try_acquire(7).is_none());
        assert!(locks.try_acquire(8).is_some());
    }

    #[test]
    fn path_lock_releases_on_drop() {
        let locks = Arc::new(PathLocks::new());
        {
            let _guard = locks.try_acquire(3).unwrap();
        }
        assert!(locks.try_acquire(3).is_some());
    }

    #[test]
    fn local_disk_path_walks_the_folder_chain() {
        let cat = Catalog::open_in_memory().unwrap();
        let txn = cat.begin().unwrap();
        let syncid = catalog::insert_sync_folder(
            txn.conn(),
            &SyncFolder {
                id: SyncId(0),
                folder_id: utils::id::RemoteFolderId(1),
                local_path: "/home/user/docs".into(),
                synctype: SyncType::Full,
                device_id: 1,
                inode: 1,
            },
        )
        .unwrap();
        let sub = catalog::insert_local_folder(
            txn.conn(),
            &LocalFolder {
                id: LocalFolderId(0),
                syncid,
                parent_id: None,
                name: "root".into(),
                inode: 1,
                device_id: 1,
                mtime: 0,
                mtime_native: 0,
                flags: 0,
                folder_id: Some(utils::id::RemoteFolderId(1)),
            },
        )
        .unwrap();
        let nested = catalog::insert_local_folder(
            txn.conn(),
            &LocalFolder {
                id: LocalFolderId(0),
                syncid,
                parent_id: Some(sub),
                name: "nested".into(),
                inode: 2,
                device_id: 1,
                mtime: 0,
                mtime_native: 0,
                flags: 0,
                folder_id: None,
            },
        )
        .unwrap();
        let file = LocalFile {
            id: LocalFileId(0),
            syncid,
            parent_id: nested,
            name: "a.txt".into(),
            inode: 3,
            size: 0,
            mtime: 0,
            mtime_native: 0,
            checksum: None,
            file_id: None,
            hash: None,
        };
        txn.commit().unwrap();

        let path = local_disk_path(&cat, Utf8Path::new("/home/user/docs"), &file).unwrap();
        assert_eq!(path, Utf8PathBuf::from("/home/user/docs/nested/a.txt"));
    }
}
