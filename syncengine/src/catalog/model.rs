//! Typed rows and accessors for the eight catalog tables of §6. Each
//! function takes a `&rusqlite::Connection` (reached via [`super::Txn::conn`]
//! or [`super::Catalog::read_lock`]) rather than owning one, so callers
//! control transaction boundaries explicitly.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use utils::id::{LocalFileId, LocalFolderId, RemoteFileId, RemoteFolderId, SyncId, TaskId, UploadId};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum SyncType {
    DownloadOnly,
    UploadOnly,
    Full,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    CreateRemoteFolder,
    RenameRemoteFile,
    RenameRemoteFolder,
    UploadFile,
    DeleteRemoteFile,
    DelrecRemoteFolder,
}

#[derive(Debug, Clone)]
pub struct SyncFolder {
    pub id: SyncId,
    pub folder_id: RemoteFolderId,
    pub local_path: String,
    pub synctype: SyncType,
    pub device_id: u64,
    pub inode: u64,
}

#[derive(Debug, Clone)]
pub struct LocalFolder {
    pub id: LocalFolderId,
    pub syncid: SyncId,
    pub parent_id: Option<LocalFolderId>,
    pub name: String,
    pub inode: u64,
    pub device_id: u64,
    pub mtime: i64,
    pub mtime_native: i64,
    pub flags: i64,
    pub folder_id: Option<RemoteFolderId>,
}

#[derive(Debug, Clone)]
pub struct LocalFile {
    pub id: LocalFileId,
    pub syncid: SyncId,
    pub parent_id: LocalFolderId,
    pub name: String,
    pub inode: u64,
    pub size: u64,
    pub mtime: i64,
    pub mtime_native: i64,
    pub checksum: Option<String>,
    pub file_id: Option<RemoteFileId>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskType,
    pub syncid: SyncId,
    pub item_id: Option<i64>,
    pub local_item_id: i64,
    pub new_item_id: Option<i64>,
    pub name: Option<String>,
    pub new_syncid: Option<SyncId>,
    pub in_progress: bool,
}

fn local_folder_from_row(row: &Row<'_>) -> rusqlite::Result<LocalFolder> {
    Ok(LocalFolder {
        id: LocalFolderId(row.get(0)?),
        syncid: SyncId(row.get(1)?),
        parent_id: row.get::<_, Option<i64>>(2)?.map(LocalFolderId),
        name: row.get(3)?,
        inode: row.get::<_, i64>(4)? as u64,
        device_id: row.get::<_, i64>(5)? as u64,
        mtime: row.get(6)?,
        mtime_native: row.get(7)?,
        flags: row.get(8)?,
        folder_id: row.get::<_, Option<i64>>(9)?.map(|v| RemoteFolderId(v as u64)),
    })
}

fn local_file_from_row(row: &Row<'_>) -> rusqlite::Result<LocalFile> {
    Ok(LocalFile {
        id: LocalFileId(row.get(0)?),
        syncid: SyncId(row.get(1)?),
        parent_id: LocalFolderId(row.get(2)?),
        name: row.get(3)?,
        inode: row.get::<_, i64>(4)? as u64,
        size: row.get::<_, i64>(5)? as u64,
        mtime: row.get(6)?,
        mtime_native: row.get(7)?,
        checksum: row.get(8)?,
        file_id: row.get::<_, Option<i64>>(9)?.map(|v| RemoteFileId(v as u64)),
        hash: row.get(10)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let kind_str: String = row.get(1)?;
    Ok(Task {
        id: TaskId(row.get(0)?),
        kind: kind_str.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(1, "type".into(), rusqlite::types::Type::Text)
        })?,
        syncid: SyncId(row.get(2)?),
        item_id: row.get(3)?,
        local_item_id: row.get(4)?,
        new_item_id: row.get(5)?,
        name: row.get(6)?,
        new_syncid: row.get::<_, Option<i64>>(7)?.map(SyncId),
        in_progress: row.get::<_, i64>(8)? != 0,
    })
}

fn sync_folder_from_row(row: &Row<'_>) -> rusqlite::Result<SyncFolder> {
    Ok(SyncFolder {
        id: SyncId(row.get(0)?),
        folder_id: RemoteFolderId(row.get::<_, i64>(1)? as u64),
        local_path: row.get(2)?,
        synctype: row.get::<_, String>(3)?.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(3, "synctype".into(), rusqlite::types::Type::Text)
        })?,
        device_id: row.get::<_, i64>(4)? as u64,
        inode: row.get::<_, i64>(5)? as u64,
    })
}

pub fn insert_sync_folder(conn: &Connection, f: &SyncFolder) -> Result<SyncId, SyncError> {
    conn.execute(
        "INSERT INTO syncfolder(folderid, localpath, synctype, deviceid, inode) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![f.folder_id.0 as i64, f.local_path, f.synctype.to_string(), f.device_id as i64, f.inode as i64],
    )
    .map_err(SyncError::Catalog)?;
    Ok(SyncId(conn.last_insert_rowid()))
}

pub fn list_sync_folders(conn: &Connection) -> Result<Vec<SyncFolder>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT id, folderid, localpath, synctype, deviceid, inode FROM syncfolder ORDER BY id")
        .map_err(SyncError::Catalog)?;
    let rows = stmt.query_map([], sync_folder_from_row).map_err(SyncError::Catalog)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(SyncError::Catalog)
}

pub fn get_sync_folder(conn: &Connection, id: SyncId) -> Result<Option<SyncFolder>, SyncError> {
    conn.query_row(
        "SELECT id, folderid, localpath, synctype, deviceid, inode FROM syncfolder WHERE id = ?1",
        params![id.0],
        sync_folder_from_row,
    )
    .optional()
    .map_err(SyncError::Catalog)
}

pub fn delete_sync_folder(conn: &Connection, id: SyncId) -> Result<(), SyncError> {
    conn.execute("DELETE FROM syncfolder WHERE id = ?1", params![id.0])
        .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn insert_local_folder(conn: &Connection, f: &LocalFolder) -> Result<LocalFolderId, SyncError> {
    conn.execute(
        "INSERT INTO localfolder(syncid, localparentfolderid, name, inode, deviceid, mtime, mtimenative, flags, folderid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            f.syncid.0,
            f.parent_id.map(|p| p.0),
            f.name,
            f.inode as i64,
            f.device_id as i64,
            f.mtime,
            f.mtime_native,
            f.flags,
            f.folder_id.map(|v| v.0 as i64),
        ],
    )
    .map_err(SyncError::Catalog)?;
    Ok(LocalFolderId(conn.last_insert_rowid()))
}

pub fn set_local_folder_remote_id(
    conn: &Connection,
    id: LocalFolderId,
    remote: RemoteFolderId,
) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE localfolder SET folderid = ?1 WHERE id = ?2",
        params![remote.0 as i64, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn list_local_folders(conn: &Connection, syncid: SyncId, parent: Option<LocalFolderId>) -> Result<Vec<LocalFolder>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, syncid, localparentfolderid, name, inode, deviceid, mtime, mtimenative, flags, folderid
             FROM localfolder WHERE syncid = ?1 AND localparentfolderid IS ?2 ORDER BY name",
        )
        .map_err(SyncError::Catalog)?;
    let rows = stmt
        .query_map(params![syncid.0, parent.map(|p| p.0)], local_folder_from_row)
        .map_err(SyncError::Catalog)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(SyncError::Catalog)
}

pub fn delete_local_folder(conn: &Connection, id: LocalFolderId) -> Result<(), SyncError> {
    conn.execute("DELETE FROM localfolder WHERE id = ?1", params![id.0])
        .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn get_local_folder(conn: &Connection, id: LocalFolderId) -> Result<Option<LocalFolder>, SyncError> {
    conn.query_row(
        "SELECT id, syncid, localparentfolderid, name, inode, deviceid, mtime, mtimenative, flags, folderid
         FROM localfolder WHERE id = ?1",
        params![id.0],
        local_folder_from_row,
    )
    .optional()
    .map_err(SyncError::Catalog)
}

/// Finds the single local-folder row identifying a sync-root's top-level
/// directory (`parent IS NULL`, stat matches the recorded root). Used once
/// per sync-root to bootstrap its row on first scan.
pub fn find_root_local_folder(conn: &Connection, syncid: SyncId, device_id: u64, inode: u64) -> Result<Option<LocalFolder>, SyncError> {
    conn.query_row(
        "SELECT id, syncid, localparentfolderid, name, inode, deviceid, mtime, mtimenative, flags, folderid
         FROM localfolder WHERE syncid = ?1 AND localparentfolderid IS NULL AND deviceid = ?2 AND inode = ?3",
        params![syncid.0, device_id as i64, inode as i64],
        local_folder_from_row,
    )
    .optional()
    .map_err(SyncError::Catalog)
}

/// Updates a folder's stat fields in place, used when a folder's identity
/// (inode) is unchanged but its parent record has gone stale (root
/// re-bootstrap) — not used for ordinary scans, which instead treat a
/// stat-identity change as delete-then-new (see `scanner::diff`).
pub fn update_local_folder_stat(
    conn: &Connection,
    id: LocalFolderId,
    inode: u64,
    device_id: u64,
    mtime: i64,
    mtime_native: i64,
) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE localfolder SET inode = ?1, deviceid = ?2, mtime = ?3, mtimenative = ?4 WHERE id = ?5",
        params![inode as i64, device_id as i64, mtime, mtime_native, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

/// Renames and/or reparents a folder in one statement — the catalog side of
/// a `RENAME_REMOTE_FOLDER` task, covering both an in-place rename and a
/// cross-directory move (the same operation, from the catalog's point of
/// view).
pub fn move_local_folder(conn: &Connection, id: LocalFolderId, new_parent: Option<LocalFolderId>, new_name: &str) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE localfolder SET localparentfolderid = ?1, name = ?2 WHERE id = ?3",
        params![new_parent.map(|p| p.0), new_name, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn insert_local_file(conn: &Connection, f: &LocalFile) -> Result<LocalFileId, SyncError> {
    conn.execute(
        "INSERT INTO localfile(syncid, localparentfolderid, name, inode, size, mtime, mtimenative, checksum, fileid, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            f.syncid.0,
            f.parent_id.0,
            f.name,
            f.inode as i64,
            f.size as i64,
            f.mtime,
            f.mtime_native,
            f.checksum,
            f.file_id.map(|v| v.0 as i64),
            f.hash,
        ],
    )
    .map_err(SyncError::Catalog)?;
    Ok(LocalFileId(conn.last_insert_rowid()))
}

pub fn update_local_file_stat(
    conn: &Connection,
    id: LocalFileId,
    size: u64,
    mtime: i64,
    mtime_native: i64,
    inode: u64,
) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE localfile SET size = ?1, mtime = ?2, mtimenative = ?3, inode = ?4, checksum = NULL WHERE id = ?5",
        params![size as i64, mtime, mtime_native, inode as i64, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn set_local_file_remote(
    conn: &Connection,
    id: LocalFileId,
    file_id: RemoteFileId,
    hash: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE localfile SET fileid = ?1, hash = ?2 WHERE id = ?3",
        params![file_id.0 as i64, hash, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn set_local_file_checksum(conn: &Connection, id: LocalFileId, checksum: &str) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE localfile SET checksum = ?1 WHERE id = ?2",
        params![checksum, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn rename_local_file(conn: &Connection, id: LocalFileId, new_name: &str) -> Result<(), SyncError> {
    conn.execute("UPDATE localfile SET name = ?1 WHERE id = ?2", params![new_name, id.0])
        .map_err(SyncError::Catalog)?;
    Ok(())
}

/// Renames and/or reparents a file in one statement — a move, a rename, or
/// both are the same catalog update.
pub fn move_local_file(conn: &Connection, id: LocalFileId, new_parent: LocalFolderId, new_name: &str) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE localfile SET localparentfolderid = ?1, name = ?2 WHERE id = ?3",
        params![new_parent.0, new_name, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn list_local_files(conn: &Connection, syncid: SyncId, parent: LocalFolderId) -> Result<Vec<LocalFile>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, syncid, localparentfolderid, name, inode, size, mtime, mtimenative, checksum, fileid, hash
             FROM localfile WHERE syncid = ?1 AND localparentfolderid = ?2 ORDER BY name",
        )
        .map_err(SyncError::Catalog)?;
    let rows = stmt
        .query_map(params![syncid.0, parent.0], local_file_from_row)
        .map_err(SyncError::Catalog)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(SyncError::Catalog)
}

pub fn get_local_file(conn: &Connection, id: LocalFileId) -> Result<Option<LocalFile>, SyncError> {
    conn.query_row(
        "SELECT id, syncid, localparentfolderid, name, inode, size, mtime, mtimenative, checksum, fileid, hash
         FROM localfile WHERE id = ?1",
        params![id.0],
        local_file_from_row,
    )
    .optional()
    .map_err(SyncError::Catalog)
}

pub fn delete_local_file(conn: &Connection, id: LocalFileId) -> Result<(), SyncError> {
    conn.execute("DELETE FROM localfile WHERE id = ?1", params![id.0])
        .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn enqueue_task(conn: &Connection, t: &Task) -> Result<TaskId, SyncError> {
    conn.execute(
        "INSERT INTO task(type, syncid, itemid, localitemid, newitemid, name, newsyncid, inprogress)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
        params![
            t.kind.to_string(),
            t.syncid.0,
            t.item_id,
            t.local_item_id,
            t.new_item_id,
            t.name,
            t.new_syncid.map(|s| s.0),
        ],
    )
    .map_err(SyncError::Catalog)?;
    Ok(TaskId(conn.last_insert_rowid()))
}

/// Oldest not-in-progress task, enforcing §3 invariant 2 (task-id ordering)
/// by always taking the smallest id first.
pub fn next_pending_task(conn: &Connection) -> Result<Option<Task>, SyncError> {
    conn.query_row(
        "SELECT id, type, syncid, itemid, localitemid, newitemid, name, newsyncid, inprogress
         FROM task WHERE inprogress = 0 ORDER BY id LIMIT 1",
        [],
        task_from_row,
    )
    .optional()
    .map_err(SyncError::Catalog)
}

pub fn mark_task_in_progress(conn: &Connection, id: TaskId, in_progress: bool) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE task SET inprogress = ?1 WHERE id = ?2",
        params![in_progress as i64, id.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn delete_task(conn: &Connection, id: TaskId) -> Result<(), SyncError> {
    conn.execute("DELETE FROM task WHERE id = ?1", params![id.0])
        .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn count_in_progress_uploads(conn: &Connection, syncid: Option<SyncId>) -> Result<i64, SyncError> {
    match syncid {
        Some(s) => conn
            .query_row(
                "SELECT COUNT(*) FROM task WHERE type = ?1 AND inprogress = 1 AND syncid = ?2",
                params![TaskType::UploadFile.to_string(), s.0],
                |r| r.get(0),
            )
            .map_err(SyncError::Catalog),
        None => conn
            .query_row(
                "SELECT COUNT(*) FROM task WHERE type = ?1 AND inprogress = 1",
                params![TaskType::UploadFile.to_string()],
                |r| r.get(0),
            )
            .map_err(SyncError::Catalog),
    }
}

pub fn delete_queued_tasks_for_sync(conn: &Connection, syncid: SyncId) -> Result<usize, SyncError> {
    conn.execute(
        "DELETE FROM task WHERE syncid = ?1 AND inprogress = 0",
        params![syncid.0],
    )
    .map_err(SyncError::Catalog)
}

pub fn add_upload_id(conn: &Connection, local_file: LocalFileId, upload: UploadId) -> Result<(), SyncError> {
    conn.execute(
        "INSERT OR IGNORE INTO localfileupload(localfileid, uploadid) VALUES (?1, ?2)",
        params![local_file.0, upload.0 as i64],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn list_upload_ids(conn: &Connection, local_file: LocalFileId) -> Result<Vec<UploadId>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT uploadid FROM localfileupload WHERE localfileid = ?1")
        .map_err(SyncError::Catalog)?;
    let rows = stmt
        .query_map(params![local_file.0], |r| r.get::<_, i64>(0).map(|v| UploadId(v as u64)))
        .map_err(SyncError::Catalog)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(SyncError::Catalog)
}

/// Best-effort cleanup of stored upload-ids after a successful `upload_save`
/// (§4.6 step 7): failures here are swallowed by the caller, matching
/// "deleted on a best-effort basis".
pub fn clear_upload_ids(conn: &Connection, local_file: LocalFileId) -> Result<(), SyncError> {
    conn.execute(
        "DELETE FROM localfileupload WHERE localfileid = ?1",
        params![local_file.0],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>, SyncError> {
    conn.query_row("SELECT value FROM setting WHERE id = ?1", params![key], |r| r.get(0))
        .optional()
        .map_err(SyncError::Catalog)
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO setting(id, value) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn cache_hash_checksum(conn: &Connection, hash: &str, size: u64, checksum: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT OR REPLACE INTO hashchecksum(hash, size, checksum) VALUES (?1, ?2, ?3)",
        params![hash, size as i64, checksum],
    )
    .map_err(SyncError::Catalog)?;
    Ok(())
}

pub fn lookup_hash_checksum(conn: &Connection, hash: &str, size: u64) -> Result<Option<String>, SyncError> {
    conn.query_row(
        "SELECT checksum FROM hashchecksum WHERE hash = ?1 AND size = ?2",
        params![hash, size as i64],
        |r| r.get(0),
    )
    .optional()
    .map_err(SyncError::Catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn sample_folder(syncid: SyncId) -> LocalFolder {
        LocalFolder {
            id: LocalFolderId(0),
            syncid,
            parent_id: None,
            name: "root".into(),
            inode: 1,
            device_id: 1,
            mtime: 0,
            mtime_native: 0,
            flags: 0,
            folder_id: None,
        }
    }

    #[test]
    fn insert_and_list_local_file_round_trips() {
        let cat = Catalog::open_in_memory().unwrap();
        let txn = cat.begin().unwrap();
        let folder_id = insert_local_folder(txn.conn(), &sample_folder(SyncId(1))).unwrap();

        let file = LocalFile {
            id: LocalFileId(0),
            syncid: SyncId(1),
            parent_id: folder_id,
            name: "hello.txt".into(),
            inode: 42,
            size: 12,
            mtime: 1000,
            mtime_native: 1000,
            checksum: None,
            file_id: None,
            hash: None,
        };
        let id = insert_local_file(txn.conn(), &file).unwrap();
        txn.commit().unwrap();

        let guard = cat.read_lock().unwrap();
        let listed = list_local_files(&guard, SyncId(1), folder_id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].name, "hello.txt");
    }

    #[test]
    fn task_queue_orders_by_id_and_skips_in_progress() {
        let cat = Catalog::open_in_memory().unwrap();
        let txn = cat.begin().unwrap();
        let t1 = enqueue_task(
            txn.conn(),
            &Task {
                id: TaskId(0),
                kind: TaskType::UploadFile,
                syncid: SyncId(1),
                item_id: None,
                local_item_id: 10,
                new_item_id: None,
                name: None,
                new_syncid: None,
                in_progress: false,
            },
        )
        .unwrap();
        mark_task_in_progress(txn.conn(), t1, true).unwrap();
        enqueue_task(
            txn.conn(),
            &Task {
                id: TaskId(0),
                kind: TaskType::DeleteRemoteFile,
                syncid: SyncId(1),
                item_id: Some(5),
                local_item_id: 11,
                new_item_id: None,
                name: None,
                new_syncid: None,
                in_progress: false,
            },
        )
        .unwrap();
        txn.commit().unwrap();

        let guard = cat.read_lock().unwrap();
        let next = next_pending_task(&guard).unwrap().unwrap();
        assert_eq!(next.kind, TaskType::DeleteRemoteFile);
    }

    #[test]
    fn setting_upsert_overwrites_existing_value() {
        let cat = Catalog::open_in_memory().unwrap();
        let txn = cat.begin().unwrap();
        set_setting(txn.conn(), "usessl", "0").unwrap();
        set_setting(txn.conn(), "usessl", "1").unwrap();
        txn.commit().unwrap();

        let guard = cat.read_lock().unwrap();
        assert_eq!(get_setting(&guard, "usessl").unwrap().as_deref(), Some("1"));
    }
}
