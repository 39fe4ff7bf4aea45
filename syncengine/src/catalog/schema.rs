//! DDL for the eight catalog tables of §6. Kept as one idempotent
//! `CREATE TABLE IF NOT EXISTS` batch rather than a migration chain: the
//! catalog is a disposable shadow of remote state, not a system of record,
//! so "drop the file and let the next scan repopulate it" is an acceptable
//! recovery path and there is nothing to migrate forward.

use rusqlite::Connection;

use crate::error::SyncError;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS syncfolder (
    id        INTEGER PRIMARY KEY,
    folderid  INTEGER NOT NULL,
    localpath TEXT NOT NULL UNIQUE,
    synctype  TEXT NOT NULL,
    deviceid  INTEGER NOT NULL,
    inode     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS localfolder (
    id                  INTEGER PRIMARY KEY,
    syncid              INTEGER NOT NULL,
    localparentfolderid INTEGER,
    name                TEXT NOT NULL,
    inode               INTEGER NOT NULL,
    deviceid            INTEGER NOT NULL,
    mtime               INTEGER NOT NULL,
    mtimenative         INTEGER NOT NULL,
    flags               INTEGER NOT NULL DEFAULT 0,
    folderid            INTEGER,
    UNIQUE (syncid, localparentfolderid, name)
);

CREATE TABLE IF NOT EXISTS localfile (
    id                  INTEGER PRIMARY KEY,
    syncid              INTEGER NOT NULL,
    localparentfolderid INTEGER NOT NULL,
    name                TEXT NOT NULL,
    inode               INTEGER NOT NULL,
    size                INTEGER NOT NULL,
    mtime               INTEGER NOT NULL,
    mtimenative         INTEGER NOT NULL,
    checksum            TEXT,
    fileid              INTEGER,
    hash                TEXT,
    UNIQUE (syncid, localparentfolderid, name)
);

CREATE TABLE IF NOT EXISTS task (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    type         TEXT NOT NULL,
    syncid       INTEGER NOT NULL,
    itemid       INTEGER,
    localitemid  INTEGER NOT NULL,
    newitemid    INTEGER,
    name         TEXT,
    newsyncid    INTEGER,
    inprogress   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS syncedfolder (
    syncid        INTEGER NOT NULL,
    localfolderid INTEGER NOT NULL,
    synctype      TEXT NOT NULL,
    folderid      INTEGER NOT NULL,
    PRIMARY KEY (syncid, localfolderid)
);

CREATE TABLE IF NOT EXISTS localfileupload (
    localfileid INTEGER NOT NULL,
    uploadid    INTEGER NOT NULL,
    PRIMARY KEY (localfileid, uploadid)
);

CREATE TABLE IF NOT EXISTS hashchecksum (
    hash     TEXT NOT NULL,
    size     INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    PRIMARY KEY (hash, size)
);

CREATE TABLE IF NOT EXISTS filerevision (
    fileid INTEGER NOT NULL,
    hash   TEXT NOT NULL,
    ctime  INTEGER NOT NULL,
    size   INTEGER NOT NULL,
    PRIMARY KEY (fileid, hash)
);

CREATE TABLE IF NOT EXISTS setting (
    id    TEXT PRIMARY KEY,
    value TEXT
);

CREATE INDEX IF NOT EXISTS idx_localfile_parent ON localfile(syncid, localparentfolderid);
CREATE INDEX IF NOT EXISTS idx_localfolder_parent ON localfolder(syncid, localparentfolderid);
CREATE INDEX IF NOT EXISTS idx_task_inprogress ON task(type, inprogress);
";

pub fn init(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(DDL).map_err(SyncError::Catalog)
}
