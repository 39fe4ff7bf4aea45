//! The resumable upload state machine of §4.6: wait out an in-progress
//! write, hash the file, try same-hash dedup against the server's checksum
//! index, then either a single-shot small-file upload or a block-matched
//! big-file upload built from whatever checksums an existing remote
//! revision or a resumed upload already gives us.
//!
//! Runs on the task-queue worker's own blocking thread (via
//! `Handle::block_on`, see [`super`]), so the blocking `std::fs` reads here
//! and the blocking [`speed::throttle`] wait never contend with the tokio
//! reactor driving the connection pool's sockets.

use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, SystemTime};

use blocksync::{Action, ChecksumTable, Plan};
use camino::Utf8Path;
use cloud_api::pool::ConnectionPool;
use cloud_api::protocol::{self, parse_block_checksums, verbs, BlockChecksumHeader, Request, BLOCK_CHECKSUM_HEADER_LEN};
use cloud_api::CloudApiError;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::catalog::{self, Catalog, LocalFile};
use crate::error::SyncError;
use crate::speed::{self, SpeedGovernor};
use crate::status::SyncStatus;
use utils::id::{LocalFileId, RemoteFileId, RemoteFolderId, UploadId};

/// §9 open question: the original leaves the "mtime too new, file may still
/// be being written" wait unbounded. We clamp it so a file under continuous
/// active writes eventually uploads anyway instead of wedging a worker slot
/// forever; see DESIGN.md.
const MTIME_SETTLE_RETRIES: u32 = 10;
const MTIME_SETTLE_GRACE: Duration = Duration::from_secs(2);

/// No single server-side copy request may reference more than this many
/// bytes of source data.
const COPY_REQUEST_MAX_LEN: u64 = 16 * 1024 * 1024;

/// Bytes sent per `upload_write` call; keeps the speed governor's per-second
/// throttle granular instead of blocking in multi-megabyte bites.
const TRANSFER_CHUNK_LEN: u64 = 256 * 1024;

/// Application error code the server returns for "no such file/upload/
/// revision", used here to mean "nothing to dedup or resume against" rather
/// than a caller-visible failure.
pub(super) const NOT_FOUND_CODE: i64 = 2009;
/// Application error code for a name already taken in the destination
/// folder.
const NAME_CONFLICT_CODE: i64 = 2005;
const MAX_NAME_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopySource {
    /// Matched against the file's last-synced remote revision.
    Existing,
    /// Matched against bytes already written to a resumed upload.
    Resume,
}

pub struct UploadOutcome {
    pub file_id: RemoteFileId,
    pub hash: String,
}

pub struct UploadContext<'a> {
    pub catalog: &'a Catalog,
    pub pool: &'a ConnectionPool,
    pub status: &'a SyncStatus,
    pub upload_speed: &'a SpeedGovernor,
    pub min_size_for_checksums: u64,
}

/// Uploads `local`'s current on-disk content at `disk_path` into `parent`,
/// deduplicating or resuming wherever the server lets us.
pub async fn upload_file(
    ctx: &UploadContext<'_>,
    parent: RemoteFolderId,
    local: &LocalFile,
    disk_path: &Utf8Path,
) -> Result<UploadOutcome, SyncError> {
    wait_until_settled(disk_path)?;

    let (size, hash) = hash_file(disk_path)?;

    if let Some(existing) = find_by_checksum(ctx, &hash, size).await? {
        return copy_existing(ctx, parent, local, &hash, existing, size).await;
    }

    if size < ctx.min_size_for_checksums {
        small_upload(ctx, parent, local, disk_path, size, &hash).await
    } else {
        big_upload(ctx, parent, local, disk_path, size, &hash).await
    }
}

fn wait_until_settled(path: &Utf8Path) -> Result<(), SyncError> {
    for _ in 0..MTIME_SETTLE_RETRIES {
        let meta = std::fs::metadata(path.as_std_path())?;
        let mtime = meta.modified()?;
        let age = SystemTime::now().duration_since(mtime).unwrap_or(Duration::ZERO);
        if age >= MTIME_SETTLE_GRACE {
            return Ok(());
        }
        std::thread::sleep(MTIME_SETTLE_GRACE - age);
    }
    warn!(path = %path, "file mtime kept advancing past the settle budget, uploading anyway");
    Ok(())
}

fn hash_file(path: &Utf8Path) -> Result<(u64, String), SyncError> {
    let mut file = std::fs::File::open(path.as_std_path())?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

fn read_range(path: &Utf8Path, offset: u64, len: u64) -> Result<Vec<u8>, SyncError> {
    let mut file = std::fs::File::open(path.as_std_path())?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Runs `req`, treating the `NOT_FOUND_CODE` application error as "no
/// result" instead of propagating it.
async fn call_optional(
    pool: &ConnectionPool,
    req: Request,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, SyncError> {
    match protocol::call_pooled(pool, &req).await {
        Ok(resp) => match resp.into_result() {
            Ok(fields) => Ok(Some(fields)),
            Err(CloudApiError::Application { code, .. }) if code == NOT_FOUND_CODE => Ok(None),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

async fn find_by_checksum(ctx: &UploadContext<'_>, hash: &str, size: u64) -> Result<Option<RemoteFileId>, SyncError> {
    let req = Request::new(verbs::GETFILESBYCHECKSUM)
        .with("hash", hash.to_owned())
        .with("size", size);
    let fields = call_optional(ctx.pool, req).await?;
    Ok(fields
        .and_then(|f| f.get("fileid").and_then(|v| v.as_u64()))
        .map(RemoteFileId))
}

async fn copy_existing(
    ctx: &UploadContext<'_>,
    parent: RemoteFolderId,
    local: &LocalFile,
    hash: &str,
    source: RemoteFileId,
    size: u64,
) -> Result<UploadOutcome, SyncError> {
    let req = Request::new(verbs::COPYFILE)
        .with("sourcefileid", source.0)
        .with("folderid", parent.0)
        .with("name", local.name.clone());
    let fields = protocol::call_pooled(ctx.pool, &req).await?.into_result()?;
    let id = fields
        .get("fileid")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SyncError::InvariantViolation("copyfile response missing fileid".into()))?;
    metrics::UPLOAD_BYTES_DEDUPLICATED_TOTAL.inc_by(size);
    debug!(local_file = local.id.0, remote_source = source.0, "deduplicated upload via copyfile");
    Ok(UploadOutcome {
        file_id: RemoteFileId(id),
        hash: hash.to_owned(),
    })
}

async fn small_upload(
    ctx: &UploadContext<'_>,
    parent: RemoteFolderId,
    local: &LocalFile,
    disk_path: &Utf8Path,
    size: u64,
    hash: &str,
) -> Result<UploadOutcome, SyncError> {
    let bytes = std::fs::read(disk_path.as_std_path())?;
    let mut name = local.name.clone();
    for attempt in 0..MAX_NAME_CONFLICT_RETRIES {
        let req = Request::new(verbs::UPLOADFILE)
            .with("folderid", parent.0)
            .with("name", name.clone())
            .with("hash", hash.to_owned())
            .with_body(bytes.clone());
        match protocol::call_pooled(ctx.pool, &req).await {
            Ok(resp) => {
                let fields = resp.into_result()?;
                let id = fields
                    .get("fileid")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| SyncError::InvariantViolation("uploadfile response missing fileid".into()))?;

                // §4.6 step 6: verify the server's reported size and SHA-1
                // match what we sent before treating the upload as done, so
                // a corrupted transfer that happens to land is caught and
                // retried rather than bound into the catalog silently.
                let reported_size = fields.get("size").and_then(|v| v.as_u64());
                if let Some(reported_size) = reported_size {
                    if reported_size != size {
                        return Err(SyncError::UploadVerificationFailed(format!(
                            "uploadfile reports {reported_size} bytes written, expected {size}"
                        )));
                    }
                }
                let reported_hash = fields.get("hash").and_then(|v| v.as_str());
                if let Some(reported_hash) = reported_hash {
                    if reported_hash != hash {
                        return Err(SyncError::UploadVerificationFailed(format!(
                            "uploadfile reports hash {reported_hash}, expected {hash}"
                        )));
                    }
                }

                ctx.status.add_bytes_uploaded(size);
                metrics::UPLOAD_BYTES_TRANSFERRED_TOTAL.inc_by(size);
                if name != local.name {
                    let txn = ctx.catalog.begin()?;
                    catalog::rename_local_file(txn.conn(), local.id, &name)?;
                    txn.commit()?;
                }
                return Ok(UploadOutcome {
                    file_id: RemoteFileId(id),
                    hash: hash.to_owned(),
                });
            }
            Err(CloudApiError::Application { code, .. }) if code == NAME_CONFLICT_CODE => {
                name = dedupe_name(&local.name, attempt + 1);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(SyncError::InvariantViolation(format!(
        "exhausted name-conflict retries uploading '{}'",
        local.name
    )))
}

pub(super) fn dedupe_name(name: &str, attempt: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({attempt}).{ext}"),
        _ => format!("{name} ({attempt})"),
    }
}

async fn ensure_upload(
    ctx: &UploadContext<'_>,
    local: &LocalFile,
    parent: RemoteFolderId,
    size: u64,
    hash: &str,
) -> Result<UploadId, SyncError> {
    {
        let conn = ctx.catalog.read_lock()?;
        if let Some(id) = catalog::list_upload_ids(&conn, local.id)?.into_iter().next() {
            return Ok(id);
        }
    }
    let req = Request::new(verbs::UPLOAD_CREATE)
        .with("folderid", parent.0)
        .with("name", local.name.clone())
        .with("size", size)
        .with("hash", hash.to_owned());
    let fields = protocol::call_pooled(ctx.pool, &req).await?.into_result()?;
    let id = fields
        .get("uploadid")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SyncError::InvariantViolation("upload_create response missing uploadid".into()))?;
    let upload_id = UploadId(id);
    let txn = ctx.catalog.begin()?;
    catalog::add_upload_id(txn.conn(), local.id, upload_id)?;
    txn.commit()?;
    Ok(upload_id)
}

async fn fetch_checksums(
    ctx: &UploadContext<'_>,
    req: Request,
) -> Result<Option<(ChecksumTable, u32)>, SyncError> {
    let Some(fields) = call_optional(ctx.pool, req).await? else {
        return Ok(None);
    };
    let Some(hex_str) = fields.get("checksums_hex").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let raw = hex::decode(hex_str)
        .map_err(|_| SyncError::CloudApi(CloudApiError::Protocol("malformed checksum payload".into())))?;
    let header = BlockChecksumHeader::parse(&raw).map_err(SyncError::CloudApi)?;
    let records = raw.get(BLOCK_CHECKSUM_HEADER_LEN..).unwrap_or(&[]);
    let blocks = parse_block_checksums(&header, records).map_err(SyncError::CloudApi)?;
    Ok(Some((ChecksumTable::build(blocks), header.blocksize.max(1))))
}

/// Prefers the last-synced remote revision's checksums (covers the common
/// "small edit to a big file" case) over the in-progress upload's own
/// partial checksums (resuming a previously interrupted transfer).
async fn build_checksum_table(
    ctx: &UploadContext<'_>,
    local: &LocalFile,
    upload_id: UploadId,
) -> Result<Option<(ChecksumTable, u32, CopySource)>, SyncError> {
    if let Some(remote) = local.file_id {
        let req = Request::new(verbs::CHECKSUMFILE).with("fileid", remote.0);
        if let Some((table, block_size)) = fetch_checksums(ctx, req).await? {
            return Ok(Some((table, block_size, CopySource::Existing)));
        }
    }
    let req = Request::new(verbs::UPLOAD_BLOCKCHECKSUMS).with("uploadid", upload_id.0);
    if let Some((table, block_size)) = fetch_checksums(ctx, req).await? {
        return Ok(Some((table, block_size, CopySource::Resume)));
    }
    Ok(None)
}

async fn verify_upload_complete(
    ctx: &UploadContext<'_>,
    upload_id: UploadId,
    expected_size: u64,
    expected_hash: &str,
) -> Result<(), SyncError> {
    let req = Request::new(verbs::UPLOAD_INFO).with("uploadid", upload_id.0);
    let fields = protocol::call_pooled(ctx.pool, &req).await?.into_result()?;
    let size = fields.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
    if size != expected_size {
        return Err(SyncError::UploadVerificationFailed(format!(
            "upload_info reports {size} bytes written, expected {expected_size}"
        )));
    }
    let hash = fields.get("hash").and_then(|v| v.as_str()).unwrap_or("");
    if hash != expected_hash {
        return Err(SyncError::UploadVerificationFailed(format!(
            "upload_info reports hash {hash}, expected {expected_hash}"
        )));
    }
    Ok(())
}

async fn finalize_upload(
    ctx: &UploadContext<'_>,
    upload_id: UploadId,
    parent: RemoteFolderId,
    name: &str,
    prior_hash: &str,
) -> Result<RemoteFileId, SyncError> {
    let req = Request::new(verbs::UPLOAD_SAVE)
        .with("uploadid", upload_id.0)
        .with("folderid", parent.0)
        .with("name", name.to_owned())
        .with("ifhash", prior_hash.to_owned());
    let fields = protocol::call_pooled(ctx.pool, &req).await?.into_result()?;
    let id = fields
        .get("fileid")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| SyncError::InvariantViolation("upload_save response missing fileid".into()))?;
    Ok(RemoteFileId(id))
}

async fn big_upload(
    ctx: &UploadContext<'_>,
    parent: RemoteFolderId,
    local: &LocalFile,
    disk_path: &Utf8Path,
    size: u64,
    hash: &str,
) -> Result<UploadOutcome, SyncError> {
    let upload_id = ensure_upload(ctx, local, parent, size, hash).await?;
    let checksums = build_checksum_table(ctx, local, upload_id).await?;

    let mut plan: Plan<CopySource> = Plan::new(size);
    if let Some((mut table, block_size, source)) = checksums {
        let mut file = std::fs::File::open(disk_path.as_std_path())?;
        plan.refine_with(&mut file, &mut table, block_size.max(1), source)?;
    }
    plan.split_oversized_copies(COPY_REQUEST_MAX_LEN);

    let mut bytes_transferred = 0u64;
    let mut bytes_deduplicated = 0u64;

    for seg in plan.segments() {
        match seg.action {
            Action::Transfer => {
                let mut done = 0u64;
                while done < seg.len {
                    let want = (seg.len - done).min(TRANSFER_CHUNK_LEN);
                    let allowed = speed::throttle(ctx.upload_speed, want).max(1).min(seg.len - done);
                    let offset = seg.offset + done;
                    let chunk = read_range(disk_path, offset, allowed)?;
                    let req = Request::new(verbs::UPLOAD_WRITE)
                        .with("uploadid", upload_id.0)
                        .with("uploadoffset", offset)
                        .with_body(chunk);
                    protocol::call_pooled(ctx.pool, &req).await?.into_result()?;
                    ctx.upload_speed.record_transferred(allowed);
                    ctx.status.add_bytes_uploaded(allowed);
                    bytes_transferred += allowed;
                    done += allowed;
                }
            }
            Action::Copy { source, source_offset } => {
                let verb = match source {
                    CopySource::Existing => verbs::UPLOAD_WRITEFROMFILE,
                    CopySource::Resume => verbs::UPLOAD_WRITEFROMUPLOAD,
                };
                let req = Request::new(verb)
                    .with("uploadid", upload_id.0)
                    .with("uploadoffset", seg.offset)
                    .with("sourceoffset", source_offset)
                    .with("length", seg.len);
                protocol::call_pooled(ctx.pool, &req).await?.into_result()?;
                bytes_deduplicated += seg.len;
            }
        }
    }

    verify_upload_complete(ctx, upload_id, size, hash).await?;
    // §4.6 step 7: the guard names the *previously recorded* server hash
    // (or "new" with none on record), not the freshly computed hash of the
    // content we just wrote — that would compare the destination's current
    // hash against itself and break optimistic concurrency.
    let prior_hash = local.hash.as_deref().unwrap_or("new");
    let file_id = finalize_upload(ctx, upload_id, parent, &local.name, prior_hash).await?;

    if let Ok(txn) = ctx.catalog.begin() {
        let _ = catalog::clear_upload_ids(txn.conn(), local.id);
        let _ = txn.commit();
    }

    metrics::UPLOAD_BYTES_TRANSFERRED_TOTAL.inc_by(bytes_transferred);
    metrics::UPLOAD_BYTES_DEDUPLICATED_TOTAL.inc_by(bytes_deduplicated);
    debug!(
        local_file = local.id.0,
        bytes_transferred, bytes_deduplicated, "big-file upload complete"
    );
    Ok(UploadOutcome {
        file_id,
        hash: hash.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_name_keeps_the_extension() {
        assert_eq!(dedupe_name("report.pdf", 1), "report (1).pdf");
        assert_eq!(dedupe_name("README", 2), "README (2)");
    }

    #[test]
    fn dedupe_name_handles_a_dotfile_as_extensionless() {
        // `.gitignore`.rsplit_once('.') finds the leading dot, making the
        // "stem" empty; treat that as no extension rather than producing
        // "( 1).gitignore".
        assert_eq!(dedupe_name(".gitignore", 1), ".gitignore (1)");
    }
}
