use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use uuid::Uuid;

use crate::directory;
use crate::engine::Engine;
use crate::error::{LfssError, LfssResult};
use crate::metadata::{files, users};
use crate::path::{first_segment, validate_dir_url, validate_file_url};
use crate::permission::{check_file_read_permission, check_path_permission};
use crate::pool::{NoHook, TransactionHook};
use crate::types::{AccessLevel, ByteRange, FileReadPermission, FileRecord, UserRecord};

/// Accumulates external-blob file-ids to unlink, applying them only
/// after the surrounding transaction commits — the deferred-cleanup
/// hook of §4.1, implemented as fire-and-forget background tasks so
/// the transaction's critical section stays short.
pub struct DeferredCleanupHook {
    engine: Arc<Engine>,
    pending: Vec<String>,
}

impl DeferredCleanupHook {
    pub fn new(engine: Arc<Engine>) -> Self {
        DeferredCleanupHook { engine, pending: Vec::new() }
    }

    pub fn schedule_unlink(&mut self, file_id: impl Into<String>) {
        self.pending.push(file_id.into());
    }
}

impl TransactionHook for DeferredCleanupHook {
    fn on_commit(self) {
        if self.pending.is_empty() {
            return;
        }
        let engine = self.engine;
        let ids = self.pending;
        tokio::spawn(async move {
            for id in ids {
                if let Err(e) = engine.blobs.unlink_external(&id).await {
                    tracing::warn!(file_id = %id, error = %e, "deferred external blob unlink failed");
                }
            }
        });
    }
}

/// The sentinel id-0 user representing unauthenticated access.
pub fn guest() -> UserRecord {
    UserRecord {
        id: UserRecord::GUEST_ID,
        username: String::new(),
        credential: String::new(),
        is_admin: false,
        create_time: Utc::now(),
        last_active: Utc::now(),
        max_storage: 0,
        permission: FileReadPermission::Unset,
    }
}

/// Resolves the effective access level for `user` at `path`, folding
/// in directory-config overrides along the ancestor chain.
pub async fn effective_access(
    engine: &Engine,
    path: &str,
    user: &UserRecord,
    file_at_path: Option<&FileRecord>,
) -> LfssResult<AccessLevel> {
    let dir_configs = directory::resolve_dir_configs(engine, path).await?;
    let mut cursor = engine.pool.read_cursor().await;
    let path_owned = path.to_string();
    let user_owned = user.clone();
    let file_owned = file_at_path.cloned();
    cursor
        .with(move |conn| {
            check_path_permission(conn, &path_owned, &user_owned, file_owned.as_ref(), &dir_configs)
                .map_err(|e| to_sqlite_err(e))
        })
        .await
}

fn to_sqlite_err(e: LfssError) -> rusqlite::Error {
    rusqlite::Error::InvalidParameterName(e.to_string())
}

async fn get_record(engine: &Engine, url: &str) -> LfssResult<Option<FileRecord>> {
    let url = url.to_string();
    let mut cursor = engine.pool.read_cursor().await;
    cursor.with(move |conn| files::get_file_record(conn, &url)).await
}

async fn get_user(engine: &Engine, username: &str) -> LfssResult<Option<UserRecord>> {
    let username = username.to_string();
    let mut cursor = engine.pool.read_cursor().await;
    cursor.with(move |conn| users::get_user_by_username(conn, &username)).await
}

/// Read the full byte payload of a file record, inline or external.
pub async fn read_record_bytes(engine: &Engine, rec: &FileRecord) -> LfssResult<Bytes> {
    if rec.external {
        engine.blobs.read_external_range(&rec.file_id, 0, rec.file_size).await
    } else {
        let file_id = rec.file_id.clone();
        let mut cursor = engine.pool.read_cursor().await;
        let data = cursor
            .with(move |conn| crate::blob::read_inline_blob(conn, &file_id))
            .await?;
        Ok(Bytes::from(data.unwrap_or_default()))
    }
}

type BoxedByteStream = std::pin::Pin<Box<dyn Stream<Item = LfssResult<Bytes>> + Send>>;

/// Stream a file's bytes within `[start, end)`.
pub async fn stream_record_range(
    engine: Arc<Engine>,
    rec: FileRecord,
    range: ByteRange,
) -> LfssResult<(u64, u64, BoxedByteStream)> {
    let (start, end) = range.resolve(rec.file_size);
    if start > end || (start > 0 && start >= rec.file_size) {
        return Err(LfssError::InvalidRange);
    }
    if rec.external {
        let stream = engine.blobs.stream_external_range(&rec.file_id, start, end);
        Ok((start, end, Box::pin(stream)))
    } else {
        let bytes = read_record_bytes(&engine, &rec).await?;
        let slice = bytes.slice(start as usize..end as usize);
        Ok((start, end, Box::pin(futures::stream::once(async move { Ok(slice) }))))
    }
}

/// `save_file` per §4.5: validates, checks quota, resolves MIME,
/// writes the blob (inline or external depending on size), then
/// inserts the metadata row — all within one transaction for inline
/// blobs, or a short transaction after an out-of-band external write
/// for large ones.
pub async fn save_file(
    engine: &Arc<Engine>,
    caller: &UserRecord,
    url: &str,
    data: Bytes,
    permission: FileReadPermission,
    mime_override: Option<&str>,
    overwrite: bool,
) -> LfssResult<FileRecord> {
    validate_file_url(url)?;
    let owner_username = first_segment(url);
    let owner = get_user(engine, owner_username)
        .await?
        .ok_or_else(|| LfssError::PathNotFound(url.to_string()))?;

    let existing = get_record(engine, url).await?;
    let access = effective_access(engine, url, caller, existing.as_ref()).await?;
    if access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }
    if existing.is_some() && !overwrite {
        return Err(LfssError::FileExists(url.to_string()));
    }

    let target_owner_id = if caller.is_admin || caller.id != owner.id {
        // admin-PUT-ownership policy (DESIGN.md Open Questions #1):
        // the writer becomes the owner of record.
        caller.id
    } else {
        owner.id
    };

    let used = {
        let id = target_owner_id;
        let mut cursor = engine.pool.read_cursor().await;
        cursor.with(move |conn| users::get_user_size(conn, id)).await?
    };
    let existing_size = existing
        .as_ref()
        .filter(|r| r.owner_id == target_owner_id)
        .map(|r| r.file_size)
        .unwrap_or(0);
    let new_total = used.saturating_sub(existing_size) + data.len() as u64;
    if new_total > owner.max_storage {
        return Err(LfssError::StorageExceeded);
    }

    let mime = crate::blob::resolve_mime(url, mime_override, &data[..data.len().min(1024)]);
    let file_id = Uuid::new_v4().to_string();
    let external = engine.blobs.is_large(data.len() as u64);
    let now = Utc::now();

    let new_record = FileRecord {
        url: url.to_string(),
        owner_id: target_owner_id,
        file_id: file_id.clone(),
        file_size: data.len() as u64,
        create_time: now,
        access_time: now,
        permission,
        external,
        mime_type: mime,
    };

    if external {
        engine.blobs.write_external(&file_id, &data).await?;
    }

    let url_owned = url.to_string();
    let rec_for_tx = new_record.clone();
    let result = engine
        .pool
        .transaction(DeferredCleanupHook::new(engine.clone()), move |conn, hook| {
            if let Some(old) = files::get_file_record(conn, &url_owned)? {
                delete_old_blob(conn, &old, hook)?;
                files::delete_file_record(conn, &url_owned)?;
                users::adjust_user_size(conn, old.owner_id, -(old.file_size as i64))?;
            }
            if !external {
                crate::blob::insert_inline_blob(conn, &rec_for_tx.file_id, &data)?;
            }
            files::insert_file_record(conn, &rec_for_tx)?;
            users::adjust_user_size(conn, rec_for_tx.owner_id, rec_for_tx.file_size as i64)?;
            Ok(())
        })
        .await;

    match result {
        Ok(()) => Ok(new_record),
        Err(e) => {
            if external {
                let _ = engine.blobs.unlink_external(&file_id).await;
            }
            Err(e)
        }
    }
}

fn delete_old_blob(
    conn: &rusqlite::Connection,
    old: &FileRecord,
    hook: &mut DeferredCleanupHook,
) -> rusqlite::Result<()> {
    let freed = files::decr_dupcount_or_free(conn, &old.file_id)?;
    if freed && files::count_rows_for_file_id(conn, &old.file_id)? <= 1 {
        if old.external {
            hook.schedule_unlink(old.file_id.clone());
        } else {
            crate::blob::delete_inline_blob(conn, &old.file_id)?;
        }
    }
    Ok(())
}

/// `read_file(url, start?, end?)` per §4.5: 404s if missing,
/// permission-checks (path level, falling back to file-level read
/// permission), then returns the record plus a resolved range.
pub async fn read_file(
    engine: &Arc<Engine>,
    caller: &UserRecord,
    url: &str,
    range: ByteRange,
) -> LfssResult<(FileRecord, u64, u64)> {
    validate_file_url(url)?;
    let rec = get_record(engine, url).await?.ok_or_else(|| LfssError::FileNotFound(url.to_string()))?;

    let access = effective_access(engine, url, caller, Some(&rec)).await?;
    if access < AccessLevel::Read {
        let owner_username = first_segment(url);
        let owner = get_user(engine, owner_username).await?.ok_or_else(|| LfssError::PathNotFound(url.to_string()))?;
        if !check_file_read_permission(caller, &rec, owner.permission) {
            return Err(LfssError::PermissionDenied);
        }
    }

    let (start, end) = range.resolve(rec.file_size);
    if start > end || (start > 0 && start >= rec.file_size) {
        return Err(LfssError::InvalidRange);
    }

    engine.debounce.touch_access_time(url.to_string());
    Ok((rec, start, end))
}

/// `read_files_bulk`: all-or-nothing permission semantics — if any
/// requested url is denied, nothing is returned.
pub async fn read_files_bulk(
    engine: &Arc<Engine>,
    caller: &UserRecord,
    urls: &[String],
    skip_content: bool,
) -> LfssResult<Vec<Option<FileRecord>>> {
    let mut out = Vec::with_capacity(urls.len());
    let mut total = 0u64;
    for url in urls {
        if validate_file_url(url).is_err() {
            out.push(None);
            continue;
        }
        let rec = get_record(engine, url).await?;
        if let Some(rec) = &rec {
            let access = effective_access(engine, url, caller, Some(rec)).await?;
            if access < AccessLevel::Read {
                let owner_username = first_segment(url);
                let owner = get_user(engine, owner_username).await?;
                let allowed = owner
                    .map(|o| check_file_read_permission(caller, rec, o.permission))
                    .unwrap_or(false);
                if !allowed {
                    return Err(LfssError::PermissionDenied);
                }
            }
            total += rec.file_size;
        }
        out.push(rec);
    }
    if !skip_content && total > engine.blobs.memory_cap() {
        return Err(LfssError::TooManyItems);
    }
    Ok(out)
}

/// Transactional delete with dedup-aware blob cleanup.
pub async fn delete_file(engine: &Arc<Engine>, caller: &UserRecord, url: &str) -> LfssResult<Option<FileRecord>> {
    validate_file_url(url)?;
    let rec = match get_record(engine, url).await? {
        Some(r) => r,
        None => return Ok(None),
    };
    let access = effective_access(engine, url, caller, Some(&rec)).await?;
    if access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }

    let url_owned = url.to_string();
    let rec_clone = rec.clone();
    engine
        .pool
        .transaction(DeferredCleanupHook::new(engine.clone()), move |conn, hook| {
            files::delete_file_record(conn, &url_owned)?;
            users::adjust_user_size(conn, rec_clone.owner_id, -(rec_clone.file_size as i64))?;
            delete_old_blob(conn, &rec_clone, hook)?;
            Ok(())
        })
        .await?;
    Ok(Some(rec))
}

/// `move_file`: rejects if destination exists; transfers ownership to
/// the caller whenever the caller isn't already the file's owner (an
/// admin moving someone else's file always becomes the new owner).
pub async fn move_file(
    engine: &Arc<Engine>,
    caller: &UserRecord,
    src: &str,
    dst: &str,
) -> LfssResult<FileRecord> {
    validate_file_url(src)?;
    validate_file_url(dst)?;
    let rec = get_record(engine, src).await?.ok_or_else(|| LfssError::FileNotFound(src.to_string()))?;
    let src_access = effective_access(engine, src, caller, Some(&rec)).await?;
    if src_access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }
    if get_record(engine, dst).await?.is_some() {
        return Err(LfssError::FileExists(dst.to_string()));
    }
    let dst_owner_username = first_segment(dst);
    get_user(engine, dst_owner_username).await?.ok_or_else(|| LfssError::PathNotFound(dst.to_string()))?;
    let dst_access = effective_access(engine, dst, caller, None).await?;
    if dst_access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }

    // ownership transfer is keyed on the caller, not the destination
    // subtree's owner (mirrors save_file's target_owner_id above).
    let new_owner_id = if caller.is_admin || caller.id != rec.owner_id { Some(caller.id) } else { None };
    let src_owned = src.to_string();
    let dst_owned = dst.to_string();
    let rec_clone = rec.clone();
    let new_owner_check = caller.clone();

    engine
        .pool
        .transaction(NoHook, move |conn, _hook| {
            files::rename_file_record(conn, &src_owned, &dst_owned, new_owner_id)?;
            if let Some(new_owner) = new_owner_id {
                users::adjust_user_size(conn, rec_clone.owner_id, -(rec_clone.file_size as i64))?;
                users::adjust_user_size(conn, new_owner, rec_clone.file_size as i64)?;
                let total = users::get_user_size(conn, new_owner)?;
                if total > new_owner_check.max_storage {
                    return Err(to_sqlite_err(LfssError::StorageExceeded));
                }
            }
            Ok(())
        })
        .await?;

    Ok(FileRecord { url: dst.to_string(), owner_id: new_owner_id.unwrap_or(rec.owner_id), ..rec })
}

/// `copy_file`: new row pointing at the same file-id, dupcount + 1.
pub async fn copy_file(
    engine: &Arc<Engine>,
    caller: &UserRecord,
    src: &str,
    dst: &str,
) -> LfssResult<FileRecord> {
    validate_file_url(src)?;
    validate_file_url(dst)?;
    let rec = get_record(engine, src).await?.ok_or_else(|| LfssError::FileNotFound(src.to_string()))?;
    let src_access = effective_access(engine, src, caller, Some(&rec)).await?;
    if src_access < AccessLevel::Read {
        return Err(LfssError::PermissionDenied);
    }
    if get_record(engine, dst).await?.is_some() {
        return Err(LfssError::FileExists(dst.to_string()));
    }
    let dst_owner_username = first_segment(dst);
    get_user(engine, dst_owner_username).await?.ok_or_else(|| LfssError::PathNotFound(dst.to_string()))?;
    let dst_access = effective_access(engine, dst, caller, None).await?;
    if dst_access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }

    // ownership transfer is keyed on the caller, not the destination
    // subtree's owner (mirrors save_file's target_owner_id above).
    let owner_id = if caller.is_admin || caller.id != rec.owner_id { caller.id } else { rec.owner_id };
    let new_record = FileRecord {
        url: dst.to_string(),
        owner_id,
        create_time: Utc::now(),
        access_time: Utc::now(),
        ..rec.clone()
    };
    let new_record_tx = new_record.clone();
    let max_storage = caller.max_storage;

    engine
        .pool
        .transaction(NoHook, move |conn, _hook| {
            files::insert_file_record(conn, &new_record_tx)?;
            files::incr_dupcount(conn, &new_record_tx.file_id)?;
            users::adjust_user_size(conn, new_record_tx.owner_id, new_record_tx.file_size as i64)?;
            let total = users::get_user_size(conn, new_record_tx.owner_id)?;
            if total > max_storage {
                return Err(to_sqlite_err(LfssError::StorageExceeded));
            }
            Ok(())
        })
        .await?;

    Ok(new_record)
}

/// `move_dir`: WRITE on both prefixes; moves every descendant file
/// except directory-config files; fails if any target already exists.
pub async fn move_dir(engine: &Arc<Engine>, caller: &UserRecord, src: &str, dst: &str) -> LfssResult<Vec<FileRecord>> {
    validate_dir_url(src)?;
    validate_dir_url(dst)?;
    let src_access = effective_access(engine, src, caller, None).await?;
    if src_access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }
    let dst_access = effective_access(engine, dst, caller, None).await?;
    if dst_access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }

    let src_owned = src.to_string();
    let descendants = {
        let mut cursor = engine.pool.read_cursor().await;
        cursor.with(move |conn| files::list_descendants(conn, &src_owned)).await?
    };

    let mut moved = Vec::new();
    for rec in descendants {
        if rec.url.ends_with(crate::types::DirConfig::FILE_NAME) {
            continue;
        }
        let suffix = rec.url.strip_prefix(src).unwrap_or(&rec.url);
        let new_url = format!("{dst}{suffix}");
        moved.push(move_file(engine, caller, &rec.url, &new_url).await?);
    }
    Ok(moved)
}

/// `copy_dir`: as move but inserts new rows with incremented
/// dupcount, skipping directory-config files.
pub async fn copy_dir(engine: &Arc<Engine>, caller: &UserRecord, src: &str, dst: &str) -> LfssResult<Vec<FileRecord>> {
    validate_dir_url(src)?;
    validate_dir_url(dst)?;
    let src_access = effective_access(engine, src, caller, None).await?;
    if src_access < AccessLevel::Read {
        return Err(LfssError::PermissionDenied);
    }
    let src_owned = src.to_string();
    let descendants = {
        let mut cursor = engine.pool.read_cursor().await;
        cursor.with(move |conn| files::list_descendants(conn, &src_owned)).await?
    };

    let mut copied = Vec::new();
    for rec in descendants {
        if rec.url.ends_with(crate::types::DirConfig::FILE_NAME) {
            continue;
        }
        let suffix = rec.url.strip_prefix(src).unwrap_or(&rec.url);
        let new_url = format!("{dst}{suffix}");
        copied.push(copy_file(engine, caller, &rec.url, &new_url).await?);
    }
    Ok(copied)
}

/// `delete_dir`: collects descendants, batches blob unlinks, deletes
/// rows, returns what was removed.
pub async fn delete_dir(engine: &Arc<Engine>, caller: &UserRecord, dir: &str) -> LfssResult<Vec<FileRecord>> {
    validate_dir_url(dir)?;
    let access = effective_access(engine, dir, caller, None).await?;
    if access < AccessLevel::Write {
        return Err(LfssError::PermissionDenied);
    }

    let dir_owned = dir.to_string();
    let descendants = {
        let mut cursor = engine.pool.read_cursor().await;
        cursor.with(move |conn| files::list_descendants(conn, &dir_owned)).await?
    };

    let records_for_tx = descendants.clone();
    engine
        .pool
        .transaction(DeferredCleanupHook::new(engine.clone()), move |conn, hook| {
            for rec in &records_for_tx {
                files::delete_file_record(conn, &rec.url)?;
                users::adjust_user_size(conn, rec.owner_id, -(rec.file_size as i64))?;
                delete_old_blob(conn, rec, hook)?;
            }
            Ok(())
        })
        .await?;

    Ok(descendants)
}

/// `delete_user`: deletes the user row, re-homes cross-subtree files
/// to the subtree owner, re-verifies quota, batch-unlinks the rest.
pub async fn delete_user(engine: &Arc<Engine>, username: &str) -> LfssResult<()> {
    let user = get_user(engine, username).await?.ok_or_else(|| LfssError::UserNotFound(username.to_string()))?;

    let username_owned = username.to_string();
    let prefix_for_tx = format!("{username}/");
    let user_id = user.id;

    engine
        .pool
        .transaction(DeferredCleanupHook::new(engine.clone()), move |conn, hook| {
            users::delete_user(conn, &username_owned)?;

            let own_subtree = files::list_descendants(conn, &prefix_for_tx)?;

            let mut stmt = conn.prepare("SELECT url FROM file WHERE owner_id = ?1")?;
            let foreign_urls: Vec<String> = stmt
                .query_map(rusqlite::params![user_id as i64], |r| r.get(0))?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            for url in foreign_urls {
                if url.starts_with(&prefix_for_tx) {
                    continue;
                }
                let subtree_owner_username = first_segment(&url).to_string();
                if let Some(subtree_owner) = users::get_user_by_username(conn, &subtree_owner_username)? {
                    if let Some(rec) = files::get_file_record(conn, &url)? {
                        files::reassign_owner(conn, &url, subtree_owner.id)?;
                        users::adjust_user_size(conn, user_id, -(rec.file_size as i64))?;
                        users::adjust_user_size(conn, subtree_owner.id, rec.file_size as i64)?;
                        let total = users::get_user_size(conn, subtree_owner.id)?;
                        if total > subtree_owner.max_storage {
                            return Err(to_sqlite_err(LfssError::StorageExceeded));
                        }
                    }
                }
            }

            for rec in &own_subtree {
                files::delete_file_record(conn, &rec.url)?;
                delete_old_blob(conn, rec, hook)?;
            }
            Ok(())
        })
        .await
}

/// Zip an entire subtree, either in memory (small) or via a streaming
/// writer (`zip_dir`/`zip_dir_stream`). Entries are the URL-decoded
/// relative path under `dir`.
pub async fn zip_dir_in_memory(engine: &Arc<Engine>, caller: &UserRecord, dir: &str) -> LfssResult<Vec<u8>> {
    validate_dir_url(dir)?;
    let access = effective_access(engine, dir, caller, None).await?;
    if access < AccessLevel::Read {
        return Err(LfssError::PermissionDenied);
    }
    let dir_owned = dir.to_string();
    let descendants = {
        let mut cursor = engine.pool.read_cursor().await;
        cursor.with(move |conn| files::list_descendants(conn, &dir_owned)).await?
    };

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();
        for rec in &descendants {
            if rec.url.ends_with(crate::types::DirConfig::FILE_NAME) {
                continue;
            }
            let relative = rec.url.strip_prefix(dir).unwrap_or(&rec.url);
            let data = read_record_bytes(engine, rec).await?;
            zip.start_file(relative, options).map_err(|e| LfssError::InvalidData(e.to_string()))?;
            use std::io::Write;
            zip.write_all(&data).map_err(|e| LfssError::Io(e))?;
        }
        zip.finish().map_err(|e| LfssError::InvalidData(e.to_string()))?;
    }
    Ok(buf.into_inner())
}
