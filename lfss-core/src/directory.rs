use std::sync::Arc;

use bytes::Bytes;

use crate::engine::Engine;
use crate::error::{LfssError, LfssResult};
use crate::metadata::files::{self, ListFilesParams};
use crate::path::validate_dir_url;
use crate::types::{
    AccessLevel, DirConfig, DirectoryRecord, FileRecord, FileSortKey, UserRecord,
};
use crate::{lifecycle, types::FileReadPermission};

/// Loads and parses every `.lfssdir.json` along the ancestor chain of
/// `path`, deepest ancestor first — the order `permission::check_path_permission`
/// expects so the first entry matching the caller's username wins.
pub async fn resolve_dir_configs(engine: &Engine, path: &str) -> LfssResult<Vec<(String, DirConfig)>> {
    let mut ancestors = Vec::new();
    let mut rest = path.trim_end_matches('/');
    while let Some(idx) = rest.rfind('/') {
        rest = &rest[..idx];
        ancestors.push(format!("{rest}/"));
    }
    // root namespace (owner's own top level) also carries a config.
    if let Some(owner_end) = path.find('/') {
        ancestors.push(path[..=owner_end].to_string());
    }
    ancestors.sort_by_key(|a| std::cmp::Reverse(a.len()));
    ancestors.dedup();

    let mut out = Vec::new();
    for dir in ancestors {
        let config_url = format!("{dir}{}", DirConfig::FILE_NAME);
        let mut cursor = engine.pool.read_cursor().await;
        let url = config_url.clone();
        let rec = cursor.with(move |conn| files::get_file_record(conn, &url)).await?;
        if let Some(rec) = rec {
            let bytes = lifecycle::read_record_bytes(engine, &rec).await?;
            match serde_json::from_slice::<DirConfig>(&bytes) {
                Ok(config) => out.push((dir, config)),
                Err(e) => tracing::warn!(url = %config_url, error = %e, "malformed directory config, ignoring"),
            }
        }
    }
    Ok(out)
}

/// Load the parsed config at exactly `dir` (no ancestor walk), for
/// the admin config-editing endpoints.
pub async fn get_dir_config(engine: &Engine, dir: &str) -> LfssResult<DirConfig> {
    let config_url = format!("{dir}{}", DirConfig::FILE_NAME);
    let rec = {
        let mut cursor = engine.pool.read_cursor().await;
        let url = config_url.clone();
        cursor.with(move |conn| files::get_file_record(conn, &url)).await?
    };
    match rec {
        Some(rec) => {
            let bytes = lifecycle::read_record_bytes(engine, &rec).await?;
            serde_json::from_slice(&bytes).map_err(|e| LfssError::InvalidData(e.to_string()))
        }
        None => Ok(DirConfig::default()),
    }
}

/// Replace the directory config at `dir`, writing it like any other
/// file (so save-file's permission and quota checks apply), except
/// that directory-config urls are exempt from the dotfile-segment
/// rule enforced on ordinary paths.
pub async fn set_dir_config(
    engine: &Arc<Engine>,
    caller: &UserRecord,
    dir: &str,
    config: &DirConfig,
) -> LfssResult<FileRecord> {
    validate_dir_url(dir)?;
    let config_url = format!("{dir}{}", DirConfig::FILE_NAME);
    let body = serde_json::to_vec(config).map_err(|e| LfssError::InvalidData(e.to_string()))?;
    lifecycle::save_file(
        engine,
        caller,
        &config_url,
        Bytes::from(body),
        FileReadPermission::Unset,
        Some("application/json"),
        true,
    )
    .await
}

async fn require_access(engine: &Engine, caller: &UserRecord, dir: &str, need: AccessLevel) -> LfssResult<()> {
    let access = lifecycle::effective_access(engine, dir, caller, None).await?;
    if access < need {
        return Err(LfssError::PermissionDenied);
    }
    Ok(())
}

/// `count-files`: recursive (`flat`) or direct-children count under `dir`.
pub async fn count_files(engine: &Engine, caller: &UserRecord, dir: &str, flat: bool) -> LfssResult<u64> {
    validate_dir_url(dir)?;
    require_access(engine, caller, dir, AccessLevel::Read).await?;
    let dir = dir.to_string();
    let mut cursor = engine.pool.read_cursor().await;
    cursor.with(move |conn| files::count_files(conn, &dir, flat)).await
}

pub struct ListFilesQuery<'a> {
    pub dir: &'a str,
    pub offset: u64,
    pub limit: u64,
    pub order_by: FileSortKey,
    pub desc: bool,
    pub flat: bool,
}

/// `list-files`: paginated, sorted listing, path-level READ required.
pub async fn list_files(engine: &Engine, caller: &UserRecord, q: ListFilesQuery<'_>) -> LfssResult<Vec<FileRecord>> {
    validate_dir_url(q.dir)?;
    require_access(engine, caller, q.dir, AccessLevel::Read).await?;
    let dir = q.dir.to_string();
    let (offset, limit, order_by, desc, flat) = (q.offset, q.limit, q.order_by, q.desc, q.flat);
    let mut cursor = engine.pool.read_cursor().await;
    cursor
        .with(move |conn| {
            files::list_files(
                conn,
                ListFilesParams { dir: &dir, offset, limit, order_by, desc, flat },
            )
        })
        .await
}

/// `count-dirs`: number of distinct direct subdirectories under `dir`.
pub async fn count_dirs(engine: &Engine, caller: &UserRecord, dir: &str) -> LfssResult<u64> {
    validate_dir_url(dir)?;
    require_access(engine, caller, dir, AccessLevel::Read).await?;
    let dir = dir.to_string();
    let mut cursor = engine.pool.read_cursor().await;
    cursor.with(move |conn| files::count_dirs(conn, &dir)).await
}

/// `list-dirs`: paginated, sorted listing of direct subdirectory names.
pub async fn list_dirs(
    engine: &Engine,
    caller: &UserRecord,
    dir: &str,
    offset: u64,
    limit: u64,
    desc: bool,
) -> LfssResult<Vec<String>> {
    validate_dir_url(dir)?;
    require_access(engine, caller, dir, AccessLevel::Read).await?;
    let dir = dir.to_string();
    let mut cursor = engine.pool.read_cursor().await;
    cursor.with(move |conn| files::list_dirs(conn, &dir, offset, limit, desc)).await
}

/// Aggregate record (file count, total size, time bounds) for `dir`.
pub async fn get_dir_record(engine: &Engine, caller: &UserRecord, dir: &str) -> LfssResult<DirectoryRecord> {
    validate_dir_url(dir)?;
    require_access(engine, caller, dir, AccessLevel::Read).await?;
    let dir_owned = dir.to_string();
    let mut cursor = engine.pool.read_cursor().await;
    let rec = cursor.with(move |conn| files::get_dir_record(conn, &dir_owned)).await?;
    rec.ok_or_else(|| LfssError::PathNotFound(dir.to_string()))
}

/// The combined listing used to serve a directory GET: subdirectories
/// plus direct-child files, both one page deep.
pub async fn list_path_contents(
    engine: &Engine,
    caller: &UserRecord,
    dir: &str,
) -> LfssResult<crate::types::PathContents> {
    validate_dir_url(dir)?;
    require_access(engine, caller, dir, AccessLevel::Read).await?;
    let files = list_files(
        engine,
        caller,
        ListFilesQuery { dir, offset: 0, limit: u64::MAX, order_by: FileSortKey::Url, desc: false, flat: false },
    )
    .await?
    .into_iter()
    .filter(|r| !r.url.ends_with(DirConfig::FILE_NAME))
    .collect();
    let names = list_dirs(engine, caller, dir, 0, u64::MAX, false).await?;
    let mut dirs = Vec::with_capacity(names.len());
    for name in names {
        let sub = format!("{dir}{name}");
        if let Ok(rec) = get_dir_record(engine, caller, &sub).await {
            dirs.push(rec);
        }
    }
    Ok(crate::types::PathContents { dirs, files })
}

/// Stream a ZIP archive of `dir` entry-by-entry, for the aggregate-size-over-cap
/// path that `zip_dir_in_memory` can't take. The `zip` crate's writer is
/// synchronous, so it runs on a blocking thread and forwards finished chunks
/// to the async caller over a bounded channel — mirroring how the large-blob
/// write path offloads compression work off the event loop.
pub fn zip_dir_stream(
    engine: Arc<Engine>,
    caller: UserRecord,
    dir: String,
) -> impl futures::Stream<Item = LfssResult<Bytes>> {
    async_stream::try_stream! {
        validate_dir_url(&dir)?;
        require_access(&engine, &caller, &dir, AccessLevel::Read).await?;
        let dir_owned = dir.clone();
        let descendants = {
            let mut cursor = engine.pool.read_cursor().await;
            cursor.with(move |conn| files::list_descendants(conn, &dir_owned)).await?
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);
        let writer = ChannelWriter { tx };
        let worker_descendants = descendants.clone();
        let worker_dir = dir.clone();
        let engine_for_reads = engine.clone();

        let handle = tokio::task::spawn_blocking(move || -> LfssResult<()> {
            let mut zip = zip::ZipWriter::new(writer);
            let options: zip::write::FileOptions<()> = zip::write::FileOptions::default().large_file(true);
            let rt = tokio::runtime::Handle::current();
            for rec in &worker_descendants {
                if rec.url.ends_with(DirConfig::FILE_NAME) {
                    continue;
                }
                let relative = rec.url.strip_prefix(worker_dir.as_str()).unwrap_or(&rec.url);
                let data = rt.block_on(lifecycle::read_record_bytes(&engine_for_reads, rec))
                    .map_err(|e| LfssError::InvalidData(e.to_string()))?;
                zip.start_file(relative, options).map_err(|e| LfssError::InvalidData(e.to_string()))?;
                use std::io::Write;
                zip.write_all(&data).map_err(LfssError::Io)?;
            }
            zip.finish().map_err(|e| LfssError::InvalidData(e.to_string()))?;
            Ok(())
        });

        while let Some(chunk) = rx.recv().await {
            yield Bytes::from(chunk);
        }
        handle.await.expect("zip worker panicked")?;
    }
}

/// Forwards every `write_all` call to a bounded async channel so the
/// synchronous `zip::ZipWriter` can run on a blocking thread while its
/// output is consumed as an async byte stream.
struct ChannelWriter {
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "zip stream receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_config_roundtrips_through_json() {
        let mut config = DirConfig::default();
        config.index = Some("index.html".to_string());
        config.access_control.insert("bob".to_string(), AccessLevel::Read);
        let body = serde_json::to_vec(&config).unwrap();
        let parsed: DirConfig = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.index.as_deref(), Some("index.html"));
        assert_eq!(parsed.access_control.get("bob"), Some(&AccessLevel::Read));
    }
}
