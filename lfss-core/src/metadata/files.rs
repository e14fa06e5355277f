use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::path::escape_like_prefix;
use crate::types::{DirectoryRecord, FileReadPermission, FileRecord, FileSortKey};

fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    let owner_id: i64 = row.get("owner_id")?;
    let file_size: i64 = row.get("file_size")?;
    let permission: i64 = row.get("permission")?;
    let external: i64 = row.get("external")?;
    Ok(FileRecord {
        url: row.get("url")?,
        owner_id: owner_id as u64,
        file_id: row.get("file_id")?,
        file_size: file_size as u64,
        create_time: row.get("create_time")?,
        access_time: row.get("access_time")?,
        permission: FileReadPermission::from_i64(permission).unwrap_or(FileReadPermission::Unset),
        external: external != 0,
        mime_type: row.get("mime_type")?,
    })
}

pub fn insert_file_record(conn: &Connection, rec: &FileRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO file (url, owner_id, file_id, file_size, create_time, access_time, permission, external, mime_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            rec.url,
            rec.owner_id as i64,
            rec.file_id,
            rec.file_size as i64,
            rec.create_time,
            rec.access_time,
            rec.permission.as_i64(),
            rec.external as i64,
            rec.mime_type,
        ],
    )?;
    Ok(())
}

pub fn get_file_record(conn: &Connection, url: &str) -> rusqlite::Result<Option<FileRecord>> {
    conn.query_row("SELECT * FROM file WHERE url = ?1", params![url], row_to_file).optional()
}

pub fn delete_file_record(conn: &Connection, url: &str) -> rusqlite::Result<Option<FileRecord>> {
    let rec = get_file_record(conn, url)?;
    if rec.is_some() {
        conn.execute("DELETE FROM file WHERE url = ?1", params![url])?;
    }
    Ok(rec)
}

pub fn rename_file_record(conn: &Connection, old_url: &str, new_url: &str, new_owner_id: Option<u64>) -> rusqlite::Result<()> {
    match new_owner_id {
        Some(owner) => conn.execute(
            "UPDATE file SET url = ?1, owner_id = ?2 WHERE url = ?3",
            params![new_url, owner as i64, old_url],
        )?,
        None => conn.execute("UPDATE file SET url = ?1 WHERE url = ?2", params![new_url, old_url])?,
    };
    Ok(())
}

pub fn set_file_permission(conn: &Connection, url: &str, permission: FileReadPermission) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE file SET permission = ?1 WHERE url = ?2",
        params![permission.as_i64(), url],
    )?;
    Ok(())
}

pub fn touch_access_time(conn: &Connection, url: &str) -> rusqlite::Result<()> {
    conn.execute("UPDATE file SET access_time = ?1 WHERE url = ?2", params![Utc::now(), url])?;
    Ok(())
}

pub fn reassign_owner(conn: &Connection, url: &str, new_owner: u64) -> rusqlite::Result<()> {
    conn.execute("UPDATE file SET owner_id = ?1 WHERE url = ?2", params![new_owner as i64, url])?;
    Ok(())
}

/// All file rows whose url starts with `prefix` (a directory path
/// ending in `/`). Used by move/copy/delete-dir and user deletion.
pub fn list_descendants(conn: &Connection, prefix: &str) -> rusqlite::Result<Vec<FileRecord>> {
    let like = format!("{}%", escape_like_prefix(prefix));
    let mut stmt = conn.prepare("SELECT * FROM file WHERE url LIKE ?1 ESCAPE '\\' ORDER BY url")?;
    let rows = stmt.query_map(params![like], row_to_file)?;
    rows.collect()
}

pub fn count_files(conn: &Connection, dir: &str, flat: bool) -> rusqlite::Result<u64> {
    let like = format!("{}%", escape_like_prefix(dir));
    let n: i64 = if flat {
        conn.query_row(
            "SELECT COUNT(*) FROM file WHERE url LIKE ?1 ESCAPE '\\'",
            params![like],
            |r| r.get(0),
        )?
    } else {
        let mut stmt = conn.prepare("SELECT url FROM file WHERE url LIKE ?1 ESCAPE '\\'")?;
        let rest: Vec<String> = stmt
            .query_map(params![like], |r| r.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        rest.iter().filter(|u| direct_child(dir, u)).count() as i64
    };
    Ok(n as u64)
}

fn direct_child(dir: &str, url: &str) -> bool {
    url.strip_prefix(dir).map(|rest| !rest.contains('/')).unwrap_or(false)
}

pub struct ListFilesParams<'a> {
    pub dir: &'a str,
    pub offset: u64,
    pub limit: u64,
    pub order_by: FileSortKey,
    pub desc: bool,
    pub flat: bool,
}

pub fn list_files(conn: &Connection, p: ListFilesParams<'_>) -> rusqlite::Result<Vec<FileRecord>> {
    let like = format!("{}%", escape_like_prefix(p.dir));
    let order_col = p.order_by.column();
    let direction = if p.desc { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT * FROM file WHERE url LIKE ?1 ESCAPE '\\' ORDER BY {order_col} {direction}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let all = stmt.query_map(params![like], row_to_file)?.collect::<Result<Vec<_>, _>>()?;
    let filtered: Vec<FileRecord> = if p.flat {
        all
    } else {
        all.into_iter().filter(|r| direct_child(p.dir, &r.url)).collect()
    };
    Ok(filtered
        .into_iter()
        .skip(p.offset as usize)
        .take(p.limit as usize)
        .collect())
}

pub fn count_dirs(conn: &Connection, dir: &str) -> rusqlite::Result<u64> {
    Ok(list_dir_names(conn, dir)?.len() as u64)
}

pub fn list_dirs(conn: &Connection, dir: &str, offset: u64, limit: u64, desc: bool) -> rusqlite::Result<Vec<String>> {
    let mut names = list_dir_names(conn, dir)?;
    names.sort();
    if desc {
        names.reverse();
    }
    Ok(names.into_iter().skip(offset as usize).take(limit as usize).collect())
}

fn list_dir_names(conn: &Connection, dir: &str) -> rusqlite::Result<Vec<String>> {
    let like = format!("{}%", escape_like_prefix(dir));
    let mut stmt = conn.prepare("SELECT url FROM file WHERE url LIKE ?1 ESCAPE '\\'")?;
    let urls: Vec<String> = stmt.query_map(params![like], |r| r.get(0))?.collect::<Result<_, _>>()?;
    let mut seen = std::collections::BTreeSet::new();
    for url in &urls {
        if let Some(rest) = url.strip_prefix(dir) {
            if let Some(idx) = rest.find('/') {
                seen.insert(rest[..=idx].to_string());
            }
        }
    }
    Ok(seen.into_iter().collect())
}

/// Aggregate directory record over every descendant of `dir`.
/// `Ok(None)` means the prefix has no descendants (caller raises
/// `PathNotFound`).
pub fn get_dir_record(conn: &Connection, dir: &str) -> rusqlite::Result<Option<DirectoryRecord>> {
    let like = format!("{}%", escape_like_prefix(dir));
    let row = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0), MIN(create_time), MAX(create_time), MAX(access_time)
             FROM file WHERE url LIKE ?1 ESCAPE '\\'",
            params![like],
            |r| {
                let n: i64 = r.get(0)?;
                let size: i64 = r.get(1)?;
                let min_ct: Option<chrono::DateTime<Utc>> = r.get(2)?;
                let max_ct: Option<chrono::DateTime<Utc>> = r.get(3)?;
                let max_at: Option<chrono::DateTime<Utc>> = r.get(4)?;
                Ok((n, size, min_ct, max_ct, max_at))
            },
        )?;
    let (n, size, min_ct, _max_ct, max_at) = row;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(DirectoryRecord {
        url: dir.to_string(),
        size: size as u64,
        n_files: n as u64,
        create_time: min_ct.unwrap_or_else(Utc::now),
        access_time: max_at.unwrap_or_else(Utc::now),
    }))
}

pub fn get_dupcount(conn: &Connection, file_id: &str) -> rusqlite::Result<u64> {
    let v: Option<i64> = conn
        .query_row("SELECT count FROM dupcount WHERE file_id = ?1", params![file_id], |r| r.get(0))
        .optional()?;
    Ok(v.unwrap_or(0).max(0) as u64)
}

pub fn incr_dupcount(conn: &Connection, file_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO dupcount (file_id, count) VALUES (?1, 1)
         ON CONFLICT(file_id) DO UPDATE SET count = count + 1",
        params![file_id],
    )?;
    Ok(())
}

/// Returns `true` if the blob is now unreferenced (dupcount was 0)
/// and should be physically unlinked by the caller.
pub fn decr_dupcount_or_free(conn: &Connection, file_id: &str) -> rusqlite::Result<bool> {
    let current = get_dupcount(conn, file_id)?;
    if current == 0 {
        conn.execute("DELETE FROM dupcount WHERE file_id = ?1", params![file_id])?;
        Ok(true)
    } else {
        conn.execute(
            "UPDATE dupcount SET count = count - 1 WHERE file_id = ?1",
            params![file_id],
        )?;
        if current - 1 == 0 {
            conn.execute("DELETE FROM dupcount WHERE file_id = ?1", params![file_id])?;
        }
        Ok(false)
    }
}

/// How many *other* rows still reference `file_id` (excludes the
/// dupcount side-table, counts actual file rows — used when the
/// dupcount table and the file table could have drifted, e.g. bulk
/// deletes within the same transaction).
pub fn count_rows_for_file_id(conn: &Connection, file_id: &str) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM file WHERE file_id = ?1",
        params![file_id],
        |r| r.get(0),
    )?;
    Ok(n as u64)
}
