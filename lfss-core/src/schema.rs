use rusqlite::Connection;

use crate::error::{LfssError, LfssResult};

/// `index.db` schema: users, files, peer access, dedup counters,
/// virtual-user expirations. Inline blob bytes live in a second
/// logical table within the same file (rather than a genuinely
/// separate attached database) to keep the connection pool simple —
/// external blobs still live on disk under `external_dir`.
const INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    credential TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    create_time TEXT NOT NULL,
    last_active TEXT NOT NULL,
    max_storage INTEGER NOT NULL,
    permission INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_expiration (
    user_id INTEGER PRIMARY KEY REFERENCES user(id) ON DELETE CASCADE,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS peer_access (
    src_user_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
    dst_user_id INTEGER NOT NULL REFERENCES user(id) ON DELETE CASCADE,
    access_level INTEGER NOT NULL,
    PRIMARY KEY (src_user_id, dst_user_id)
);

CREATE TABLE IF NOT EXISTS file (
    url TEXT PRIMARY KEY,
    owner_id INTEGER NOT NULL REFERENCES user(id),
    file_id TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    create_time TEXT NOT NULL,
    access_time TEXT NOT NULL,
    permission INTEGER NOT NULL DEFAULT 0,
    external INTEGER NOT NULL,
    mime_type TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_owner ON file(owner_id);
CREATE INDEX IF NOT EXISTS idx_file_file_id ON file(file_id);

CREATE TABLE IF NOT EXISTS user_size (
    user_id INTEGER PRIMARY KEY REFERENCES user(id) ON DELETE CASCADE,
    usize INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS dupcount (
    file_id TEXT PRIMARY KEY,
    count INTEGER NOT NULL
);
"#;

const BLOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blobs.inline_blob (
    file_id TEXT PRIMARY KEY,
    data BLOB NOT NULL
);
"#;

const LOCK_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dav_lock (
    path TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    token TEXT NOT NULL,
    expires_at TEXT
);
"#;

pub fn init_index_schema(conn: &Connection) -> LfssResult<()> {
    conn.execute_batch(INDEX_SCHEMA).map_err(LfssError::from_sqlite)?;
    ensure_guest_user(conn)
}

pub fn init_blobs_schema(conn: &Connection) -> LfssResult<()> {
    conn.execute_batch(BLOBS_SCHEMA).map_err(LfssError::from_sqlite)
}

/// The WebDAV lock table is "recreated empty on startup" per the
/// locking design — no lock can outlive a process restart.
pub fn init_lock_schema_fresh(conn: &Connection) -> LfssResult<()> {
    conn.execute_batch("DROP TABLE IF EXISTS dav_lock;").map_err(LfssError::from_sqlite)?;
    conn.execute_batch(LOCK_SCHEMA).map_err(LfssError::from_sqlite)
}

fn ensure_guest_user(conn: &Connection) -> LfssResult<()> {
    let exists: bool = conn
        .query_row("SELECT EXISTS(SELECT 1 FROM user WHERE id = 0)", [], |r| r.get(0))
        .map_err(LfssError::from_sqlite)?;
    if !exists {
        conn.execute(
            "INSERT INTO user (id, username, credential, is_admin, create_time, last_active, max_storage, permission)
             VALUES (0, '', '', 0, datetime('now'), datetime('now'), 0, 0)",
            [],
        )
        .map_err(LfssError::from_sqlite)?;
    }
    Ok(())
}
