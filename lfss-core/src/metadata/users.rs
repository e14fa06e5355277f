use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{AccessLevel, FileReadPermission, UserRecord};

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<UserRecord> {
    let id: i64 = row.get("id")?;
    let is_admin: i64 = row.get("is_admin")?;
    let permission: i64 = row.get("permission")?;
    Ok(UserRecord {
        id: id as u64,
        username: row.get("username")?,
        credential: row.get("credential")?,
        is_admin: is_admin != 0,
        create_time: row.get("create_time")?,
        last_active: row.get("last_active")?,
        max_storage: { let v: i64 = row.get("max_storage")?; v as u64 },
        permission: FileReadPermission::from_i64(permission).unwrap_or(FileReadPermission::Unset),
    })
}

pub fn create_user(
    conn: &Connection,
    username: &str,
    credential: &str,
    is_admin: bool,
    max_storage: u64,
    permission: FileReadPermission,
) -> rusqlite::Result<UserRecord> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO user (username, credential, is_admin, create_time, last_active, max_storage, permission)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![username, credential, is_admin as i64, now, now, max_storage as i64, permission.as_i64()],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO user_size (user_id, usize) VALUES (?1, 0)",
        params![id],
    )?;
    get_user_by_id(conn, id as u64).map(|o| o.expect("just inserted"))
}

pub fn get_user_by_id(conn: &Connection, id: u64) -> rusqlite::Result<Option<UserRecord>> {
    conn.query_row("SELECT * FROM user WHERE id = ?1", params![id as i64], row_to_user).optional()
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> rusqlite::Result<Option<UserRecord>> {
    conn.query_row("SELECT * FROM user WHERE username = ?1", params![username], row_to_user).optional()
}

pub fn delete_user(conn: &Connection, username: &str) -> rusqlite::Result<Option<UserRecord>> {
    let user = get_user_by_username(conn, username)?;
    if user.is_some() {
        conn.execute("DELETE FROM user WHERE username = ?1", params![username])?;
    }
    Ok(user)
}

pub fn update_user_credential(conn: &Connection, id: u64, credential: &str) -> rusqlite::Result<()> {
    conn.execute("UPDATE user SET credential = ?1 WHERE id = ?2", params![credential, id as i64])?;
    Ok(())
}

pub fn update_user_max_storage(conn: &Connection, id: u64, max_storage: u64) -> rusqlite::Result<()> {
    conn.execute("UPDATE user SET max_storage = ?1 WHERE id = ?2", params![max_storage as i64, id as i64])?;
    Ok(())
}

pub fn update_user_permission(conn: &Connection, id: u64, permission: FileReadPermission) -> rusqlite::Result<()> {
    conn.execute("UPDATE user SET permission = ?1 WHERE id = ?2", params![permission.as_i64(), id as i64])?;
    Ok(())
}

pub fn set_last_active(conn: &Connection, id: u64, at: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute("UPDATE user SET last_active = ?1 WHERE id = ?2", params![at, id as i64])?;
    Ok(())
}

pub fn get_user_size(conn: &Connection, id: u64) -> rusqlite::Result<u64> {
    let v: i64 = conn
        .query_row("SELECT usize FROM user_size WHERE user_id = ?1", params![id as i64], |r| r.get(0))
        .optional()?
        .unwrap_or(0);
    Ok(v as u64)
}

pub fn adjust_user_size(conn: &Connection, id: u64, delta: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO user_size (user_id, usize) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET usize = usize + ?2",
        params![id as i64, delta],
    )?;
    Ok(())
}

pub fn get_peer_level(conn: &Connection, src: u64, dst: u64) -> rusqlite::Result<AccessLevel> {
    let v: Option<i64> = conn
        .query_row(
            "SELECT access_level FROM peer_access WHERE src_user_id = ?1 AND dst_user_id = ?2",
            params![src as i64, dst as i64],
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.and_then(AccessLevel::from_i64).unwrap_or(AccessLevel::None))
}

pub fn set_peer_level(conn: &Connection, src: u64, dst: u64, level: AccessLevel) -> rusqlite::Result<()> {
    if level == AccessLevel::None {
        conn.execute(
            "DELETE FROM peer_access WHERE src_user_id = ?1 AND dst_user_id = ?2",
            params![src as i64, dst as i64],
        )?;
    } else {
        conn.execute(
            "INSERT INTO peer_access (src_user_id, dst_user_id, access_level) VALUES (?1, ?2, ?3)
             ON CONFLICT(src_user_id, dst_user_id) DO UPDATE SET access_level = ?3",
            params![src as i64, dst as i64, level.as_i64()],
        )?;
    }
    Ok(())
}

pub struct PeerGrant {
    pub peer_username: String,
    pub level: AccessLevel,
}

/// Peers this user (as subtree owner, `dst_user_id`) has let into
/// their own subtree — what `user/list-peers` shows an owner so they
/// can see who they've granted access to.
pub fn list_peers_granting_to(conn: &Connection, user_id: u64) -> rusqlite::Result<Vec<PeerGrant>> {
    let mut stmt = conn.prepare(
        "SELECT u.username, p.access_level FROM peer_access p
         JOIN user u ON u.id = p.src_user_id
         WHERE p.dst_user_id = ?1",
    )?;
    let rows = stmt.query_map(params![user_id as i64], |r| {
        let level: i64 = r.get(1)?;
        Ok(PeerGrant {
            peer_username: r.get(0)?,
            level: AccessLevel::from_i64(level).unwrap_or(AccessLevel::None),
        })
    })?;
    rows.collect()
}

/// Subtrees this user (as accessor, `src_user_id`) can reach through a
/// peer grant — the direction the WebDAV root listing needs: "every
/// user that grants them READ".
pub fn list_accessible_subtrees(conn: &Connection, user_id: u64) -> rusqlite::Result<Vec<PeerGrant>> {
    let mut stmt = conn.prepare(
        "SELECT u.username, p.access_level FROM peer_access p
         JOIN user u ON u.id = p.dst_user_id
         WHERE p.src_user_id = ?1",
    )?;
    let rows = stmt.query_map(params![user_id as i64], |r| {
        let level: i64 = r.get(1)?;
        Ok(PeerGrant {
            peer_username: r.get(0)?,
            level: AccessLevel::from_i64(level).unwrap_or(AccessLevel::None),
        })
    })?;
    rows.collect()
}

pub fn list_users(conn: &Connection, prefix: Option<&str>) -> rusqlite::Result<Vec<UserRecord>> {
    match prefix {
        Some(p) => {
            let like = format!("{}%", p.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
            let mut stmt = conn.prepare("SELECT * FROM user WHERE username LIKE ?1 ESCAPE '\\' ORDER BY username")?;
            let rows = stmt.query_map(params![like], row_to_user)?;
            rows.collect()
        }
        None => {
            let mut stmt = conn.prepare("SELECT * FROM user ORDER BY username")?;
            let rows = stmt.query_map([], row_to_user)?;
            rows.collect()
        }
    }
}

pub fn set_expiration(conn: &Connection, user_id: u64, expires_at: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO user_expiration (user_id, expires_at) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET expires_at = ?2",
        params![user_id as i64, expires_at],
    )?;
    Ok(())
}

pub fn get_expiration(conn: &Connection, user_id: u64) -> rusqlite::Result<Option<DateTime<Utc>>> {
    conn.query_row(
        "SELECT expires_at FROM user_expiration WHERE user_id = ?1",
        params![user_id as i64],
        |r| r.get(0),
    )
    .optional()
}

pub fn is_expired(conn: &Connection, user_id: u64, now: DateTime<Utc>) -> rusqlite::Result<bool> {
    Ok(get_expiration(conn, user_id)?.map(|t| now > t).unwrap_or(false))
}

/// Grammar: `"READ:user1,user2;WRITE:user3"` — semicolon-separated
/// `LEVEL:comma,separated,usernames` groups.
pub fn parse_peer_list(spec: &str) -> Result<Vec<(String, AccessLevel)>, String> {
    let mut out = Vec::new();
    for group in spec.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (level_str, names) = group
            .split_once(':')
            .ok_or_else(|| format!("malformed peer group: {group}"))?;
        let level = AccessLevel::parse(level_str.trim())
            .ok_or_else(|| format!("unknown access level: {level_str}"))?;
        for name in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            out.push((name.to_string(), level));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_list_grammar() {
        let parsed = parse_peer_list("READ:user1,user2;WRITE:user3").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("user1".to_string(), AccessLevel::Read),
                ("user2".to_string(), AccessLevel::Read),
                ("user3".to_string(), AccessLevel::Write),
            ]
        );
    }

    #[test]
    fn rejects_malformed_group() {
        assert!(parse_peer_list("READuser1").is_err());
        assert!(parse_peer_list("NOPE:user1").is_err());
    }
}
