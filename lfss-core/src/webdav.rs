use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{LfssError, LfssResult};
use crate::lifecycle;
use crate::path::validate_dir_url;
use crate::types::{FileReadPermission, UserRecord, WEBDAV_KEEP_FILE};
use crate::user;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1800);

/// `PROPFIND` depth header, collapsed to the three values the adapter
/// actually distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    pub fn parse(s: &str) -> Self {
        match s {
            "0" => Depth::Zero,
            "infinity" => Depth::Infinity,
            _ => Depth::One,
        }
    }
}

/// `MKCOL <dir>`: drop the queryable placeholder so an otherwise-empty
/// directory exists as a listable prefix.
pub async fn mkcol(engine: &Arc<Engine>, caller: &UserRecord, dir: &str) -> LfssResult<()> {
    validate_dir_url(dir)?;
    let keep_url = format!("{dir}{WEBDAV_KEEP_FILE}");
    lifecycle::save_file(engine, caller, &keep_url, Bytes::new(), FileReadPermission::Unset, None, true).await?;
    Ok(())
}

/// `PROPFIND` root enumeration: the caller's own subtree plus every
/// subtree a peer grant lets them into, unioned with every user if
/// the caller is an admin.
pub async fn propfind_roots(engine: &Engine, caller: &UserRecord) -> LfssResult<Vec<String>> {
    if caller.is_admin {
        let mut cursor = engine.pool.read_cursor().await;
        let users = cursor
            .with(|conn| crate::metadata::users::list_users(conn, None))
            .await?;
        return Ok(users.into_iter().map(|u| u.username).collect());
    }
    let mut roots = vec![caller.username.clone()];
    for grant in user::accessible_subtrees(engine, caller).await? {
        if grant.level >= crate::types::AccessLevel::Read {
            roots.push(grant.peer_username);
        }
    }
    roots.sort();
    roots.dedup();
    Ok(roots)
}

/// Acquire an advisory write lock on `path`. Fails if a live,
/// non-expired lock is already held by someone else.
pub async fn lock(engine: &Engine, caller: &UserRecord, path: &str, timeout: Option<Duration>) -> LfssResult<String> {
    let token = Uuid::new_v4().to_string();
    let expires_at = timeout.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero()));
    let path_owned = path.to_string();
    let user_id = caller.id;
    let token_for_tx = token.clone();

    let mut cursor = engine.lock_pool.write_cursor().await;
    let acquired = cursor
        .with(move |conn| {
            let existing: Option<(i64, Option<chrono::DateTime<Utc>>)> = conn
                .query_row(
                    "SELECT user_id, expires_at FROM dav_lock WHERE path = ?1",
                    params![path_owned],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            if let Some((owner, expires_at)) = existing {
                let expired = expires_at.map(|e| Utc::now() > e).unwrap_or(false);
                if !expired && owner != user_id as i64 {
                    return Ok(false);
                }
            }

            conn.execute(
                "INSERT INTO dav_lock (path, user_id, token, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET user_id = ?2, token = ?3, expires_at = ?4",
                params![path_owned, user_id as i64, token_for_tx, expires_at],
            )?;
            Ok(true)
        })
        .await?;
    if !acquired {
        return Err(LfssError::FileLocked(path.to_string()));
    }
    Ok(token)
}

/// Release a lock. Requires the presented token and caller to match
/// the held lock exactly.
pub async fn unlock(engine: &Engine, caller: &UserRecord, path: &str, token: &str) -> LfssResult<()> {
    let path_owned = path.to_string();
    let token_owned = token.to_string();
    let user_id = caller.id;
    let mut cursor = engine.lock_pool.write_cursor().await;
    let removed = cursor
        .with(move |conn| {
            conn.execute(
                "DELETE FROM dav_lock WHERE path = ?1 AND token = ?2 AND user_id = ?3",
                params![path_owned, token_owned, user_id as i64],
            )
        })
        .await?;
    if removed == 0 {
        return Err(LfssError::PermissionDenied);
    }
    Ok(())
}

/// Whether `path` is currently locked by someone other than `caller`.
pub async fn is_locked_by_other(engine: &Engine, caller: &UserRecord, path: &str) -> LfssResult<bool> {
    let path_owned = path.to_string();
    let user_id = caller.id;
    let mut cursor = engine.lock_pool.read_cursor().await;
    cursor
        .with(move |conn| {
            let row: Option<(i64, Option<chrono::DateTime<Utc>>)> = conn
                .query_row(
                    "SELECT user_id, expires_at FROM dav_lock WHERE path = ?1",
                    params![path_owned],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            Ok(match row {
                Some((owner, expires_at)) => {
                    let expired = expires_at.map(|e| Utc::now() > e).unwrap_or(false);
                    !expired && owner != user_id as i64
                }
                None => false,
            })
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_parses_known_values_and_defaults_to_one() {
        assert_eq!(Depth::parse("0"), Depth::Zero);
        assert_eq!(Depth::parse("infinity"), Depth::Infinity);
        assert_eq!(Depth::parse("1"), Depth::One);
        assert_eq!(Depth::parse("garbage"), Depth::One);
    }
}
