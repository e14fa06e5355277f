use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{LfssError, LfssResult};
use crate::metadata::users::{self, PeerGrant};
use crate::path::validate_username;
use crate::types::{AccessLevel, FileReadPermission, UserRecord};

/// `SHA-256("<username>:<password>")`, hex-encoded. The stored
/// credential *is* the bearer token — there is no separate session
/// layer, so rotating it (via `update_user`) invalidates every
/// outstanding token immediately.
pub fn hash_credential(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Resolve a bearer token to its owning user, honoring virtual-user
/// expiration: an expired credential authenticates nobody.
pub async fn authenticate(engine: &Engine, token: &str) -> LfssResult<Option<UserRecord>> {
    if token.is_empty() {
        return Ok(None);
    }
    let token = token.to_string();
    let mut cursor = engine.pool.read_cursor().await;
    cursor
        .with(move |conn| {
            let id: Option<i64> = conn
                .query_row("SELECT id FROM user WHERE credential = ?1", rusqlite::params![token], |r| r.get(0))
                .optional()?;
            let Some(id) = id else { return Ok(None) };
            let id = id as u64;
            if users::is_expired(conn, id, Utc::now())? {
                return Ok(None);
            }
            users::get_user_by_id(conn, id)
        })
        .await
}

/// Create a regular user with an explicit password. Admin-only.
pub async fn create_user(
    engine: &Engine,
    caller: &UserRecord,
    username: &str,
    password: &str,
    max_storage: u64,
    permission: FileReadPermission,
) -> LfssResult<UserRecord> {
    if !caller.is_admin {
        return Err(LfssError::PermissionDenied);
    }
    validate_username(username)?;
    let credential = hash_credential(username, password);
    let username = username.to_string();
    let mut cursor = engine.pool.write_cursor().await;
    cursor
        .with(move |conn| users::create_user(conn, &username, &credential, false, max_storage, permission))
        .await
}

/// Create a virtual user: a reserved-prefix username with a random
/// password and, usually, a soft expiration. The caller never chooses
/// the password, so the bearer token is returned here — it's the only
/// chance to capture it.
pub async fn create_virtual_user(
    engine: &Engine,
    caller: &UserRecord,
    max_storage: u64,
    permission: FileReadPermission,
    ttl: Option<Duration>,
) -> LfssResult<(UserRecord, String)> {
    if !caller.is_admin {
        return Err(LfssError::PermissionDenied);
    }
    let username = format!(".v-{}", Uuid::new_v4());
    let password = Uuid::new_v4().to_string();
    let credential = hash_credential(&username, &password);
    let expires_at = ttl.map(|d| Utc::now() + d);
    let credential_for_tx = credential.clone();

    let user = {
        let mut cursor = engine.pool.write_cursor().await;
        cursor
            .with(move |conn| {
                let user = users::create_user(conn, &username, &credential_for_tx, false, max_storage, permission)?;
                if let Some(expires_at) = expires_at {
                    users::set_expiration(conn, user.id, expires_at)?;
                }
                Ok(user)
            })
            .await?
    };
    Ok((user, credential))
}

/// Update credential, quota, and/or default permission in place.
/// Updating the password rotates the bearer token. Self-service or
/// admin only.
pub async fn update_user(
    engine: &Engine,
    caller: &UserRecord,
    username: &str,
    new_password: Option<&str>,
    new_max_storage: Option<u64>,
    new_permission: Option<FileReadPermission>,
) -> LfssResult<UserRecord> {
    if !caller.is_admin && caller.username != username {
        return Err(LfssError::PermissionDenied);
    }
    let target = {
        let username = username.to_string();
        let mut cursor = engine.pool.read_cursor().await;
        cursor.with(move |conn| users::get_user_by_username(conn, &username)).await?
    }
    .ok_or_else(|| LfssError::UserNotFound(username.to_string()))?;

    let new_credential = new_password.map(|p| hash_credential(username, p));
    let id = target.id;
    let mut cursor = engine.pool.write_cursor().await;
    cursor
        .with(move |conn| {
            if let Some(credential) = &new_credential {
                users::update_user_credential(conn, id, credential)?;
            }
            if let Some(max_storage) = new_max_storage {
                users::update_user_max_storage(conn, id, max_storage)?;
            }
            if let Some(permission) = new_permission {
                users::update_user_permission(conn, id, permission)?;
            }
            users::get_user_by_id(conn, id)
        })
        .await?
        .ok_or_else(|| LfssError::UserNotFound(username.to_string()))
}

pub async fn delete_user(engine: &Arc<Engine>, caller: &UserRecord, username: &str) -> LfssResult<()> {
    if !caller.is_admin && caller.username != username {
        return Err(LfssError::PermissionDenied);
    }
    crate::lifecycle::delete_user(engine, username).await
}

/// Grant or revoke `src`'s access into `dst`'s subtree. Only an admin
/// or `dst` (the subtree owner deciding who they let in) may call this.
pub async fn set_peer(
    engine: &Engine,
    caller: &UserRecord,
    src_username: &str,
    dst_username: &str,
    level: AccessLevel,
) -> LfssResult<()> {
    if !caller.is_admin && caller.username != dst_username {
        return Err(LfssError::PermissionDenied);
    }
    let src_username = src_username.to_string();
    let dst_username = dst_username.to_string();
    let mut cursor = engine.pool.write_cursor().await;
    cursor
        .with(move |conn| {
            let src = users::get_user_by_username(conn, &src_username)?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            let dst = users::get_user_by_username(conn, &dst_username)?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            users::set_peer_level(conn, src.id, dst.id, level)
        })
        .await
}

/// Peers `user` has let into their own subtree.
pub async fn list_peers(engine: &Engine, user: &UserRecord) -> LfssResult<Vec<PeerGrant>> {
    let id = user.id;
    let mut cursor = engine.pool.read_cursor().await;
    cursor.with(move |conn| users::list_peers_granting_to(conn, id)).await
}

/// Subtrees `user` can reach through a peer grant, for the WebDAV
/// root listing: their own subtree plus every owner that let them in.
pub async fn accessible_subtrees(engine: &Engine, user: &UserRecord) -> LfssResult<Vec<PeerGrant>> {
    let id = user.id;
    let mut cursor = engine.pool.read_cursor().await;
    cursor.with(move |conn| users::list_accessible_subtrees(conn, id)).await
}

/// `user/storage`: `(used, quota)` in bytes.
pub async fn storage(engine: &Engine, user: &UserRecord) -> LfssResult<(u64, u64)> {
    let id = user.id;
    let mut cursor = engine.pool.read_cursor().await;
    let used = cursor.with(move |conn| users::get_user_size(conn, id)).await?;
    Ok((used, user.max_storage))
}

/// `user/query`: admin-only listing. Virtual users are never returned
/// unless the prefix is itself within the reserved `.v-` namespace.
pub async fn query_users(engine: &Engine, caller: &UserRecord, prefix: Option<&str>) -> LfssResult<Vec<UserRecord>> {
    if !caller.is_admin {
        return Err(LfssError::PermissionDenied);
    }
    let wants_virtual = prefix.map(UserRecord::is_virtual_username).unwrap_or(false);
    let prefix = prefix.map(str::to_string);
    let mut cursor = engine.pool.read_cursor().await;
    let all = cursor.with(move |conn| users::list_users(conn, prefix.as_deref())).await?;
    Ok(all
        .into_iter()
        .filter(|u| wants_virtual || !UserRecord::is_virtual_username(&u.username))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_credential_is_deterministic_and_username_scoped() {
        let a = hash_credential("alice", "hunter2");
        let b = hash_credential("alice", "hunter2");
        let c = hash_credential("bob", "hunter2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
