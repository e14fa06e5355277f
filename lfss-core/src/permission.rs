use rusqlite::Connection;

use crate::error::{LfssError, LfssResult};
use crate::metadata::users;
use crate::path::first_segment;
use crate::types::{AccessLevel, DirConfig, FileReadPermission, FileRecord, UserRecord};

/// `check_path_permission(path, user) -> AccessLevel`, per §4.4.
/// `dir_configs` is the deepest-first ancestor chain of already
/// *parsed* directory configs (see `lifecycle::resolve_dir_configs`);
/// passing it in keeps this function free of blob-store I/O.
pub fn check_path_permission(
    conn: &Connection,
    path: &str,
    user: &UserRecord,
    file_at_path: Option<&FileRecord>,
    dir_configs: &[(String, DirConfig)],
) -> LfssResult<AccessLevel> {
    if user.is_guest() {
        return Ok(AccessLevel::Guest);
    }
    if user.is_admin {
        return Ok(AccessLevel::All);
    }

    let owner_username = first_segment(path);
    let owner = users::get_user_by_username(conn, owner_username).map_err(LfssError::from_sqlite)?;
    let Some(owner) = owner else {
        return Err(LfssError::PathNotFound(path.to_string()));
    };

    if user.id == owner.id {
        return Ok(AccessLevel::All);
    }

    if let Some(file) = file_at_path {
        if file.owner_id == user.id {
            return Ok(AccessLevel::All);
        }
    }

    let mut level = users::get_peer_level(conn, user.id, owner.id).map_err(LfssError::from_sqlite)?;

    // Directory-config override: the configured level for this
    // username *replaces* the peer level within the subtree (it may
    // lower it to NONE). Ties are broken by the deepest ancestor that
    // defines an entry for this username.
    for (_dir, config) in dir_configs {
        if let Some(&configured) = config.access_control.get(&user.username) {
            level = configured;
            break;
        }
    }

    Ok(level)
}

/// `check_file_read_permission(user, file) -> bool`, applied only
/// when the path-level check is below `READ`.
pub fn check_file_read_permission(
    user: &UserRecord,
    file: &FileRecord,
    owner_default_permission: FileReadPermission,
) -> bool {
    match file.permission {
        FileReadPermission::Private => false,
        FileReadPermission::Protected => !user.is_guest(),
        FileReadPermission::Public => true,
        FileReadPermission::Unset => match owner_default_permission {
            FileReadPermission::Private => false,
            FileReadPermission::Protected => !user.is_guest(),
            FileReadPermission::Public => true,
            FileReadPermission::Unset => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: u64, admin: bool) -> UserRecord {
        UserRecord {
            id,
            username: format!("u{id}"),
            credential: String::new(),
            is_admin: admin,
            create_time: Utc::now(),
            last_active: Utc::now(),
            max_storage: 0,
            permission: FileReadPermission::Unset,
        }
    }

    fn file(owner_id: u64, permission: FileReadPermission) -> FileRecord {
        FileRecord {
            url: "alice/x".into(),
            owner_id,
            file_id: "f1".into(),
            file_size: 0,
            create_time: Utc::now(),
            access_time: Utc::now(),
            permission,
            external: false,
            mime_type: "text/plain".into(),
        }
    }

    #[test]
    fn private_always_denies_non_owner() {
        let u = user(2, false);
        let f = file(1, FileReadPermission::Private);
        assert!(!check_file_read_permission(&u, &f, FileReadPermission::Public));
    }

    #[test]
    fn protected_denies_guest_allows_authenticated() {
        let f = file(1, FileReadPermission::Protected);
        let guest = UserRecord { id: 0, ..user(0, false) };
        let other = user(2, false);
        assert!(!check_file_read_permission(&guest, &f, FileReadPermission::Public));
        assert!(check_file_read_permission(&other, &f, FileReadPermission::Public));
    }

    #[test]
    fn unset_falls_back_to_owner_default() {
        let f = file(1, FileReadPermission::Unset);
        let other = user(2, false);
        assert!(check_file_read_permission(&other, &f, FileReadPermission::Public));
        assert!(!check_file_read_permission(&other, &f, FileReadPermission::Private));
    }
}
