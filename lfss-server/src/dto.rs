use serde::{Deserialize, Serialize};

use lfss_core::types::{AccessLevel, FileReadPermission, FileRecord, UserRecord};

#[derive(Debug, Serialize)]
pub struct FileRecordDto {
    pub url: String,
    pub owner_id: u64,
    pub file_id: String,
    pub file_size: u64,
    pub create_time: chrono::DateTime<chrono::Utc>,
    pub access_time: chrono::DateTime<chrono::Utc>,
    pub permission: FileReadPermission,
    pub external: bool,
    pub mime_type: String,
}

impl From<FileRecord> for FileRecordDto {
    fn from(r: FileRecord) -> Self {
        FileRecordDto {
            url: r.url,
            owner_id: r.owner_id,
            file_id: r.file_id,
            file_size: r.file_size,
            create_time: r.create_time,
            access_time: r.access_time,
            permission: r.permission,
            external: r.external,
            mime_type: r.mime_type,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserRecordDto {
    pub id: u64,
    pub username: String,
    pub is_admin: bool,
    pub create_time: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
    pub max_storage: u64,
    pub permission: FileReadPermission,
}

impl From<UserRecord> for UserRecordDto {
    fn from(u: UserRecord) -> Self {
        UserRecordDto {
            id: u.id,
            username: u.username,
            is_admin: u.is_admin,
            create_time: u.create_time,
            last_active: u.last_active,
            max_storage: u.max_storage,
            permission: u.permission,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub thumb: bool,
    #[serde(default)]
    pub download: bool,
}

#[derive(Debug, Deserialize)]
pub struct PutQuery {
    #[serde(default)]
    pub permission: Option<u8>,
    #[serde(default)]
    pub conflict: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetaQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SetPermRequest {
    pub path: String,
    pub permission: u8,
}

#[derive(Debug, Deserialize)]
pub struct MoveCopyQuery {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Deserialize)]
pub struct BundleQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct CountFilesQuery {
    pub path: String,
    #[serde(default)]
    pub flat: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_order_by")]
    pub order_by: String,
    #[serde(default)]
    pub desc: bool,
    #[serde(default)]
    pub flat: bool,
}

fn default_limit() -> u64 {
    1000
}

fn default_order_by() -> String {
    "url".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListDirsQuery {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Deserialize)]
pub struct GetMultipleRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub skip_content: bool,
}

#[derive(Debug, Serialize)]
pub struct GetMultipleEntry {
    pub record: Option<FileRecordDto>,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub max_storage: u64,
    #[serde(default)]
    pub permission: FileReadPermission,
}

#[derive(Debug, Deserialize)]
pub struct AddVirtualUserRequest {
    #[serde(default)]
    pub max_storage: u64,
    #[serde(default)]
    pub permission: FileReadPermission,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    /// Batch peer grant grammar, e.g. `"READ:alice,bob;WRITE:carol"` —
    /// parsed by `parse_peer_list` and applied after creation.
    #[serde(default)]
    pub peers: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddVirtualUserResponse {
    pub user: UserRecordDto,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub max_storage: Option<u64>,
    #[serde(default)]
    pub permission: Option<FileReadPermission>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteUserRequest {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct SetPeerRequest {
    pub src: String,
    pub dst: String,
    pub level: AccessLevel,
}

#[derive(Debug, Serialize)]
pub struct StorageResponse {
    pub used: u64,
    pub quota: u64,
}
