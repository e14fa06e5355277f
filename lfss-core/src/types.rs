use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access an authenticated (or guest) caller has to a subtree.
/// Ordered `GUEST < NONE < READ < WRITE < ALL` — the derived `Ord`
/// relies on declaration order, so do not reorder these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Guest,
    None,
    Read,
    Write,
    All,
}

impl AccessLevel {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            -1 => Some(AccessLevel::Guest),
            0 => Some(AccessLevel::None),
            1 => Some(AccessLevel::Read),
            2 => Some(AccessLevel::Write),
            3 => Some(AccessLevel::All),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            AccessLevel::Guest => -1,
            AccessLevel::None => 0,
            AccessLevel::Read => 1,
            AccessLevel::Write => 2,
            AccessLevel::All => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GUEST" => Some(AccessLevel::Guest),
            "NONE" => Some(AccessLevel::None),
            "READ" => Some(AccessLevel::Read),
            "WRITE" => Some(AccessLevel::Write),
            "ALL" => Some(AccessLevel::All),
            _ => None,
        }
    }
}

/// Per-file read permission, a second axis orthogonal to
/// `AccessLevel`, resolved only when the path-level check is below
/// `READ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileReadPermission {
    #[default]
    Unset,
    Public,
    Protected,
    Private,
}

impl FileReadPermission {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(FileReadPermission::Unset),
            1 => Some(FileReadPermission::Public),
            2 => Some(FileReadPermission::Protected),
            3 => Some(FileReadPermission::Private),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            FileReadPermission::Unset => 0,
            FileReadPermission::Public => 1,
            FileReadPermission::Protected => 2,
            FileReadPermission::Private => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub username: String,
    pub credential: String,
    pub is_admin: bool,
    pub create_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub max_storage: u64,
    pub permission: FileReadPermission,
}

impl UserRecord {
    pub const GUEST_ID: u64 = 0;

    pub fn is_guest(&self) -> bool {
        self.id == Self::GUEST_ID
    }

    /// Reserved virtual-user username prefix, e.g. `.v-sometoken`.
    pub fn is_virtual_username(username: &str) -> bool {
        username.starts_with(".v-")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub url: String,
    pub owner_id: u64,
    pub file_id: String,
    pub file_size: u64,
    pub create_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub permission: FileReadPermission,
    pub external: bool,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub url: String,
    pub size: u64,
    pub n_files: u64,
    pub create_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathContents {
    pub dirs: Vec<DirectoryRecord>,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirConfig {
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub access_control: std::collections::HashMap<String, AccessLevel>,
}

impl DirConfig {
    pub const FILE_NAME: &'static str = ".lfssdir.json";
}

/// Placeholder file `MKCOL` drops in an otherwise-empty directory so
/// it becomes queryable (the metadata store has no directory rows of
/// its own — directories exist only as common URL prefixes).
pub const WEBDAV_KEEP_FILE: &str = ".lfss_keep";

/// Closed set of sort keys accepted by `list-files`; unknown keys are
/// a `LfssError::InvalidOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSortKey {
    Url,
    FileSize,
    CreateTime,
    AccessTime,
    MimeType,
}

impl FileSortKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "url" => Some(FileSortKey::Url),
            "file_size" => Some(FileSortKey::FileSize),
            "create_time" => Some(FileSortKey::CreateTime),
            "access_time" => Some(FileSortKey::AccessTime),
            "mime_type" => Some(FileSortKey::MimeType),
            _ => None,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            FileSortKey::Url => "url",
            FileSortKey::FileSize => "file_size",
            FileSortKey::CreateTime => "create_time",
            FileSortKey::AccessTime => "access_time",
            FileSortKey::MimeType => "mime_type",
        }
    }
}

/// `conflict` query parameter on `PUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Overwrite,
    Skip,
    Abort,
}

impl ConflictPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overwrite" => Some(ConflictPolicy::Overwrite),
            "skip" => Some(ConflictPolicy::Skip),
            "abort" => Some(ConflictPolicy::Abort),
            _ => None,
        }
    }
}

/// Half-open byte range `[start, end)`; `-1` on `end` means "open".
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        ByteRange { start: 0, end: None }
    }

    pub fn resolve(self, size: u64) -> (u64, u64) {
        let end = self.end.unwrap_or(size).min(size);
        (self.start, end)
    }
}
