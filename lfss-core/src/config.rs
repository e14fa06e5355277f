use std::path::PathBuf;

use serde::Deserialize;

/// The single injected configuration object named in the design notes:
/// every tunable (thresholds, pool sizes, DAV on/off...) flows through
/// here rather than through ad hoc env lookups scattered across
/// modules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_home: PathBuf,
    pub external_dir: PathBuf,
    pub blob_large_threshold_bytes: u64,
    pub memory_file_cap_bytes: u64,
    pub stream_chunk_bytes: usize,
    pub reader_pool_size: usize,
    pub webdav_enabled: bool,
    pub debug: bool,
    pub disable_logging: bool,
    pub thumb_size: u32,
    pub thumb_db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_home = PathBuf::from("data");
        Config {
            external_dir: data_home.join("large_blobs"),
            thumb_db_path: data_home.join("thumbs.1.db"),
            data_home,
            blob_large_threshold_bytes: 1024 * 1024,
            memory_file_cap_bytes: 128 * 1024 * 1024,
            stream_chunk_bytes: 1024 * 1024,
            reader_pool_size: 4,
            webdav_enabled: false,
            debug: false,
            disable_logging: false,
            thumb_size: 256,
        }
    }
}

impl Config {
    /// Build from the environment variables named in the external
    /// interfaces: `LFSS_DATA`, `LFSS_LARGE_FILE`, `LFSS_WEBDAV`,
    /// `LFSS_DEBUG`, `DISABLE_LOGGING`.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("LFSS_DATA") {
            cfg.data_home = PathBuf::from(v);
            cfg.external_dir = cfg.data_home.join("large_blobs");
            cfg.thumb_db_path = cfg.data_home.join("thumbs.1.db");
        }
        if let Ok(v) = std::env::var("LFSS_LARGE_FILE") {
            if let Ok(n) = v.parse() {
                cfg.blob_large_threshold_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("LFSS_WEBDAV") {
            cfg.webdav_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("LFSS_DEBUG") {
            cfg.debug = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("DISABLE_LOGGING") {
            cfg.disable_logging = parse_bool(&v);
        }
        cfg
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.data_home.join("index.db")
    }

    pub fn blobs_db_path(&self) -> PathBuf {
        self.data_home.join("blobs.db")
    }

    pub fn lock_db_path(&self) -> PathBuf {
        self.data_home.join("lock.db")
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
