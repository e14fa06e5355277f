pub mod blob;
pub mod config;
pub mod debounce;
pub mod directory;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metadata;
pub mod path;
pub mod permission;
pub mod pool;
pub mod schema;
pub mod types;
pub mod user;
pub mod webdav;

pub use config::Config;
pub use engine::Engine;
pub use error::{LfssError, LfssResult};
