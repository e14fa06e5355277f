//! Relational schema access: users, files, peer access, per-user size
//! counters and dedup reference counts. Functions here take a borrowed
//! `rusqlite::Connection` and are meant to be composed inside a single
//! [`crate::pool::ConnectionPool`] cursor or transaction — they never
//! acquire cursors themselves.

pub mod files;
pub mod users;
