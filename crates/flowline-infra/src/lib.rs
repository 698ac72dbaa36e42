//! Infrastructure layer for Flowline.
//!
//! Contains implementations of the ports defined in `flowline-core`: SQLite
//! storage for every engine record, the `config.toml` loader and data
//! directory resolution, the HTTP node executor plugin, and HMAC trigger
//! signature verification.

pub mod config;
pub mod executor;
pub mod signature;
pub mod sqlite;
