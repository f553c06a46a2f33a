//! SQLite-backed persistent cache for generations and their entries.
//!
//! This module provides the storage layer underneath the `Store` and
//! `GenerationRegistry` abstractions, using SQLite with async access via
//! tokio-rusqlite. It supports:
//!
//! - Named generations with cascading deletion of their entries
//! - Request-addressed entries using SHA-256 hashing of the request key
//! - Automatic schema migrations
//! - WAL mode for concurrent access

pub mod connection;
pub mod entries;
pub mod generations;
pub mod key;
pub mod migrations;

pub use crate::Error;

pub use connection::CacheDb;
pub use entries::{CacheEntry, ResponseSnapshot, ResponseType};
pub use generations::Generation;
pub use key::RequestKey;
