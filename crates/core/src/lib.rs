//! Core types and shared functionality for shelf.
//!
//! This crate provides:
//! - Persistent generation/entry cache with SQLite backend
//! - `Store` and `GenerationRegistry` abstractions over it
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod store;

pub use cache::{CacheDb, CacheEntry, Generation, RequestKey, ResponseSnapshot, ResponseType};
pub use config::{AppConfig, ConfigError, DynamicEndpoint};
pub use error::Error;
pub use store::{DeletionReport, GenerationRegistry, SqliteRegistry, SqliteStore, Store};
