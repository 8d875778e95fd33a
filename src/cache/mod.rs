//! Offline caching layer.
//!
//! This module provides:
//! - Named cache generations persisted in SQLite
//! - Cache-first fetching for static assets
//! - Network-first fetching with cache and offline-document fallback

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::SqliteStorage;
pub use traits::CacheStorage;
