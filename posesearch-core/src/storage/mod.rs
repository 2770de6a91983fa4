//! Persisted search indexes.
//!
//! This module provides:
//! - the framed blob codec (magic, version, crc32, length, json payload)
//! - cache backends behind the [`CacheStore`] trait

pub mod cache;
pub mod codec;

pub use cache::{CacheStore, FileCache, MemoryCache};
pub use codec::{decode, encode};
