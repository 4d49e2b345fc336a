//! In-memory caching for derived per-user data.
//!
//! This module provides:
//! - A bounded, thread-safe LRU cache
//! - The orchestration policy deciding hits, misses and invalidation for
//!   active currencies and period reports
//! - Write-time invalidation when a new spending lands inside a cached window

mod lru;
mod orchestrator;
mod traits;

pub use lru::LruCache;
pub use orchestrator::CacheOrchestrator;
pub use traits::{CacheResult, CacheSource, CachedValue, ReportLookup};
