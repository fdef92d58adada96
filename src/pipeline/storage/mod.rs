// Pipeline storage: cached canonical tables

pub mod cache;

pub use cache::{CacheKey, InMemoryMetricsCache, InvalidationPolicy, MetricsCache, SqliteMetricsCache};
