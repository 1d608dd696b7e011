//! Cache module - compiled templates and scratch buffers

pub mod buffer_pool;
pub mod template_cache;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use template_cache::{CacheStats, TemplateCache};
