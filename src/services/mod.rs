pub mod cache_writer;
pub mod host;
pub mod notifier;
pub mod persistent_cache;
pub mod scheduler;
pub mod sharing;
