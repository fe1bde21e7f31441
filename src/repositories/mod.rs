pub mod cache;
pub mod fallback;
