pub mod backend;
pub mod connectivity;
pub mod reconciler;
pub mod subscription;
