//! Local-first synchronization core for an infinite-canvas notes app.
//!
//! A [`app::ModeSelector`] picks where the canvas lives (device-local, the
//! user's private remote canvas, or a shared one) and wires a
//! [`usecases::canvas::CanvasStore`] to the matching storage adapter. Remote
//! changes flow through per-collection reconcilers into the store, and store
//! changes are persisted to a two-tier local cache by a debounced writer.

pub mod adapters;
pub mod app;
pub mod config;
pub mod dto;
pub mod error;
pub mod models;
pub mod realtime;
pub mod repositories;
pub mod services;
pub mod telemetry;
pub mod usecases;

pub use error::{SyncError, SyncResult};
