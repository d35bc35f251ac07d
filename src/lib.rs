//! coursemedia - course media storage on S3-compatible object storage
//!
//! coursemedia maps logical media names (`"avatars/7.png"`) to objects under a
//! configurable root prefix and provides:
//! - One-shot saves and streamed multipart uploads
//! - Lazily downloaded read handles
//! - Presigned or custom-domain URLs
//! - A preloaded metadata cache for exists/size lookups
//! - A small HTTP API over the gateway

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod media;
pub mod storage;

pub use error::{Error, Result};
