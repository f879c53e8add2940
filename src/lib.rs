#![deny(missing_docs)]
//! tg-siphon library.
//!
//! Continuously ingests messages from a single Telegram channel, persists
//! attached media and text locally, and offloads finished artifacts to a
//! remote destination through an external transfer tool.

/// Local artifact writing (media files and text sidecars).
pub mod artifact;
/// Historical message replay.
pub mod backfill;
/// Configuration management.
pub mod config;
/// Message classification and routing.
pub mod dispatch;
/// Durable progress tracking and the failure audit log.
pub mod progress;
/// Target chat specifier parsing and resolution.
pub mod resolve;
/// Message source interface and message model.
pub mod source;
/// Telegram Bot API message source adapter.
pub mod telegram;
/// Remote transfer tool interface.
pub mod transfer;
/// Upload queue and worker pool.
pub mod uploader;
