//! restream Daemon Library
//!
//! Core functionality for the restream daemon:
//! - Relay lifecycle management for ffmpeg processes
//! - Upload persistence
//! - HTTP API for clients

pub mod relay;
pub mod server;
pub mod upload;
