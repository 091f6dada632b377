//! Stash Server Library
//!
//! Resumable chunked uploads with content-hash deduplication, served from a
//! local storage tree. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: chunk storage, deduplication, merging and the upload coordinator
//! - `storage`: serving finalized files back
//! - `routes`: HTTP surface

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
