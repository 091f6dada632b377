//! Chunked Upload Module
//!
//! Resumable uploads with content-hash deduplication:
//! - Chunks are stored per `fileId` and may arrive in any order
//! - The arrival that completes a session triggers the merge
//! - A sidecar record next to each final file makes its content hash
//!   discoverable, so identical content is never stored twice
//!
//! Flow:
//! 1. Client optionally asks whether a content hash is already stored
//! 2. Client sends chunks (re-sending is harmless)
//! 3. Server merges once every chunk is present and returns the public URL

pub mod chunk_store;
pub mod coordinator;
pub mod deduplication;
pub mod locks;
pub mod merge;
pub mod metadata;
pub mod types;

pub use chunk_store::{validate_file_id, ChunkStore};
pub use coordinator::UploadCoordinator;
pub use deduplication::DedupIndex;
pub use locks::{SessionGuard, SessionLocks};
pub use merge::{MergeEngine, MergeRequest};
pub use types::*;
