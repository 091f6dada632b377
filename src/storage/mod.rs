//! Storage module for the local final-file tree
//!
//! Serves merged files back by their storage-root-relative path.

mod file_server;
mod types;

pub use file_server::FileServer;
pub use types::*;
