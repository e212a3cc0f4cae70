//! Durable storage for the server's config and heartbeat blobs.

pub mod file_store;

pub use file_store::{FileBlobStore, FileStoreError};
