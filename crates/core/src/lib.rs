//! Tank alarm server decision engine.
//!
//! Pure logic shared by the server binary, the notification dispatcher and the
//! read-only viewer. Nothing in this crate performs network I/O; persistence
//! goes through the [`persist::BlobStore`] trait so the engine can be tested
//! with in-memory storage.
//!
//! - [`schema`] -- the one definition of the sync record, tank record and
//!   viewer summary wire forms.
//! - [`store`] -- bounded, hash-indexed tank record table.
//! - [`ingest`] -- validation and application of inbound sync records.
//! - [`alarm`] -- per-tank debounced alarm state machine.
//! - [`power`] -- supply voltage classification.
//! - [`liveness`] -- persisted heartbeat and peer-down detection.
//! - [`auth`] -- admin PIN comparison and attempt throttling.
//! - [`config`] -- versioned persisted site configuration.
//! - [`server`] -- [`server::ServerCore`], the composition driven by the host loop.

pub mod alarm;
pub mod auth;
pub mod config;
pub mod error;
pub mod hashing;
pub mod ingest;
pub mod liveness;
pub mod persist;
pub mod power;
pub mod scheduling;
pub mod schema;
pub mod server;
pub mod store;
pub mod summary;
pub mod types;
