//! Request guards for admin routes.
//!
//! - [`local::LocalAdmin`] -- Requires the peer to be on a local network.

pub mod local;
