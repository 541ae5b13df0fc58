//! snapstore - client for the snap distribution service
//!
//! Talks to the store's HTTP APIs: snap discovery and info, batched
//! install/refresh planning, resumable hash-verified downloads (with binary
//! deltas), assertion retrieval and commerce. Authentication runs over two
//! independent macaroon layers (user and device session) that are refreshed
//! transparently when the store signals expiry.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod store;
pub mod types;

pub use crate::config::Config;
pub use crate::store::error::{SnapActionError, StoreError};
pub use crate::store::Store;

/// User-Agent sent on every store request.
pub const USER_AGENT: &str = concat!("snapstore/", env!("CARGO_PKG_VERSION"));

/// Protocol level spoken on the v1 endpoints. History:
///  - "1": client supports squashfs snaps
pub const WIRE_PROTOCOL: &str = "1";
