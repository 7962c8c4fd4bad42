// src/lib.rs

//! Burrow Toolchain Manager
//!
//! Manages per-project isolated toolchains: named package references are
//! resolved against an overlay of manifest sources, built artifacts are
//! fetched into a content-addressed cache exactly once, and installed
//! package state is persisted durably in SQLite.
//!
//! # Architecture
//!
//! - Source overlay: ordered manifest providers merged with shadowing,
//!   refreshed on a TTL or forced basis
//! - Resolver: pure (reference, overlay, platform) -> resolved package
//! - Cache: content-addressed store with cross-process digest locks,
//!   at-most-one concurrent fetch per artifact
//! - State store: transactional record of installed packages per environment
//! - Upgrade protocol: advances channel-pinned installations, including the
//!   tool's own self-update

pub mod cache;
mod error;
pub mod manifest;
pub mod platform;
pub mod resolver;
pub mod sources;
pub mod state;
pub mod upgrade;

pub use error::{Error, Result};
