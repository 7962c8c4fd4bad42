// src/error.rs

use thiserror::Error;

/// Core error types for Burrow
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A remote source could not be synced; other sources are unaffected.
    /// The field is not named `source`: thiserror reserves that name for a
    /// `std::error::Error` cause.
    #[error("Source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// No source carries a manifest for this package name
    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    /// The selected version does not exist in the merged manifest
    #[error("Version not found for {name}: {selector}")]
    VersionNotFound { name: String, selector: String },

    /// The package version matched but has no build for the current platform
    #[error("{name}-{version} has no build for platform {platform}")]
    UnsupportedPlatform {
        name: String,
        version: String,
        platform: String,
    },

    /// Downloaded artifact digest does not match the manifest digest.
    /// Fatal to this fetch; the caller must re-resolve and start over.
    #[error("Corrupt artifact {digest}: expected sha256 {expected}, got {actual}")]
    CorruptArtifact {
        digest: String,
        expected: String,
        actual: String,
    },

    /// State database is inconsistent; no auto-repair is attempted
    #[error("State corruption: {0}")]
    StateCorruption(String),

    /// A digest lock was held past the deadline by another process; retriable
    #[error("Timed out waiting for lock on {digest} after {waited_ms}ms")]
    LockTimeout { digest: String, waited_ms: u64 },

    /// A package reference string could not be parsed
    #[error("Invalid package reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// A manifest failed to parse or violated its schema
    #[error("Invalid manifest for '{name}': {reason}")]
    InvalidManifest { name: String, reason: String },

    /// Network download failure
    #[error("Download error: {0}")]
    Download(String),

    /// Initialization failure (directories, HTTP client, database)
    #[error("Failed to initialize: {0}")]
    InitError(String),
}

/// Result type alias using Burrow's Error type
pub type Result<T> = std::result::Result<T, Error>;
