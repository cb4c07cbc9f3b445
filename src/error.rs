//! Error types for the fat binary patch engine.
//!
//! This module covers every failure the engine can report, from file I/O and
//! container parsing through per-site byte patches, code injection and the
//! persisted patch metadata.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for patch operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file '{path}' changed on disk: expected {expected} bytes, found {actual}")]
    FileChanged {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    // ==================== Container Errors ====================
    #[error("malformed fat header: {reason}")]
    HeaderMalformed { reason: String },

    // ==================== Discovery Errors ====================
    #[error("offset discovery unavailable: {reason}")]
    DiscoveryUnavailable { reason: String },

    // ==================== Patch Site Errors ====================
    #[error("site '{name}' at {offset:#x} (+{len}) exceeds file size {file_size:#x}")]
    SiteOutOfBounds {
        name: String,
        offset: u64,
        len: usize,
        file_size: usize,
    },

    #[error("verification failed for '{name}' at {offset:#x}: expected {expected}, read back {actual}")]
    VerificationMismatch {
        name: String,
        offset: u64,
        expected: String,
        actual: String,
    },

    #[error("unexpected bytes for '{name}' at {offset:#x}: expected {expected}, found {actual}")]
    UnexpectedContent {
        name: String,
        offset: u64,
        expected: String,
        actual: String,
    },

    #[error("site '{name}' changes length: original is {original} bytes, replacement is {replacement}")]
    LengthMismatch {
        name: String,
        original: usize,
        replacement: usize,
    },

    #[error("site '{name}' has no replacement bytes")]
    EmptyPatch { name: String },

    #[error("unknown patch name: {0}")]
    UnknownPatch(String),

    #[error("invalid hex string: {value:?}")]
    InvalidHex { value: String },

    #[error("invalid offset: {value:?}")]
    InvalidOffset { value: String },

    #[error("offset {offset:#x} shifted by {shift:+} falls outside the file")]
    OffsetUnderflow { offset: u64, shift: i64 },

    // ==================== Injection Errors ====================
    #[error("injection blobs '{first}' and '{second}' overlap")]
    InjectionOverlap { first: String, second: String },

    #[error("injection blob '{name}' is {size} bytes (max {max})")]
    InjectionSizeExceeded {
        name: String,
        size: usize,
        max: usize,
    },

    #[error("injection blob '{name}' is empty")]
    EmptyInjection { name: String },

    #[error("injection site '{name}' missing from discovery output")]
    MissingInjectionSite { name: &'static str },

    #[error("no compiled payload for injection site '{name}'")]
    MissingPayload { name: &'static str },

    #[error("symbol '{symbol}' not found in compiled artifact")]
    BlobSymbolNotFound { symbol: String },

    #[error("invalid compiled artifact: {reason}")]
    InvalidArtifact { reason: String },

    // ==================== Metadata Errors ====================
    #[error("patch metadata '{path}' is corrupt: {reason}")]
    MetadataCorrupt { path: PathBuf, reason: String },

    // ==================== Hook Errors ====================
    #[error("{stage} step failed: {reason}")]
    Hook { stage: &'static str, reason: String },
}

/// A specialized Result type for patch operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error indicates a recoverable condition.
    ///
    /// Recoverable errors fail a single site or trigger a fallback path; the
    /// session keeps going. Everything else aborts it.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::HeaderMalformed { .. }
                | Error::SiteOutOfBounds { .. }
                | Error::VerificationMismatch { .. }
                | Error::UnexpectedContent { .. }
                | Error::UnknownPatch(_)
                | Error::MetadataCorrupt { .. }
        )
    }

    /// Creates a discovery failure with a formatted reason.
    #[inline]
    pub fn discovery(reason: impl Into<String>) -> Self {
        Error::DiscoveryUnavailable {
            reason: reason.into(),
        }
    }

    /// Creates an out-of-bounds error for a named site.
    #[inline]
    pub fn out_of_bounds(name: &str, offset: u64, len: usize, file_size: usize) -> Self {
        Error::SiteOutOfBounds {
            name: name.to_string(),
            offset,
            len,
            file_size,
        }
    }

    /// Creates a hook failure for the given stage.
    #[inline]
    pub fn hook(stage: &'static str, reason: impl Into<String>) -> Self {
        Error::Hook {
            stage,
            reason: reason.into(),
        }
    }
}
