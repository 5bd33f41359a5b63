//! The engine's error taxonomy (§7, §4.10).
//!
//! Distinguishing these cases matters for control flow: `Config` is fatal to
//! the whole process, `HashMismatch`/`Protocol` are fatal to a single release
//! but not the tick, `NotFound` is expected and swallowed at specific call
//! sites, and `Transport` means the retrying HTTP layer already exhausted
//! its attempts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing cursor, malformed configuration. Fatal to the process.
    #[error("configuration error: {0}")]
    Config(String),

    /// The Index returned a shape the adapter didn't expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A downloaded file's MD5 did not match the digest the Index declared.
    #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// A network call failed after the retry policy was exhausted.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    /// The Warehouse reported 404 for a get/delete target.
    #[error("not found")]
    NotFound,

    /// URL-cleaning could not produce a valid URL.
    #[error("could not clean url")]
    UrlClean,

    /// A Store (Redis) operation failed.
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    /// True for errors that should abort only the release/entry in
    /// progress, not the whole tick.
    pub fn is_entry_scoped(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(_) | SyncError::HashMismatch { .. } | SyncError::Transport(_)
        )
    }
}
