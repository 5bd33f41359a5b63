//! C3 — the `IndexClient` trait and the raw wire types it returns.
//!
//! Raw records are kept deliberately loose (`RawRelease` is close to "the
//! JSON/XML-RPC struct, typed") because normalization (`normalize.rs`,
//! `model.rs::Release`) is a separate, pure step performed by the
//! reconciler. Keeping them separate means the normalizer can be
//! unit-tested without any adapter in the loop.

pub mod xmlrpc;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SyncError;

/// One entry from the Index's changelog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogEntry {
    pub name: String,
    pub version: Option<String>,
    pub timestamp: i64,
    pub action: String,
}

/// A single file descriptor as returned by `release_urls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub url: String,
    pub filename: String,
    pub packagetype: String,
    pub python_version: String,
    pub comment_text: String,
    pub md5_digest: String,
    pub upload_time: Option<String>,
    pub size: u64,
    pub has_sig: bool,
}

/// The raw, not-yet-normalized shape of a single release record as reported
/// by `release_data`. String values here may still contain `"UNKNOWN"` /
/// `"None"` placeholders; scalar-or-sequence fields are still untyped.
#[derive(Debug, Clone, Default)]
pub struct RawRelease {
    pub fields: HashMap<String, RawValue>,
}

impl RawRelease {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(RawValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[RawValue]> {
        match self.fields.get(key) {
            Some(RawValue::List(items)) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.fields.get(key)
    }
}

/// A dynamically-typed raw field value, loose enough to represent both the
/// JSON encoding used in tests/mocks and the XML-RPC encoding used by the
/// production adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Str(String),
    List(Vec<RawValue>),
    Map(HashMap<String, RawValue>),
    Int(i64),
    Bool(bool),
    Null,
}

impl RawValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// C3 — paginated, resilient access to the Index's RPC surface.
///
/// Implementors are expected to retry transient transport failures
/// internally (§5) so that callers only ever see [`SyncError::Protocol`],
/// [`SyncError::HashMismatch`], or a [`SyncError::Transport`] that has
/// already exhausted its retry budget.
#[async_trait]
pub trait IndexClient: Send + Sync {
    async fn list_packages(&self) -> Result<Vec<String>, SyncError>;

    async fn changelog(&self, since_epoch: i64) -> Result<Vec<ChangelogEntry>, SyncError>;

    async fn package_releases(
        &self,
        name: &str,
        show_hidden: bool,
    ) -> Result<Vec<String>, SyncError>;

    /// `None` when the Index has no data for this (name, version) pair —
    /// the reconciler skips these, it is not an error.
    async fn release_data(&self, name: &str, version: &str) -> Result<Option<RawRelease>, SyncError>;

    async fn release_urls(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Vec<FileDescriptor>, SyncError>;

    /// Downloads the file body and verifies its MD5 against
    /// `descriptor.md5_digest`, returning [`SyncError::HashMismatch`] on a
    /// mismatch.
    async fn fetch_file(&self, descriptor: &FileDescriptor) -> Result<Vec<u8>, SyncError>;
}

pub(crate) fn parse_upload_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
