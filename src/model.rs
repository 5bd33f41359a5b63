//! The engine's internal data model: Release, File, and the small value
//! types each one is built from.
//!
//! These types are deliberately explicit structs rather than a scraped
//! "every non-underscore attribute" bag — the underscore convention the
//! Index itself uses is a wire-format artifact, not a semantic boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single `name (predicate) ; marker` dependency entry, parsed from the
/// Index's flattened string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub name: String,
    pub version: String,
    pub environment: String,
}

/// A single uploaded distribution attached to a Release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub packagetype: String,
    pub python_version: String,
    pub upload_time: Option<DateTime<Utc>>,
    pub comment: String,
    pub filesize: u64,
    pub md5_digest: String,
    pub sha256_digest: String,
    /// Always false on write; observed from the Warehouse but never treated
    /// as drift.
    pub yanked: bool,
}

impl FileEntry {
    /// The subset of fields the fingerprint is computed over, as
    /// `[key, value]` pairs. Order here does not matter — the canonical
    /// serializer re-sorts every level by key.
    pub(crate) fn fingerprint_fields(&self) -> Vec<(&'static str, FpValue)> {
        vec![
            ("filename", FpValue::Str(self.filename.clone())),
            ("packagetype", FpValue::Str(self.packagetype.clone())),
            ("python_version", FpValue::Str(self.python_version.clone())),
            (
                "upload_time",
                match &self.upload_time {
                    Some(ts) => FpValue::Str(ts.to_rfc3339()),
                    None => FpValue::Null,
                },
            ),
            ("comment", FpValue::Str(self.comment.clone())),
            ("filesize", FpValue::Int(self.filesize as i64)),
            ("md5", FpValue::Str(self.md5_digest.clone())),
            ("sha256", FpValue::Str(self.sha256_digest.clone())),
        ]
    }
}

/// A named point in a Project's history ("Version" in the Warehouse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub version: String,
    pub summary: String,
    pub description: String,
    pub license: String,
    pub author: String,
    pub author_email: String,
    pub maintainer: String,
    pub maintainer_email: String,
    /// Deduplicated, lexicographically sorted.
    pub classifiers: Vec<String>,
    /// label -> cleaned URI.
    pub uris: BTreeMap<String, String>,
    pub requires_python: String,
    pub requires_external: Vec<String>,
    pub platforms: Vec<String>,
    pub supported_platforms: Vec<String>,
    pub keywords: Vec<String>,
    pub requires: Vec<RequirementSpec>,
    pub provides: Vec<RequirementSpec>,
    pub obsoletes: Vec<RequirementSpec>,
    /// Guessed as the minimum `upload_time` across files; absent if the
    /// release has no files yet.
    pub created: Option<DateTime<Utc>>,
    /// Always false on write.
    pub yanked: bool,
    pub files: Vec<FileEntry>,
}

/// A value in the canonical fingerprint tree. Kept separate from
/// `serde_json::Value` so that its ordering is fully under our control.
#[derive(Debug, Clone)]
pub(crate) enum FpValue {
    Null,
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<FpValue>),
    Map(Vec<(String, FpValue)>),
}
