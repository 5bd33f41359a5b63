//! C4 — the `WarehouseClient` trait: a get-or-create-or-update primitive
//! over the Project/Version/File object graph.
//!
//! The "get, diff, write-if-dirty" orchestration described in §4.4 lives at
//! the call site (the reconciler), not inside the trait; implementations
//! only need to expose the raw CRUD-ish primitives below.

pub mod rest;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::errors::SyncError;
use crate::model::{FileEntry, Release};

/// Whether a `get_or_create` call found an existing entity or made one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    Yes,
    No,
}

#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Ensures a Project named `name` exists. Idempotent.
    async fn get_or_create_project(&self, name: &str) -> Result<(), SyncError>;

    /// Fetches the current field values for `(project, version)`, sorted
    /// `classifiers` already applied, or `None` if the version does not
    /// exist yet. `show_yanked` controls whether a soft-deleted version is
    /// still returned.
    async fn get_version(
        &self,
        project: &str,
        version: &str,
        show_yanked: bool,
    ) -> Result<Option<Release>, SyncError>;

    /// Creates the version with the given data if it is absent, or writes
    /// back any fields present in `data` that differ from the current
    /// remote state. No-ops if nothing differs and the version already
    /// exists.
    async fn put_version(&self, project: &str, data: &Release) -> Result<Created, SyncError>;

    /// Lists the filenames the Warehouse currently has for this version
    /// (`show_yanked` qualified, per §4.4).
    async fn list_filenames(
        &self,
        project: &str,
        version: &str,
        show_yanked: bool,
    ) -> Result<BTreeSet<String>, SyncError>;

    /// Creates or updates a single file entry, diffing the same way as
    /// [`WarehouseClient::put_version`].
    async fn put_file(
        &self,
        project: &str,
        version: &str,
        file: &FileEntry,
        file_bytes: Option<&[u8]>,
    ) -> Result<Created, SyncError>;

    /// Removes the named files from `(project, version)` in bulk.
    async fn delete_files_by_filename(
        &self,
        project: &str,
        version: &str,
        filenames: &BTreeSet<String>,
    ) -> Result<(), SyncError>;

    /// Removes one file by name. A missing file is not an error.
    async fn delete_file(
        &self,
        project: &str,
        version: &str,
        filename: &str,
    ) -> Result<(), SyncError>;

    /// Cascading delete of a single version. A missing version is not an
    /// error.
    async fn delete_version(&self, project: &str, version: &str) -> Result<(), SyncError>;

    /// Cascading delete of an entire project. A missing project is not an
    /// error.
    async fn delete_project(&self, project: &str) -> Result<(), SyncError>;
}

/// A flat `key -> value` field diff as used by the "diff and write only if
/// dirty" rule in §4.4; values are pre-stringified so adapters don't need
/// to know about [`Release`]'s internal types.
pub(crate) fn diff_fields(
    current: &BTreeMap<String, String>,
    incoming: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    incoming
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
