//! C7 — `ReleaseReconciler`: turns one dispatched changelog action into
//! concrete Warehouse/Store writes.
//!
//! `update` and `delete` are the only two entry points the engine calls
//! (§4.7); everything else here is plumbing private to making those two
//! algorithms read the way the original source's `Processor.update`/
//! `Processor.delete` do.

use std::collections::BTreeSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::errors::SyncError;
use crate::fingerprint::fingerprint;
use crate::index::{parse_upload_time, FileDescriptor, IndexClient};
use crate::model::FileEntry;
use crate::normalize::build_release;
use crate::store::Store;
use crate::warehouse::WarehouseClient;

pub struct ReleaseReconciler {
    index: Arc<dyn IndexClient>,
    warehouse: Arc<dyn WarehouseClient>,
    store: Arc<dyn Store>,
}

fn fingerprint_key(name: &str, version: &str) -> String {
    format!("pypi:process:{name}:{version}")
}

fn fingerprint_glob(name: &str) -> String {
    format!("pypi:process:{name}:*")
}

impl ReleaseReconciler {
    pub fn new(
        index: Arc<dyn IndexClient>,
        warehouse: Arc<dyn WarehouseClient>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            index,
            warehouse,
            store,
        }
    }

    /// §4.7 `update`. `version` narrows to a single release; `None` means
    /// every version the Index currently reports for `name`.
    ///
    /// The two shapes fail differently (§7, S3 vs S6): when `version` is
    /// `Some`, the changelog entry IS that one release, so a failure
    /// syncing it is the entry's failure and propagates to the caller (the
    /// engine then withholds the changelog marker, so the next tick
    /// retries). When `version` is `None`, the entry enumerates every
    /// release the Index reports for `name`; one release failing there
    /// must not stop the rest (§4.7 step 3 is a plain per-release loop), so
    /// failures are logged and that release alone is skipped.
    pub async fn update(&self, name: &str, version: Option<&str>) -> Result<(), SyncError> {
        self.warehouse.get_or_create_project(name).await?;

        match version {
            Some(v) => self.sync_target(name, v).await,
            None => {
                for version in self.index.package_releases(name, true).await? {
                    if let Err(err) = self.sync_target(name, &version).await {
                        error!(name, version, error = %err, "release sync failed, skipping");
                    }
                }
                Ok(())
            }
        }
    }

    /// A version containing `/` is a skip, not a failure (§3/S3): it is
    /// logged and the marker is still written for the enclosing entry.
    async fn sync_target(&self, name: &str, version: &str) -> Result<(), SyncError> {
        if version.contains('/') {
            warn!(name, version, "skipping version containing '/'");
            return Ok(());
        }
        self.sync_one_release(name, version).await
    }

    async fn sync_one_release(&self, name: &str, version: &str) -> Result<(), SyncError> {
        let Some(raw) = self.index.release_data(name, version).await? else {
            return Ok(());
        };

        let descriptors = self.index.release_urls(name, version).await?;
        let mut files = Vec::with_capacity(descriptors.len());
        let mut bodies = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let bytes = self.index.fetch_file(descriptor).await?;
            files.push(self.build_file_entry(descriptor, &bytes));
            bodies.push(bytes);
        }

        let release = build_release(name, version, &raw, files);
        let fp = fingerprint(&release);

        let key = fingerprint_key(name, version);
        if self.store.get(&key).await? == Some(fp.clone()) {
            info!(name, version, "skipping unchanged release");
            return Ok(());
        }

        info!(name, version, "syncing release");
        self.warehouse.put_version(name, &release).await?;
        self.reconcile_files(name, version, &release.files, &bodies)
            .await?;

        self.store.set(&key, &fp).await?;
        Ok(())
    }

    fn build_file_entry(&self, descriptor: &FileDescriptor, bytes: &[u8]) -> FileEntry {
        let sha256 = hex::encode(Sha256::digest(bytes));
        FileEntry {
            filename: descriptor.filename.clone(),
            packagetype: descriptor.packagetype.clone(),
            python_version: descriptor.python_version.clone(),
            upload_time: parse_upload_time(descriptor.upload_time.as_deref()),
            comment: descriptor.comment_text.clone(),
            filesize: descriptor.size,
            md5_digest: descriptor.md5_digest.clone(),
            sha256_digest: sha256,
            yanked: false,
        }
    }

    /// Deletes filenames no longer present BEFORE upserting the current
    /// set, so a filename re-upload with different content is never
    /// blocked by a stale unique-constraint row (§4.7d).
    async fn reconcile_files(
        &self,
        name: &str,
        version: &str,
        files: &[FileEntry],
        bodies: &[Vec<u8>],
    ) -> Result<(), SyncError> {
        let local: BTreeSet<String> = files.iter().map(|f| f.filename.clone()).collect();
        let remote = self.warehouse.list_filenames(name, version, true).await?;
        let deleted: BTreeSet<String> = remote.difference(&local).cloned().collect();

        if !deleted.is_empty() {
            for filename in &deleted {
                info!(name, version, filename, "deleting file");
            }
            self.warehouse
                .delete_files_by_filename(name, version, &deleted)
                .await?;
        }

        for (file, body) in files.iter().zip(bodies) {
            self.warehouse
                .put_file(name, version, file, Some(body.as_slice()))
                .await?;
        }

        Ok(())
    }

    /// §4.7 `delete`. `action` is the raw changelog action string;
    /// `filename` is `Some` only for `"remove file <name>"` actions.
    pub async fn delete(
        &self,
        name: &str,
        version: Option<&str>,
        action: &str,
        filename: Option<&str>,
    ) -> Result<(), SyncError> {
        if let Some(filename) = filename {
            let Some(version) = version else {
                return Err(SyncError::Protocol(
                    "remove file action without a version".to_string(),
                ));
            };
            info!(name, version, filename, "deleting file");
            return self.warehouse.delete_file(name, version, filename).await;
        }

        if action != "remove" {
            return Err(SyncError::Protocol(format!(
                "unknown action passed to delete(): {action}"
            )));
        }

        match version {
            None => {
                info!(name, "deleting project");
                self.warehouse.delete_project(name).await?;
                for key in self.store.keys(&fingerprint_glob(name)).await? {
                    self.store.delete(&key).await?;
                }
            }
            Some(version) => {
                info!(name, version, "deleting version");
                self.warehouse.delete_version(name, version).await?;
                self.store.delete(&fingerprint_key(name, version)).await?;
            }
        }

        Ok(())
    }
}
