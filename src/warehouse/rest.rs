//! A5 — concrete `WarehouseClient` over the Warehouse's REST object graph.
//!
//! There is no dedicated upsert endpoint; `get_or_create` (per §4.4.1) is
//! client-side orchestration: GET the current resource, and either POST a
//! new one on 404 or PATCH only the fields that differ. This mirrors how
//! the registry clients in `registries/crates_io.rs` and `registries/npm.rs`
//! treat "fetch, then act on the JSON shape" as plain client logic rather
//! than something a library should hide.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::warn;

use super::{diff_fields, Created, WarehouseClient};
use crate::errors::SyncError;
use crate::model::{FileEntry, Release};
use crate::retry::RetryingClient;

pub struct RestWarehouseClient {
    http: Arc<RetryingClient>,
    base_url: String,
    username: String,
    password: String,
}

impl RestWarehouseClient {
    pub fn new(
        http: Arc<RetryingClient>,
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    fn project_url(&self, project: &str) -> String {
        format!("{}/projects/{}", self.base_url, project)
    }

    fn version_url(&self, project: &str, version: &str) -> String {
        format!("{}/projects/{}/versions/{}", self.base_url, project, version)
    }

    fn files_url(&self, project: &str, version: &str) -> String {
        format!("{}/files", self.version_url(project, version))
    }

    fn file_url(&self, project: &str, version: &str, filename: &str) -> String {
        format!("{}/{}", self.files_url(project, version), filename)
    }
}

async fn expect_success(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, SyncError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(SyncError::NotFound);
    }
    if !response.status().is_success() {
        return Err(SyncError::Protocol(format!(
            "warehouse returned {} for {context}",
            response.status()
        )));
    }
    Ok(response)
}

#[async_trait]
impl WarehouseClient for RestWarehouseClient {
    async fn get_or_create_project(&self, name: &str) -> Result<(), SyncError> {
        let response = self
            .http
            .client()
            .get(self.project_url(name))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            let created = self
                .http
                .client()
                .post(format!("{}/projects", self.base_url))
                .basic_auth(&self.username, Some(&self.password))
                .json(&json!({ "name": name }))
                .send()
                .await
                .map_err(SyncError::Transport)?;
            expect_success(created, "project creation").await?;
            return Ok(());
        }

        expect_success(response, "project lookup").await.map(|_| ())
    }

    async fn get_version(
        &self,
        project: &str,
        version: &str,
        show_yanked: bool,
    ) -> Result<Option<Release>, SyncError> {
        let response = self
            .http
            .client()
            .get(self.version_url(project, version))
            .query(&[("show_yanked", show_yanked.to_string())])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = expect_success(response, "version lookup").await?;
        let mut release: Release = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid version json: {e}")))?;
        release.classifiers.sort();
        Ok(Some(release))
    }

    async fn put_version(&self, project: &str, data: &Release) -> Result<Created, SyncError> {
        let mut sorted = data.clone();
        sorted.classifiers.sort();

        match self.get_version(project, &sorted.version, true).await? {
            None => {
                let response = self
                    .http
                    .client()
                    .post(format!("{}/versions", self.project_url(project)))
                    .basic_auth(&self.username, Some(&self.password))
                    .json(&sorted)
                    .send()
                    .await
                    .map_err(SyncError::Transport)?;
                expect_success(response, "version creation").await?;
                Ok(Created::Yes)
            }
            Some(current) => {
                let diff = diff_fields(&release_fields(&current), &release_fields(&sorted));
                if diff.is_empty() {
                    return Ok(Created::No);
                }
                let response = self
                    .http
                    .client()
                    .patch(self.version_url(project, &sorted.version))
                    .basic_auth(&self.username, Some(&self.password))
                    .json(&sorted)
                    .send()
                    .await
                    .map_err(SyncError::Transport)?;
                expect_success(response, "version update").await?;
                Ok(Created::No)
            }
        }
    }

    async fn list_filenames(
        &self,
        project: &str,
        version: &str,
        show_yanked: bool,
    ) -> Result<BTreeSet<String>, SyncError> {
        let response = self
            .http
            .client()
            .get(self.files_url(project, version))
            .query(&[("show_yanked", show_yanked.to_string())])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(BTreeSet::new());
        }

        let response = expect_success(response, "file listing").await?;
        let files: Vec<FileEntry> = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid file list json: {e}")))?;
        Ok(files.into_iter().map(|f| f.filename).collect())
    }

    async fn put_file(
        &self,
        project: &str,
        version: &str,
        file: &FileEntry,
        file_bytes: Option<&[u8]>,
    ) -> Result<Created, SyncError> {
        let existing = self
            .http
            .client()
            .get(self.file_url(project, version, &file.filename))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;

        let body = json!({
            "filename": file.filename,
            "packagetype": file.packagetype,
            "python_version": file.python_version,
            "upload_time": file.upload_time,
            "comment": file.comment,
            "filesize": file.filesize,
            "md5_digest": file.md5_digest,
            "sha256_digest": file.sha256_digest,
            "content": file_bytes.map(|b| base64_encode(b)),
        });

        if existing.status() == StatusCode::NOT_FOUND {
            let response = self
                .http
                .client()
                .post(self.files_url(project, version))
                .basic_auth(&self.username, Some(&self.password))
                .json(&body)
                .send()
                .await
                .map_err(SyncError::Transport)?;
            expect_success(response, "file creation").await?;
            return Ok(Created::Yes);
        }

        let existing = expect_success(existing, "file lookup").await?;
        let current: FileEntry = existing
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid file json: {e}")))?;

        if &current == file {
            return Ok(Created::No);
        }

        let response = self
            .http
            .client()
            .patch(self.file_url(project, version, &file.filename))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(SyncError::Transport)?;
        expect_success(response, "file update").await?;
        Ok(Created::No)
    }

    async fn delete_files_by_filename(
        &self,
        project: &str,
        version: &str,
        filenames: &BTreeSet<String>,
    ) -> Result<(), SyncError> {
        for filename in filenames {
            self.delete_file(project, version, filename).await?;
        }
        Ok(())
    }

    async fn delete_file(
        &self,
        project: &str,
        version: &str,
        filename: &str,
    ) -> Result<(), SyncError> {
        let response = self
            .http
            .client()
            .delete(self.file_url(project, version, filename))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;

        match expect_success(response, "file deletion").await {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound) => {
                warn!(project, version, filename, "file already absent on delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_version(&self, project: &str, version: &str) -> Result<(), SyncError> {
        let response = self
            .http
            .client()
            .delete(self.version_url(project, version))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;

        match expect_success(response, "version deletion").await {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound) => {
                warn!(project, version, "version already absent on delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_project(&self, project: &str) -> Result<(), SyncError> {
        let response = self
            .http
            .client()
            .delete(self.project_url(project))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(SyncError::Transport)?;

        match expect_success(response, "project deletion").await {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound) => {
                warn!(project, "project already absent on delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Flattens the scalar/sequence fields of a [`Release`] (files excluded,
/// those are diffed separately) into stable strings for the §4.4
/// "write back only the fields that changed" comparison.
fn release_fields(release: &Release) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("summary".to_string(), release.summary.clone());
    fields.insert("description".to_string(), release.description.clone());
    fields.insert("license".to_string(), release.license.clone());
    fields.insert("author".to_string(), release.author.clone());
    fields.insert("author_email".to_string(), release.author_email.clone());
    fields.insert("maintainer".to_string(), release.maintainer.clone());
    fields.insert(
        "maintainer_email".to_string(),
        release.maintainer_email.clone(),
    );
    fields.insert(
        "classifiers".to_string(),
        release.classifiers.join(","),
    );
    fields.insert(
        "requires_python".to_string(),
        release.requires_python.clone(),
    );
    fields.insert("keywords".to_string(), release.keywords.join(","));
    fields.insert("yanked".to_string(), release.yanked.to_string());
    fields
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
