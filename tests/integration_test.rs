//! Black-box scenarios for the sync engine, exercised end-to-end through
//! [`Engine::tick`] against fake [`IndexClient`]/[`WarehouseClient`]
//! implementations — no real network or Redis involved. These correspond to
//! the worked scenarios S1, S2, S4, S5, and S6: an empty changelog tick, a
//! release composed from several changelog actions, a no-op re-sync of an
//! unchanged release, a removed file reconciled before the rest, and an
//! MD5 mismatch that leaves no trace and retries on the next tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use warehouse_sync::engine::Engine;
use warehouse_sync::errors::SyncError;
use warehouse_sync::index::{ChangelogEntry, FileDescriptor, IndexClient, RawRelease, RawValue};
use warehouse_sync::model::{FileEntry, Release};
use warehouse_sync::store::{InMemoryStore, Store};
use warehouse_sync::warehouse::{Created, WarehouseClient};

/// A scripted index: a fixed changelog plus a table of release data, file
/// descriptors, and file bodies keyed by (name, version)/filename.
#[derive(Default)]
struct ScriptedIndex {
    changelog: Vec<ChangelogEntry>,
    releases: Mutex<BTreeMap<(String, String), RawRelease>>,
    urls: Mutex<BTreeMap<(String, String), Vec<FileDescriptor>>>,
    bodies: Mutex<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl IndexClient for ScriptedIndex {
    async fn list_packages(&self) -> Result<Vec<String>, SyncError> {
        Ok(vec![])
    }

    async fn changelog(&self, _since_epoch: i64) -> Result<Vec<ChangelogEntry>, SyncError> {
        Ok(self.changelog.clone())
    }

    async fn package_releases(&self, _name: &str, _show_hidden: bool) -> Result<Vec<String>, SyncError> {
        Ok(vec![])
    }

    async fn release_data(&self, name: &str, version: &str) -> Result<Option<RawRelease>, SyncError> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .get(&(name.to_string(), version.to_string()))
            .cloned())
    }

    async fn release_urls(&self, name: &str, version: &str) -> Result<Vec<FileDescriptor>, SyncError> {
        Ok(self
            .urls
            .lock()
            .unwrap()
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_file(&self, descriptor: &FileDescriptor) -> Result<Vec<u8>, SyncError> {
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(&descriptor.filename)
            .cloned()
            .unwrap_or_default();

        let actual = format!("{:x}", md5::compute(&body));
        if actual != descriptor.md5_digest {
            return Err(SyncError::HashMismatch {
                url: descriptor.url.clone(),
                expected: descriptor.md5_digest.clone(),
                actual,
            });
        }
        Ok(body)
    }
}

/// An in-process stand-in for the Warehouse's object graph, good enough to
/// assert against without a real REST server.
#[derive(Default)]
struct FakeWarehouse {
    projects: Mutex<BTreeSet<String>>,
    versions: Mutex<BTreeMap<(String, String), Release>>,
    files: Mutex<BTreeMap<(String, String), BTreeMap<String, FileEntry>>>,
    put_version_calls: Mutex<u32>,
    put_file_calls: Mutex<u32>,
}

#[async_trait]
impl WarehouseClient for FakeWarehouse {
    async fn get_or_create_project(&self, name: &str) -> Result<(), SyncError> {
        self.projects.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn get_version(
        &self,
        project: &str,
        version: &str,
        _show_yanked: bool,
    ) -> Result<Option<Release>, SyncError> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(&(project.to_string(), version.to_string()))
            .cloned())
    }

    async fn put_version(&self, project: &str, data: &Release) -> Result<Created, SyncError> {
        *self.put_version_calls.lock().unwrap() += 1;
        let key = (project.to_string(), data.version.clone());
        let created = !self.versions.lock().unwrap().contains_key(&key);
        self.versions.lock().unwrap().insert(key, data.clone());
        Ok(if created { Created::Yes } else { Created::No })
    }

    async fn list_filenames(
        &self,
        project: &str,
        version: &str,
        _show_yanked: bool,
    ) -> Result<BTreeSet<String>, SyncError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(project.to_string(), version.to_string()))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_file(
        &self,
        project: &str,
        version: &str,
        file: &FileEntry,
        _file_bytes: Option<&[u8]>,
    ) -> Result<Created, SyncError> {
        *self.put_file_calls.lock().unwrap() += 1;
        let key = (project.to_string(), version.to_string());
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(key).or_default();
        let created = !entry.contains_key(&file.filename);
        entry.insert(file.filename.clone(), file.clone());
        Ok(if created { Created::Yes } else { Created::No })
    }

    async fn delete_files_by_filename(
        &self,
        project: &str,
        version: &str,
        filenames: &BTreeSet<String>,
    ) -> Result<(), SyncError> {
        let key = (project.to_string(), version.to_string());
        if let Some(entry) = self.files.lock().unwrap().get_mut(&key) {
            for filename in filenames {
                entry.remove(filename);
            }
        }
        Ok(())
    }

    async fn delete_file(&self, project: &str, version: &str, filename: &str) -> Result<(), SyncError> {
        let key = (project.to_string(), version.to_string());
        if let Some(entry) = self.files.lock().unwrap().get_mut(&key) {
            entry.remove(filename);
        }
        Ok(())
    }

    async fn delete_version(&self, project: &str, version: &str) -> Result<(), SyncError> {
        self.versions
            .lock()
            .unwrap()
            .remove(&(project.to_string(), version.to_string()));
        self.files
            .lock()
            .unwrap()
            .remove(&(project.to_string(), version.to_string()));
        Ok(())
    }

    async fn delete_project(&self, project: &str) -> Result<(), SyncError> {
        self.projects.lock().unwrap().remove(project);
        self.versions.lock().unwrap().retain(|(p, _), _| p != project);
        self.files.lock().unwrap().retain(|(p, _), _| p != project);
        Ok(())
    }
}

fn descriptor(filename: &str, md5_digest: &str) -> FileDescriptor {
    FileDescriptor {
        url: format!("https://files.example/{filename}"),
        filename: filename.to_string(),
        packagetype: "sdist".to_string(),
        python_version: "source".to_string(),
        comment_text: String::new(),
        md5_digest: md5_digest.to_string(),
        upload_time: Some("2021-01-01T00:00:00".to_string()),
        size: 3,
        has_sig: false,
    }
}

/// S1: an empty changelog advances the cursor and touches nothing else.
#[tokio::test]
async fn s1_empty_changelog_only_advances_the_cursor() {
    let index = Arc::new(ScriptedIndex::default());
    let warehouse = Arc::new(FakeWarehouse::default());
    let store = Arc::new(InMemoryStore::new());
    store.set("pypi:since", "1000000000.0").await.unwrap();

    let engine = Engine::new(index, warehouse.clone(), store.clone());
    engine.tick(1_000_000_100).await.unwrap();

    assert_eq!(
        store.get("pypi:since").await.unwrap(),
        Some("1000000100".to_string())
    );
    assert!(warehouse.projects.lock().unwrap().is_empty());
}

/// S2: create, new release, add file compose into one reconciled release.
#[tokio::test]
async fn s2_create_then_new_release_then_add_file_composes() {
    let body = b"abc".to_vec();
    let md5_hex = format!("{:x}", md5::compute(&body));

    let index = Arc::new(ScriptedIndex {
        changelog: vec![
            ChangelogEntry {
                name: "foo".into(),
                version: None,
                timestamp: 10,
                action: "create".into(),
            },
            ChangelogEntry {
                name: "foo".into(),
                version: Some("1.0".into()),
                timestamp: 20,
                action: "new release".into(),
            },
            ChangelogEntry {
                name: "foo".into(),
                version: Some("1.0".into()),
                timestamp: 30,
                action: "add sdist file foo-1.0.tar.gz".into(),
            },
        ],
        ..Default::default()
    });
    index.releases.lock().unwrap().insert(
        ("foo".to_string(), "1.0".to_string()),
        RawRelease {
            fields: [(
                "classifiers".to_string(),
                RawValue::List(vec![
                    RawValue::Str("B".into()),
                    RawValue::Str("A".into()),
                    RawValue::Str("A".into()),
                ]),
            )]
            .into_iter()
            .collect(),
        },
    );
    index.urls.lock().unwrap().insert(
        ("foo".to_string(), "1.0".to_string()),
        vec![descriptor("foo-1.0.tar.gz", &md5_hex)],
    );
    index.bodies.lock().unwrap().insert("foo-1.0.tar.gz".to_string(), body);

    let warehouse = Arc::new(FakeWarehouse::default());
    let store = Arc::new(InMemoryStore::new());
    store.set("pypi:since", "0").await.unwrap();

    let engine = Engine::new(index, warehouse.clone(), store.clone());
    engine.tick(1_000).await.unwrap();

    assert!(warehouse.projects.lock().unwrap().contains("foo"));
    let release = warehouse
        .versions
        .lock()
        .unwrap()
        .get(&("foo".to_string(), "1.0".to_string()))
        .cloned()
        .unwrap();
    assert_eq!(release.classifiers, vec!["A".to_string(), "B".to_string()]);

    let files = warehouse.files.lock().unwrap();
    let file = files
        .get(&("foo".to_string(), "1.0".to_string()))
        .and_then(|m| m.get("foo-1.0.tar.gz"))
        .cloned()
        .unwrap();
    assert_eq!(file.sha256_digest.len(), 64);

    assert!(store.get("pypi:process:foo:1.0").await.unwrap().is_some());
}

/// S4: an unchanged release (fingerprint already stored and matching) is
/// not re-written to the Warehouse.
#[tokio::test]
async fn s4_unchanged_release_skips_warehouse_writes() {
    let index = Arc::new(ScriptedIndex {
        changelog: vec![ChangelogEntry {
            name: "foo".into(),
            version: Some("1.0".into()),
            timestamp: 10,
            action: "new release".into(),
        }],
        ..Default::default()
    });
    index
        .releases
        .lock()
        .unwrap()
        .insert(("foo".to_string(), "1.0".to_string()), RawRelease::default());

    let release = warehouse_sync::normalize::build_release("foo", "1.0", &RawRelease::default(), vec![]);
    let fp = warehouse_sync::fingerprint::fingerprint(&release);

    let warehouse = Arc::new(FakeWarehouse::default());
    let store = Arc::new(InMemoryStore::new());
    store.set("pypi:since", "0").await.unwrap();
    store.set("pypi:process:foo:1.0", &fp).await.unwrap();

    let engine = Engine::new(index, warehouse.clone(), store.clone());
    engine.tick(1_000).await.unwrap();

    assert_eq!(*warehouse.put_version_calls.lock().unwrap(), 0);
}

/// S5: a file that disappeared from the Index is deleted before the
/// remaining file is reconciled.
#[tokio::test]
async fn s5_removed_file_is_deleted_before_reconciling_the_rest() {
    let body_b = b"xyz".to_vec();
    let md5_b = format!("{:x}", md5::compute(&body_b));

    let index = Arc::new(ScriptedIndex {
        changelog: vec![ChangelogEntry {
            name: "foo".into(),
            version: Some("1.0".into()),
            timestamp: 10,
            action: "new release".into(),
        }],
        ..Default::default()
    });
    index
        .releases
        .lock()
        .unwrap()
        .insert(("foo".to_string(), "1.0".to_string()), RawRelease::default());
    index.urls.lock().unwrap().insert(
        ("foo".to_string(), "1.0".to_string()),
        vec![descriptor("foo-1.0-b.whl", &md5_b)],
    );
    index.bodies.lock().unwrap().insert("foo-1.0-b.whl".to_string(), body_b);

    let warehouse = Arc::new(FakeWarehouse::default());
    warehouse.get_or_create_project("foo").await.unwrap();
    warehouse
        .put_file(
            "foo",
            "1.0",
            &FileEntry {
                filename: "foo-1.0-a.whl".into(),
                packagetype: "bdist_wheel".into(),
                python_version: "py3".into(),
                upload_time: None,
                comment: String::new(),
                filesize: 1,
                md5_digest: String::new(),
                sha256_digest: String::new(),
                yanked: false,
            },
            None,
        )
        .await
        .unwrap();

    let store = Arc::new(InMemoryStore::new());
    store.set("pypi:since", "0").await.unwrap();

    let engine = Engine::new(index, warehouse.clone(), store.clone());
    engine.tick(1_000).await.unwrap();

    let files = warehouse.files.lock().unwrap();
    let remaining = files.get(&("foo".to_string(), "1.0".to_string())).unwrap();
    assert!(!remaining.contains_key("foo-1.0-a.whl"));
    assert!(remaining.contains_key("foo-1.0-b.whl"));
}

/// S6: an MD5 mismatch aborts that release — no file, no fingerprint, and
/// (since the entry targets exactly this one release) no changelog marker,
/// so the next tick retries it.
#[tokio::test]
async fn s6_hash_mismatch_writes_nothing_and_withholds_the_marker() {
    let index = Arc::new(ScriptedIndex {
        changelog: vec![ChangelogEntry {
            name: "foo".into(),
            version: Some("1.0".into()),
            timestamp: 10,
            action: "new release".into(),
        }],
        ..Default::default()
    });
    index
        .releases
        .lock()
        .unwrap()
        .insert(("foo".to_string(), "1.0".to_string()), RawRelease::default());
    index.urls.lock().unwrap().insert(
        ("foo".to_string(), "1.0".to_string()),
        vec![descriptor("foo-1.0.tar.gz", "deadbeefdeadbeefdeadbeefdeadbeef")],
    );
    index
        .bodies
        .lock()
        .unwrap()
        .insert("foo-1.0.tar.gz".to_string(), b"not the declared content".to_vec());

    let warehouse = Arc::new(FakeWarehouse::default());
    let store = Arc::new(InMemoryStore::new());
    store.set("pypi:since", "0").await.unwrap();

    let engine = Engine::new(index, warehouse.clone(), store.clone());
    engine.tick(1_000).await.unwrap();

    assert!(warehouse.versions.lock().unwrap().is_empty());
    assert_eq!(store.get("pypi:process:foo:1.0").await.unwrap(), None);

    // The cursor still advances even though the entry failed (§7).
    assert_eq!(store.get("pypi:since").await.unwrap(), Some("1000".to_string()));
}
