//! C8 — `Engine::tick`: the single orchestration step that reads the
//! changelog cursor, walks new entries in order, and dispatches each to
//! the reconciler (§4.8).

use std::sync::Arc;

use sha2::{Digest, Sha512};
use tracing::{debug, error, info};

use crate::dispatch::{dispatch, Action};
use crate::errors::SyncError;
use crate::index::IndexClient;
use crate::reconciler::ReleaseReconciler;
use crate::store::Store;
use crate::warehouse::WarehouseClient;

const CURSOR_KEY: &str = "pypi:since";
const CLOCK_REWIND_SECONDS: i64 = 10;
const MARKER_TTL_SECONDS: u64 = 2_592_000; // 30 days

pub struct Engine {
    index: Arc<dyn IndexClient>,
    store: Arc<dyn Store>,
    reconciler: ReleaseReconciler,
}

impl Engine {
    pub fn new(
        index: Arc<dyn IndexClient>,
        warehouse: Arc<dyn WarehouseClient>,
        store: Arc<dyn Store>,
    ) -> Self {
        let reconciler = ReleaseReconciler::new(index.clone(), warehouse, store.clone());
        Self {
            index,
            store,
            reconciler,
        }
    }

    /// Runs one tick: fetch the changelog since the stored cursor, process
    /// every new entry in order, then advance the cursor. `now_epoch` is
    /// supplied by the caller (rather than read internally) so tests can
    /// pin it.
    pub async fn tick(&self, now_epoch: i64) -> Result<(), SyncError> {
        let cursor = self.store.get(CURSOR_KEY).await?.ok_or_else(|| {
            SyncError::Config(
                "cannot process changes with no value for the last successful run".to_string(),
            )
        })?;

        let since: f64 = cursor
            .parse()
            .map_err(|_| SyncError::Config(format!("invalid {CURSOR_KEY} cursor: {cursor}")))?;
        let since = since.floor() as i64 - CLOCK_REWIND_SECONDS;

        let changes = self.index.changelog(since).await?;

        for entry in changes {
            let marker = format!(
                "pypi:changelog:{}",
                action_hash(&entry.name, entry.version.as_deref(), entry.timestamp, &entry.action)
            );

            if self.store.exists(&marker).await? {
                debug!(
                    name = entry.name,
                    version = entry.version,
                    timestamp = entry.timestamp,
                    action = entry.action,
                    "skipping already-processed changelog entry"
                );
                continue;
            }

            debug!(
                name = entry.name,
                version = entry.version,
                timestamp = entry.timestamp,
                action = entry.action,
                "processing changelog entry"
            );

            // §7: a failure while processing a single entry is logged and
            // the tick moves on; only a `Config` error (not expected here,
            // since the cursor already parsed) would be process-fatal. The
            // marker is withheld on failure so the next tick retries this
            // exact entry, relying on the 10s rewind plus fingerprint/filename
            // idempotency to make that retry safe.
            let outcome = match dispatch(&entry.action) {
                Some(Action::Update) => {
                    self.reconciler
                        .update(&entry.name, entry.version.as_deref())
                        .await
                }
                Some(Action::Delete { filename }) => {
                    self.reconciler
                        .delete(
                            &entry.name,
                            entry.version.as_deref(),
                            &entry.action,
                            filename.as_deref(),
                        )
                        .await
                }
                None => {
                    debug!(action = entry.action, "no dispatch rule matched, ignoring");
                    Ok(())
                }
            };

            match outcome {
                Ok(()) => {
                    self.store.setex(&marker, MARKER_TTL_SECONDS, "1").await?;
                }
                Err(SyncError::Config(msg)) => return Err(SyncError::Config(msg)),
                Err(err) => {
                    error!(
                        name = entry.name,
                        version = entry.version,
                        timestamp = entry.timestamp,
                        action = entry.action,
                        error = %err,
                        "entry failed, marker withheld for retry"
                    );
                }
            }
        }

        self.store.set(CURSOR_KEY, &now_epoch.to_string()).await?;
        info!(now_epoch, "tick complete, cursor advanced");
        Ok(())
    }
}

/// The first 32 hex chars of `sha512("name:version:timestamp:action")`,
/// matching the original source's `hashlib.sha512(...).hexdigest()[:32]`.
fn action_hash(name: &str, version: Option<&str>, timestamp: i64, action: &str) -> String {
    let joined = format!(
        "{name}:{}:{timestamp}:{action}",
        version.unwrap_or("None")
    );
    let digest = Sha512::digest(joined.as_bytes());
    hex::encode(&digest[..16])
}
