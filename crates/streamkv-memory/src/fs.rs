use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use streamkv::host::{Completion, DatabaseInfo, HostConnection, HostFactory, UpgradeCallback};
use streamkv::{StoreError, StoreResult};

use crate::config::MemoryEngineConfig;
use crate::engine::{MemoryEngine, Persist};
use crate::state::EngineState;

pub const STATE_FILE_NAME: &str = "streamkv-state.json";

/// Memory engine whose committed state is snapshotted to a JSON file under
/// `root` after every commit, upgrade, and deletion.
#[derive(Clone)]
pub struct FsEngine {
    state_file: PathBuf,
    inner: MemoryEngine,
}

impl FsEngine {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        Self::with_config(root, MemoryEngineConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(root: P, config: MemoryEngineConfig) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref())
            .map_err(|err| StoreError::backend(format!("create engine root failed: {err}")))?;
        let state_file = root.as_ref().join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| StoreError::backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<EngineState>(&raw)
                .map_err(|err| StoreError::backend(format!("decode state file failed: {err}")))?
        } else {
            EngineState::default()
        };
        tracing::debug!(
            path = %state_file.display(),
            databases = state.databases.len(),
            "loaded engine state"
        );

        let snapshot = SnapshotFile {
            path: state_file.clone(),
            pretty: config.pretty_snapshots,
        };
        Ok(Self {
            state_file,
            inner: MemoryEngine::from_parts(config, state, Some(Box::new(snapshot))),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn config(&self) -> &MemoryEngineConfig {
        self.inner.config()
    }

    pub fn factory(&self) -> Arc<dyn HostFactory> {
        Arc::new(self.clone())
    }
}

impl HostFactory for FsEngine {
    fn open(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: UpgradeCallback,
        done: Completion<Arc<dyn HostConnection>>,
    ) {
        self.inner.open(name, version, upgrade, done);
    }

    fn delete_database(&self, name: &str, done: Completion<()>) {
        self.inner.delete_database(name, done);
    }

    fn databases(&self, done: Completion<Vec<DatabaseInfo>>) {
        self.inner.databases(done);
    }
}

struct SnapshotFile {
    path: PathBuf,
    pretty: bool,
}

impl Persist for SnapshotFile {
    fn persist(&self, state: &EngineState) -> StoreResult<()> {
        let raw = if self.pretty {
            serde_json::to_vec_pretty(state)
        } else {
            serde_json::to_vec(state)
        }
        .map_err(|err| StoreError::backend(format!("encode state failed: {err}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|err| StoreError::backend(format!("write state file failed: {err}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|err| StoreError::backend(format!("rename state file failed: {err}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use streamkv::{
        DatabaseOptions, ErrorKind, Key, SchemaVersion, StoreSchema, TransactionMode, open_database,
    };

    fn options() -> DatabaseOptions {
        DatabaseOptions::new("notes")
            .version(SchemaVersion::new(1).store(StoreSchema::new("notes").auto_increment()))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reopen_restores_committed_records() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        {
            let engine = FsEngine::new(tmp.path()).expect("fs engine should initialize");
            let db = open_database(engine.factory(), options())
                .await
                .expect("database should open");
            let store = db
                .object_store("notes", TransactionMode::ReadWrite)
                .expect("store should resolve");
            let key = store
                .add(&json!({"text": "remember"}), None)
                .await
                .expect("add should succeed");
            assert_eq!(key, Key::number(1.0));
            store.transaction().commit().expect("commit should be accepted");
            store
                .transaction()
                .completion()
                .await
                .expect("transaction should complete");
            assert!(engine.state_file().exists());
        }

        let reopened = FsEngine::new(tmp.path()).expect("fs engine should reopen");
        let db = open_database(reopened.factory(), options())
            .await
            .expect("database should reopen");
        assert_eq!(db.version(), 1);
        let store = db
            .object_store("notes", TransactionMode::ReadOnly)
            .expect("store should resolve");
        let value = store.get(Key::number(1.0)).await.expect("get should succeed");
        assert_eq!(value, Some(json!({"text": "remember"})));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn aborted_transaction_is_not_persisted() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let engine = FsEngine::new(tmp.path()).expect("fs engine should initialize");
        let db = open_database(engine.factory(), options())
            .await
            .expect("database should open");
        let store = db
            .object_store("notes", TransactionMode::ReadWrite)
            .expect("store should resolve");
        store
            .add(&json!({"text": "draft"}), None)
            .await
            .expect("add should succeed");
        store.transaction().abort().expect("abort should be accepted");

        let reopened = FsEngine::new(tmp.path()).expect("fs engine should reopen");
        let db = open_database(reopened.factory(), options())
            .await
            .expect("database should reopen");
        let count = db
            .object_store("notes", TransactionMode::ReadOnly)
            .expect("store should resolve")
            .count(None)
            .await
            .expect("count should succeed");
        assert_eq!(count, 0);
    }

    #[test]
    fn corrupt_state_file_is_a_backend_error() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        fs::write(tmp.path().join(STATE_FILE_NAME), b"{not json").expect("write should succeed");
        let error = FsEngine::new(tmp.path())
            .err()
            .expect("corrupt state should be rejected");
        assert_eq!(error.kind, ErrorKind::Backend);
    }
}
