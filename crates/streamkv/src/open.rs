//! Opening and deleting databases through a host factory.
//!
//! A database is described by a list of [`SchemaVersion`]s. Opening requests
//! the highest listed version; when the host reports an upgrade, every schema
//! version newer than the stored one is applied in ascending order inside the
//! version-change transaction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::host::{
    Completion, DatabaseInfo, HostFactory, HostUpgrade, IndexParameters, ObjectStoreParameters,
    UpgradeCallback,
};
use crate::key::KeyPath;
use crate::request::Request;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    pub name: String,
    #[serde(default)]
    pub schema: Vec<SchemaVersion>,
}

impl DatabaseOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Vec::new(),
        }
    }

    pub fn version(mut self, version: SchemaVersion) -> Self {
        self.schema.push(version);
        self
    }

    /// Highest declared version; `None` opens whatever version is stored.
    pub fn target_version(&self) -> Option<u64> {
        self.schema.iter().map(|version| version.version).max()
    }

    fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() {
            return Err(StoreError::data("database name must not be empty"));
        }
        if self.schema.iter().any(|version| version.version == 0) {
            return Err(StoreError::version("schema versions start at 1"));
        }
        Ok(())
    }
}

/// Changes introduced by one database version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub version: u64,
    #[serde(default)]
    pub stores: Vec<StoreSchema>,
    #[serde(default)]
    pub drop_stores: Vec<String>,
}

impl SchemaVersion {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    pub fn store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    pub fn drop_store(mut self, name: impl Into<String>) -> Self {
        self.drop_stores.push(name.into());
        self
    }
}

/// Store to create, or whose missing indexes to add when it already exists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    #[serde(default)]
    pub key_path: Option<KeyPath>,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// Applies every schema version in `(old_version, new_version]`, lowest first.
pub fn apply_schema(schema: &[SchemaVersion], upgrade: &dyn HostUpgrade) -> StoreResult<()> {
    let old_version = upgrade.old_version();
    let new_version = upgrade.new_version();
    let mut pending: Vec<&SchemaVersion> = schema
        .iter()
        .filter(|version| version.version > old_version && version.version <= new_version)
        .collect();
    pending.sort_by_key(|version| version.version);

    for version in pending {
        tracing::debug!(version = version.version, "applying schema version");
        for name in &version.drop_stores {
            if upgrade.object_store_names().iter().any(|existing| existing == name) {
                upgrade.delete_object_store(name)?;
            }
        }
        for store in &version.stores {
            let exists = upgrade
                .object_store_names()
                .iter()
                .any(|existing| existing == &store.name);
            if !exists {
                upgrade.create_object_store(
                    &store.name,
                    ObjectStoreParameters {
                        key_path: store.key_path.clone(),
                        auto_increment: store.auto_increment,
                    },
                )?;
            }
            let existing_indexes = upgrade.index_names(&store.name)?;
            for index in &store.indexes {
                if existing_indexes.contains(&index.name) {
                    continue;
                }
                upgrade.create_index(
                    &store.name,
                    &index.name,
                    index.key_path.clone(),
                    IndexParameters {
                        unique: index.unique,
                        multi_entry: index.multi_entry,
                    },
                )?;
            }
        }
    }
    Ok(())
}

/// Opens (and upgrades if needed) the database described by `options`.
pub fn open_database(factory: Arc<dyn HostFactory>, options: DatabaseOptions) -> Request<Database> {
    if let Err(error) = options.validate() {
        return Request::failed(error);
    }
    let options = Arc::new(options);
    Request::new(move |done: Completion<Database>| {
        let schema = Arc::clone(&options);
        let upgrade: UpgradeCallback =
            Box::new(move |upgrade: &dyn HostUpgrade| apply_schema(&schema.schema, upgrade));
        factory.open(
            &options.name,
            options.target_version(),
            upgrade,
            Box::new(move |result| done(result.map(Database::from_host))),
        );
    })
}

/// Deletes a database, force-closing its open connections.
pub fn delete_database(factory: Arc<dyn HostFactory>, name: &str) -> Request<()> {
    let name = name.to_string();
    Request::new(move |done| factory.delete_database(&name, done))
}

pub fn list_databases(factory: Arc<dyn HostFactory>) -> Request<Vec<DatabaseInfo>> {
    Request::new(move |done| factory.databases(done))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingUpgrade {
        old_version: u64,
        new_version: u64,
        stores: Mutex<Vec<String>>,
        log: Mutex<Vec<String>>,
    }

    impl HostUpgrade for RecordingUpgrade {
        fn old_version(&self) -> u64 {
            self.old_version
        }

        fn new_version(&self) -> u64 {
            self.new_version
        }

        fn object_store_names(&self) -> Vec<String> {
            self.stores.lock().clone()
        }

        fn create_object_store(&self, name: &str, _: ObjectStoreParameters) -> StoreResult<()> {
            self.stores.lock().push(name.to_string());
            self.log.lock().push(format!("create {name}"));
            Ok(())
        }

        fn delete_object_store(&self, name: &str) -> StoreResult<()> {
            self.stores.lock().retain(|store| store != name);
            self.log.lock().push(format!("delete {name}"));
            Ok(())
        }

        fn index_names(&self, _: &str) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn create_index(&self, store: &str, name: &str, _: KeyPath, _: IndexParameters) -> StoreResult<()> {
            self.log.lock().push(format!("index {store}.{name}"));
            Ok(())
        }

        fn delete_index(&self, _: &str, _: &str) -> StoreResult<()> {
            Ok(())
        }
    }

    fn schema() -> Vec<SchemaVersion> {
        vec![
            SchemaVersion::new(2)
                .store(StoreSchema::new("tags"))
                .drop_store("scratch"),
            SchemaVersion::new(1)
                .store(
                    StoreSchema::new("songs")
                        .key_path("id")
                        .index(IndexSchema::new("by_artist", "artist")),
                )
                .store(StoreSchema::new("scratch")),
        ]
    }

    #[test]
    fn apply_schema_runs_new_versions_in_ascending_order() {
        let upgrade = RecordingUpgrade {
            old_version: 0,
            new_version: 2,
            ..RecordingUpgrade::default()
        };

        apply_schema(&schema(), &upgrade).expect("schema should apply");

        assert_eq!(
            *upgrade.log.lock(),
            vec![
                "create songs",
                "index songs.by_artist",
                "create scratch",
                "delete scratch",
                "create tags",
            ]
        );
    }

    #[test]
    fn apply_schema_skips_versions_already_stored() {
        let upgrade = RecordingUpgrade {
            old_version: 1,
            new_version: 2,
            stores: Mutex::new(vec!["songs".to_string(), "scratch".to_string()]),
            ..RecordingUpgrade::default()
        };

        apply_schema(&schema(), &upgrade).expect("schema should apply");

        assert_eq!(*upgrade.log.lock(), vec!["delete scratch", "create tags"]);
    }

    #[test]
    fn options_deserialize_from_json_with_defaults() {
        let options: DatabaseOptions = serde_json::from_str(
            r#"{
                "name": "music",
                "schema": [
                    {"version": 1, "stores": [{"name": "songs", "key_path": "id"}]}
                ]
            }"#,
        )
        .expect("options should parse");

        assert_eq!(options.target_version(), Some(1));
        let store = &options.schema[0].stores[0];
        assert_eq!(store.key_path, Some(KeyPath::from("id")));
        assert!(!store.auto_increment);
        assert!(store.indexes.is_empty());
    }

    #[test]
    fn zero_version_is_rejected_before_reaching_the_host() {
        let options = DatabaseOptions::new("music").version(SchemaVersion::new(0));
        assert!(options.validate().is_err());
    }
}
