//! Contract of the host storage engine.
//!
//! The host is callback driven: each asynchronous primitive takes a
//! [`Completion`] and must invoke it exactly once, either before returning or
//! later from the host's own scheduler. Cursors report every position through
//! a [`CursorListener`] and move on only when [`HostCursor::advance`] is
//! called. Failures are always delivered through the callback, never by
//! panicking or returning early.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::events::EventSource;
use crate::key::{Key, KeyPath, KeyRange};

/// Structured value stored by the host.
pub type HostValue = Value;

pub type Completion<T> = Box<dyn FnOnce(Result<T, StoreError>) + Send>;

/// Called once per cursor position; `Ok(None)` means the cursor is exhausted.
pub type CursorListener = Arc<dyn Fn(Result<Option<CursorRecord>, StoreError>) + Send + Sync>;

pub type UpgradeCallback = Box<dyn FnOnce(&dyn HostUpgrade) -> Result<(), StoreError> + Send>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    #[default]
    ReadOnly,
    ReadWrite,
    VersionChange,
}

impl TransactionMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committing,
    Aborted,
    Finished,
}

impl TransactionState {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorDirection {
    #[default]
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl CursorDirection {
    pub fn is_reverse(self) -> bool {
        matches!(self, Self::Prev | Self::PrevUnique)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, Self::NextUnique | Self::PrevUnique)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CursorRequest {
    pub range: Option<KeyRange>,
    pub direction: CursorDirection,
    /// Key cursors never load values.
    pub keys_only: bool,
}

/// One cursor position as reported by the host.
#[derive(Clone, Debug, PartialEq)]
pub struct CursorRecord {
    pub key: Key,
    pub primary_key: Key,
    pub value: Option<HostValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreParameters {
    #[serde(default)]
    pub key_path: Option<KeyPath>,
    #[serde(default)]
    pub auto_increment: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParameters {
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

/// Entry point of a host engine: opens and deletes databases.
pub trait HostFactory: Send + Sync {
    /// `version: None` opens the current version (or 1 for a new database).
    /// `upgrade` runs inside the version-change transaction when the stored
    /// version is lower than the requested one; an `Err` aborts the open.
    fn open(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: UpgradeCallback,
        done: Completion<Arc<dyn HostConnection>>,
    );

    fn delete_database(&self, name: &str, done: Completion<()>);

    fn databases(&self, done: Completion<Vec<DatabaseInfo>>);
}

/// Schema operations available while a version change is in progress.
pub trait HostUpgrade {
    fn old_version(&self) -> u64;

    fn new_version(&self) -> u64;

    fn object_store_names(&self) -> Vec<String>;

    fn create_object_store(&self, name: &str, parameters: ObjectStoreParameters) -> Result<(), StoreError>;

    fn delete_object_store(&self, name: &str) -> Result<(), StoreError>;

    fn index_names(&self, store: &str) -> Result<Vec<String>, StoreError>;

    fn create_index(
        &self,
        store: &str,
        name: &str,
        key_path: KeyPath,
        parameters: IndexParameters,
    ) -> Result<(), StoreError>;

    fn delete_index(&self, store: &str, name: &str) -> Result<(), StoreError>;
}

pub trait HostConnection: EventSource {
    fn name(&self) -> String;

    fn version(&self) -> u64;

    fn object_store_names(&self) -> Vec<String>;

    /// Fails synchronously with `NotFound` for unknown stores and `State` once closed.
    fn transaction(
        &self,
        scope: &[String],
        mode: TransactionMode,
    ) -> Result<Arc<dyn HostTransaction>, StoreError>;

    /// Closes once running transactions finish; new transactions are refused at once.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait HostTransaction: EventSource {
    fn mode(&self) -> TransactionMode;

    fn object_store_names(&self) -> Vec<String>;

    fn state(&self) -> TransactionState;

    fn error(&self) -> Option<StoreError>;

    fn abort(&self) -> Result<(), StoreError>;

    fn commit(&self) -> Result<(), StoreError>;

    fn object_store(&self, name: &str) -> Result<Arc<dyn HostObjectStore>, StoreError>;
}

/// Read operations shared by object stores and indexes.
pub trait HostSource: Send + Sync {
    fn name(&self) -> String;

    fn key_path(&self) -> Option<KeyPath>;

    fn get(&self, query: KeyRange, done: Completion<Option<HostValue>>);

    fn get_all(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<HostValue>>);

    /// For indexes this yields primary keys, ordered by index key.
    fn get_all_keys(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<Key>>);

    /// For indexes this yields the primary key of the first match.
    fn get_key(&self, query: KeyRange, done: Completion<Option<Key>>);

    fn count(&self, query: Option<KeyRange>, done: Completion<u64>);

    fn open_cursor(&self, request: CursorRequest, listener: CursorListener) -> Arc<dyn HostCursor>;
}

pub trait HostObjectStore: HostSource {
    fn auto_increment(&self) -> bool;

    fn index_names(&self) -> Vec<String>;

    fn index(&self, name: &str) -> Result<Arc<dyn HostIndex>, StoreError>;

    fn add(&self, value: HostValue, key: Option<Key>, done: Completion<Key>);

    fn put(&self, value: HostValue, key: Option<Key>, done: Completion<Key>);

    fn delete(&self, query: KeyRange, done: Completion<()>);

    fn clear(&self, done: Completion<()>);
}

pub trait HostIndex: HostSource {
    fn unique(&self) -> bool;

    fn multi_entry(&self) -> bool;
}

pub trait HostCursor: Send + Sync {
    /// Requests the next position; the result arrives through the cursor's listener.
    fn advance(&self);
}
