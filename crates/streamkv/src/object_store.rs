use std::sync::Arc;

use crate::cursor::{Cursor, CursorOptions, KeyRow, Row};
use crate::error::{StoreError, StoreResult};
use crate::host::{HostObjectStore, HostValue};
use crate::index::Index;
use crate::key::{Key, KeyPath, KeyRange};
use crate::request::Request;
use crate::source::Reader;
use crate::transaction::Transaction;
use crate::transformer::Transformer;

/// Typed view over one object store inside one transaction.
///
/// Values are serialized when a write is requested and deserialized when a
/// read settles, including every row a cursor yields. Operations never run
/// until their request or cursor is subscribed (or awaited).
pub struct ObjectStore<T = HostValue> {
    host: Arc<dyn HostObjectStore>,
    reader: Reader<dyn HostObjectStore, T>,
    transaction: Transaction,
}

impl<T> Clone for ObjectStore<T> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            reader: self.reader.clone(),
            transaction: self.transaction.clone(),
        }
    }
}

impl<T: Send + 'static> ObjectStore<T> {
    pub(crate) fn new(
        host: Arc<dyn HostObjectStore>,
        transaction: Transaction,
        transformer: Arc<dyn Transformer<T>>,
    ) -> Self {
        Self {
            reader: Reader::new(Arc::clone(&host), transformer),
            host,
            transaction,
        }
    }

    pub fn name(&self) -> String {
        self.host.name()
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.host.key_path()
    }

    pub fn auto_increment(&self) -> bool {
        self.host.auto_increment()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.host.index_names()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Value stored under the first key in `query`; `None` when nothing matches.
    pub fn get(&self, query: impl Into<KeyRange>) -> Request<Option<T>> {
        self.reader.get(query.into())
    }

    pub fn get_all(&self, query: Option<KeyRange>) -> Request<Vec<T>> {
        self.reader.get_all(query, None)
    }

    pub fn get_all_limited(&self, query: Option<KeyRange>, count: u32) -> Request<Vec<T>> {
        self.reader.get_all(query, Some(count))
    }

    pub fn get_all_keys(&self, query: Option<KeyRange>) -> Request<Vec<Key>> {
        self.reader.get_all_keys(query, None)
    }

    pub fn get_all_keys_limited(&self, query: Option<KeyRange>, count: u32) -> Request<Vec<Key>> {
        self.reader.get_all_keys(query, Some(count))
    }

    pub fn get_key(&self, query: impl Into<KeyRange>) -> Request<Option<Key>> {
        self.reader.get_key(query.into())
    }

    pub fn count(&self, query: Option<KeyRange>) -> Request<u64> {
        self.reader.count(query)
    }

    /// Inserts a new record. Fails with a constraint error if the key exists.
    pub fn add(&self, value: &T, key: Option<Key>) -> Request<Key> {
        let value = match self.reader.transformer.serialize(value) {
            Ok(value) => value,
            Err(error) => return Request::failed(error),
        };
        let host = Arc::clone(&self.host);
        Request::new(move |done| host.add(value.clone(), key.clone(), done))
    }

    /// Inserts or replaces a record.
    pub fn put(&self, value: &T, key: Option<Key>) -> Request<Key> {
        let value = match self.reader.transformer.serialize(value) {
            Ok(value) => value,
            Err(error) => return Request::failed(error),
        };
        let host = Arc::clone(&self.host);
        Request::new(move |done| host.put(value.clone(), key.clone(), done))
    }

    pub fn delete(&self, query: impl Into<KeyRange>) -> Request<()> {
        let host = Arc::clone(&self.host);
        let query = query.into();
        Request::new(move |done| host.delete(query.clone(), done))
    }

    pub fn clear(&self) -> Request<()> {
        let host = Arc::clone(&self.host);
        Request::new(move |done| host.clear(done))
    }

    pub fn open_cursor(&self, options: CursorOptions) -> Cursor<Row<T>> {
        self.reader.open_cursor(options)
    }

    pub fn open_key_cursor(&self, options: CursorOptions) -> Cursor<KeyRow> {
        self.reader.open_key_cursor(options)
    }

    /// Index of this store, sharing the store's transformer.
    pub fn index(&self, name: &str) -> StoreResult<Index<T>> {
        if !self.index_names().iter().any(|candidate| candidate == name) {
            return Err(StoreError::not_found(format!(
                "no index named '{name}' on object store '{}'",
                self.name()
            )));
        }
        let host = self.host.index(name)?;
        Ok(Index::new(host, Arc::clone(&self.reader.transformer)))
    }

    /// Streaming form of [`ObjectStore::index`].
    pub fn index_deferred(&self, name: &str) -> Request<Index<T>> {
        let store = self.clone();
        let name = name.to_string();
        Request::deferred(move || store.index(&name))
    }
}

impl<T> std::fmt::Debug for ObjectStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.host.name())
            .field("key_path", &self.host.key_path())
            .finish()
    }
}
