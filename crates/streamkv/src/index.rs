use std::sync::Arc;

use crate::cursor::{Cursor, CursorOptions, KeyRow, Row};
use crate::host::{HostIndex, HostValue};
use crate::key::{Key, KeyPath, KeyRange};
use crate::request::Request;
use crate::source::Reader;
use crate::transformer::Transformer;

/// Read-only view over an index. Values come from the owning store and are
/// decoded with the store's transformer; `key` on cursor rows is the index key.
pub struct Index<T = HostValue> {
    host: Arc<dyn HostIndex>,
    reader: Reader<dyn HostIndex, T>,
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            reader: self.reader.clone(),
        }
    }
}

impl<T: Send + 'static> Index<T> {
    pub(crate) fn new(host: Arc<dyn HostIndex>, transformer: Arc<dyn Transformer<T>>) -> Self {
        Self {
            reader: Reader::new(Arc::clone(&host), transformer),
            host,
        }
    }

    pub fn name(&self) -> String {
        self.host.name()
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.host.key_path()
    }

    pub fn unique(&self) -> bool {
        self.host.unique()
    }

    pub fn multi_entry(&self) -> bool {
        self.host.multi_entry()
    }

    pub fn get(&self, query: impl Into<KeyRange>) -> Request<Option<T>> {
        self.reader.get(query.into())
    }

    pub fn get_all(&self, query: Option<KeyRange>) -> Request<Vec<T>> {
        self.reader.get_all(query, None)
    }

    pub fn get_all_limited(&self, query: Option<KeyRange>, count: u32) -> Request<Vec<T>> {
        self.reader.get_all(query, Some(count))
    }

    /// Primary keys of matching records, in index order.
    pub fn get_all_keys(&self, query: Option<KeyRange>) -> Request<Vec<Key>> {
        self.reader.get_all_keys(query, None)
    }

    pub fn get_all_keys_limited(&self, query: Option<KeyRange>, count: u32) -> Request<Vec<Key>> {
        self.reader.get_all_keys(query, Some(count))
    }

    /// Primary key of the first record whose index key falls in `query`.
    pub fn get_key(&self, query: impl Into<KeyRange>) -> Request<Option<Key>> {
        self.reader.get_key(query.into())
    }

    pub fn count(&self, query: Option<KeyRange>) -> Request<u64> {
        self.reader.count(query)
    }

    pub fn open_cursor(&self, options: CursorOptions) -> Cursor<Row<T>> {
        self.reader.open_cursor(options)
    }

    pub fn open_key_cursor(&self, options: CursorOptions) -> Cursor<KeyRow> {
        self.reader.open_key_cursor(options)
    }
}

impl<T> std::fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.host.name())
            .field("unique", &self.host.unique())
            .field("multi_entry", &self.host.multi_entry())
            .finish()
    }
}
