use std::sync::Arc;

use crate::cursor::{Cursor, CursorOptions, KeyRow, Row, key_row, value_row};
use crate::host::{Completion, CursorListener, CursorRequest, HostSource, HostValue};
use crate::key::{Key, KeyRange};
use crate::request::Request;
use crate::transformer::Transformer;

/// Read operations shared by object stores and indexes.
pub(crate) struct Reader<S: ?Sized, T> {
    pub(crate) source: Arc<S>,
    pub(crate) transformer: Arc<dyn Transformer<T>>,
}

impl<S: ?Sized, T> Clone for Reader<S, T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            transformer: Arc::clone(&self.transformer),
        }
    }
}

impl<S, T> Reader<S, T>
where
    S: HostSource + ?Sized + 'static,
    T: Send + 'static,
{
    pub(crate) fn new(source: Arc<S>, transformer: Arc<dyn Transformer<T>>) -> Self {
        Self {
            source,
            transformer,
        }
    }

    pub(crate) fn get(&self, query: KeyRange) -> Request<Option<T>> {
        let source = Arc::clone(&self.source);
        let transformer = Arc::clone(&self.transformer);
        Request::new(move |done: Completion<Option<HostValue>>| source.get(query.clone(), done))
            .map(move |value| value.map(|value| transformer.deserialize(value)).transpose())
    }

    pub(crate) fn get_all(&self, query: Option<KeyRange>, count: Option<u32>) -> Request<Vec<T>> {
        let source = Arc::clone(&self.source);
        let transformer = Arc::clone(&self.transformer);
        Request::new(move |done: Completion<Vec<HostValue>>| {
            source.get_all(query.clone(), count, done)
        })
        .map(move |values| {
            values
                .into_iter()
                .map(|value| transformer.deserialize(value))
                .collect()
        })
    }

    pub(crate) fn get_all_keys(&self, query: Option<KeyRange>, count: Option<u32>) -> Request<Vec<Key>> {
        let source = Arc::clone(&self.source);
        Request::new(move |done| source.get_all_keys(query.clone(), count, done))
    }

    pub(crate) fn get_key(&self, query: KeyRange) -> Request<Option<Key>> {
        let source = Arc::clone(&self.source);
        Request::new(move |done| source.get_key(query.clone(), done))
    }

    pub(crate) fn count(&self, query: Option<KeyRange>) -> Request<u64> {
        let source = Arc::clone(&self.source);
        Request::new(move |done| source.count(query.clone(), done))
    }

    pub(crate) fn open_cursor(&self, options: CursorOptions) -> Cursor<Row<T>> {
        let source = Arc::clone(&self.source);
        let transformer = Arc::clone(&self.transformer);
        let request = CursorRequest {
            range: options.range,
            direction: options.direction,
            keys_only: false,
        };
        Cursor::new(
            move |listener: CursorListener| source.open_cursor(request.clone(), listener),
            move |record| value_row(record, |value| transformer.deserialize(value)),
        )
    }

    pub(crate) fn open_key_cursor(&self, options: CursorOptions) -> Cursor<KeyRow> {
        let source = Arc::clone(&self.source);
        let request = CursorRequest {
            range: options.range,
            direction: options.direction,
            keys_only: true,
        };
        Cursor::new(
            move |listener: CursorListener| source.open_cursor(request.clone(), listener),
            key_row,
        )
    }
}
