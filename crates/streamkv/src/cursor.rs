//! Lazy row streams over host cursors.
//!
//! The host reports one position per callback and waits for an explicit
//! advance. [`CursorStream`] keeps at most one host step outstanding: a
//! position is mapped, the cursor is advanced, and the row is yielded if the
//! predicate accepts it. Dropping the stream leaves the outstanding step to
//! settle unobserved and issues nothing further.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use futures::Stream;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::host::{CursorDirection, CursorListener, CursorRecord, HostCursor};
use crate::key::{Key, KeyRange};

/// A cursor position carrying a value.
#[derive(Clone, Debug, PartialEq)]
pub struct Row<T> {
    pub value: T,
    /// Index key when iterating an index, otherwise the store key.
    pub key: Key,
    pub primary_key: Key,
}

/// A position of a key-only cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRow {
    pub key: Key,
    pub primary_key: Key,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CursorOptions {
    pub range: Option<KeyRange>,
    pub direction: CursorDirection,
}

impl CursorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn range(mut self, range: impl Into<KeyRange>) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn direction(mut self, direction: CursorDirection) -> Self {
        self.direction = direction;
        self
    }
}

type Opener = Arc<dyn Fn(CursorListener) -> Arc<dyn HostCursor> + Send + Sync>;
type Mapper<R> = Arc<dyn Fn(CursorRecord) -> StoreResult<R> + Send + Sync>;
type Predicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// Cold description of a cursor iteration. Each subscription opens a new host cursor.
pub struct Cursor<R> {
    opener: Opener,
    mapper: Mapper<R>,
    predicate: Option<Predicate<R>>,
}

impl<R> Clone for Cursor<R> {
    fn clone(&self) -> Self {
        Self {
            opener: Arc::clone(&self.opener),
            mapper: Arc::clone(&self.mapper),
            predicate: self.predicate.clone(),
        }
    }
}

impl<R: Send + 'static> Cursor<R> {
    pub fn new(
        opener: impl Fn(CursorListener) -> Arc<dyn HostCursor> + Send + Sync + 'static,
        mapper: impl Fn(CursorRecord) -> StoreResult<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            opener: Arc::new(opener),
            mapper: Arc::new(mapper),
            predicate: None,
        }
    }

    /// Keeps only rows accepted by `predicate`; rejected rows still advance the cursor.
    pub fn filter(mut self, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn subscribe(&self) -> CursorStream<R> {
        CursorStream {
            cursor: self.clone(),
            state: CursorState::Unopened,
        }
    }
}

struct Step {
    position: Option<StoreResult<Option<CursorRecord>>>,
    waker: Option<Waker>,
}

enum CursorState {
    Unopened,
    Open {
        host: Arc<dyn HostCursor>,
        step: Arc<Mutex<Step>>,
    },
    Done,
}

pub struct CursorStream<R> {
    cursor: Cursor<R>,
    state: CursorState,
}

impl<R: Send + 'static> CursorStream<R> {
    fn open(&self) -> CursorState {
        let step = Arc::new(Mutex::new(Step {
            position: None,
            waker: None,
        }));
        let pending: Weak<Mutex<Step>> = Arc::downgrade(&step);
        let listener: CursorListener = Arc::new(move |position| {
            let Some(step) = pending.upgrade() else {
                tracing::trace!("discarding cursor step of unsubscribed stream");
                return;
            };
            let waker = {
                let mut step = step.lock();
                step.position = Some(position);
                step.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        let host = (self.cursor.opener)(listener);
        CursorState::Open { host, step }
    }

    fn finish(&mut self, item: Option<StoreResult<R>>) -> Poll<Option<StoreResult<R>>> {
        self.state = CursorState::Done;
        Poll::Ready(item)
    }
}

impl<R: Send + 'static> Stream for CursorStream<R> {
    type Item = StoreResult<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if matches!(self.state, CursorState::Unopened) {
            self.state = self.open();
        }
        loop {
            let (host, step) = match &self.state {
                CursorState::Open { host, step } => (Arc::clone(host), Arc::clone(step)),
                _ => return Poll::Ready(None),
            };
            let position = {
                let mut guard = step.lock();
                match guard.position.take() {
                    Some(position) => position,
                    None => {
                        guard.waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                }
            };
            let record = match position {
                Ok(Some(record)) => record,
                Ok(None) => return self.finish(None),
                Err(error) => return self.finish(Some(Err(error))),
            };
            let row = match (self.cursor.mapper)(record) {
                Ok(row) => row,
                Err(error) => return self.finish(Some(Err(error))),
            };
            host.advance();
            let accepted = match &self.cursor.predicate {
                Some(predicate) => predicate(&row),
                None => true,
            };
            if accepted {
                return Poll::Ready(Some(Ok(row)));
            }
        }
    }
}

/// Maps a host record into a value row, failing when the host omitted the value.
pub(crate) fn value_row<T>(
    record: CursorRecord,
    deserialize: impl FnOnce(serde_json::Value) -> StoreResult<T>,
) -> StoreResult<Row<T>> {
    let value = record
        .value
        .ok_or_else(|| StoreError::state("host cursor reported a position without a value"))?;
    Ok(Row {
        value: deserialize(value)?,
        key: record.key,
        primary_key: record.primary_key,
    })
}

pub(crate) fn key_row(record: CursorRecord) -> StoreResult<KeyRow> {
    Ok(KeyRow {
        key: record.key,
        primary_key: record.primary_key,
    })
}
