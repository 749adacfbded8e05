//! Single-settlement streams over host requests.
//!
//! A [`Request`] is cold: it only describes how to issue the host operation.
//! Every [`Request::subscribe`] produces an independent [`RequestStream`] that
//! issues the operation on its first poll and yields exactly one item. When
//! the stream is dropped before the host settles, the late result is dropped
//! on arrival; the host operation itself keeps running.

use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::host::Completion;

type Factory<T> = Arc<dyn Fn(Completion<T>) + Send + Sync>;

pub struct Request<T> {
    factory: Factory<T>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T: Send + 'static> Request<T> {
    /// `factory` issues the host operation and hands it the completion.
    pub fn new(factory: impl Fn(Completion<T>) + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Runs a synchronous construction per subscription, reporting failures as stream errors.
    pub fn deferred(build: impl Fn() -> StoreResult<T> + Send + Sync + 'static) -> Self {
        Self::new(move |done| done(build()))
    }

    pub fn ready(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |done| done(Ok(value.clone())))
    }

    pub fn failed(error: StoreError) -> Self {
        Self::new(move |done| done(Err(error.clone())))
    }

    pub fn subscribe(&self) -> RequestStream<T> {
        RequestStream {
            state: StreamState::Idle(Arc::clone(&self.factory)),
        }
    }

    /// Post-processes the settled value; a mapping failure becomes the stream error.
    pub fn map<U: Send + 'static>(
        self,
        transform: impl Fn(T) -> StoreResult<U> + Send + Sync + 'static,
    ) -> Request<U> {
        let transform = Arc::new(transform);
        Request::new(move |done: Completion<U>| {
            let transform = Arc::clone(&transform);
            (self.factory)(Box::new(move |result| {
                done(result.and_then(|value| transform(value)))
            }));
        })
    }

    /// Issues `self`, then the request built from its value. Errors short-circuit.
    pub fn and_then<U: Send + 'static>(
        self,
        next: impl Fn(T) -> Request<U> + Send + Sync + 'static,
    ) -> Request<U> {
        let next = Arc::new(next);
        Request::new(move |done: Completion<U>| {
            let next = Arc::clone(&next);
            (self.factory)(Box::new(move |result| match result {
                Ok(value) => (next(value).factory)(done),
                Err(error) => done(Err(error)),
            }));
        })
    }
}

impl<T: Send + 'static> IntoFuture for Request<T> {
    type Output = StoreResult<T>;
    type IntoFuture = BoxFuture<'static, StoreResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let mut stream = self.subscribe();
        Box::pin(async move {
            match stream.next().await {
                Some(result) => result,
                None => Err(StoreError::state("request stream ended without a result")),
            }
        })
    }
}

struct Slot<T> {
    result: Option<StoreResult<T>>,
    waker: Option<Waker>,
}

enum StreamState<T> {
    Idle(Factory<T>),
    Waiting(Arc<Mutex<Slot<T>>>),
    Done,
}

/// One subscription to a [`Request`]: yields one `Ok` or one `Err`, then ends.
pub struct RequestStream<T> {
    state: StreamState<T>,
}

impl<T: Send + 'static> RequestStream<T> {
    fn issue(factory: &Factory<T>) -> Arc<Mutex<Slot<T>>> {
        let slot = Arc::new(Mutex::new(Slot {
            result: None,
            waker: None,
        }));
        let pending: Weak<Mutex<Slot<T>>> = Arc::downgrade(&slot);
        factory(Box::new(move |result| {
            let Some(slot) = pending.upgrade() else {
                tracing::trace!(ok = result.is_ok(), "discarding result of unsubscribed request");
                return;
            };
            let waker = {
                let mut slot = slot.lock();
                slot.result = Some(result);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }));
        slot
    }
}

impl<T: Send + 'static> Stream for RequestStream<T> {
    type Item = StoreResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let StreamState::Idle(factory) = &self.state {
            let slot = Self::issue(factory);
            self.state = StreamState::Waiting(slot);
        }
        let StreamState::Waiting(slot) = &self.state else {
            return Poll::Ready(None);
        };
        let settled = {
            let mut guard = slot.lock();
            match guard.result.take() {
                Some(result) => Some(result),
                None => {
                    guard.waker = Some(cx.waker().clone());
                    None
                }
            }
        };
        match settled {
            Some(result) => {
                self.state = StreamState::Done;
                Poll::Ready(Some(result))
            }
            None => Poll::Pending,
        }
    }
}
