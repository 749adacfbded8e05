//! Event bridge between host handles and callers.
//!
//! Hosts keep listeners in an [`EventTarget`]; wrappers forward
//! `add_event_listener` / `remove_event_listener` to it unchanged. Removal is
//! by reference identity: only the same `Listener` (the same `Arc`) that was
//! added removes the registration. [`EventStream`] is the stream-shaped view,
//! holding a private listener for as long as the stream lives.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Abort,
    Complete,
    Error,
    Close,
    VersionChange,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Close => "close",
            Self::VersionChange => "versionchange",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    /// Set on `error` events and on `abort` events caused by a failure.
    pub error: Option<StoreError>,
    pub old_version: Option<u64>,
    /// `None` on a `versionchange` event means the database is being deleted.
    pub new_version: Option<u64>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            error: None,
            old_version: None,
            new_version: None,
        }
    }

    pub fn with_error(event_type: EventType, error: Option<StoreError>) -> Self {
        Self {
            error,
            ..Self::new(event_type)
        }
    }

    pub fn version_change(old_version: u64, new_version: Option<u64>) -> Self {
        Self {
            old_version: Some(old_version),
            new_version,
            ..Self::new(EventType::VersionChange)
        }
    }
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

pub fn listener(callback: impl Fn(&Event) + Send + Sync + 'static) -> Listener {
    Arc::new(callback)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Drop the registration right before its first invocation.
    pub once: bool,
}

impl ListenerOptions {
    pub fn once() -> Self {
        Self { once: true }
    }
}

/// Implemented by host handles that deliver events (connections, transactions).
pub trait EventSource: Send + Sync {
    fn add_event_listener(&self, event_type: EventType, listener: &Listener, options: ListenerOptions);

    fn remove_event_listener(&self, event_type: EventType, listener: &Listener);
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct Registration {
    event_type: EventType,
    listener: Listener,
    once: bool,
}

/// Listener registry for host handles.
///
/// Dispatch snapshots the matching listeners and releases the lock before
/// calling them, so listeners may add or remove registrations (including
/// their own) while being called; such changes apply from the next dispatch.
#[derive(Default)]
pub struct EventTarget {
    registrations: Mutex<Vec<Registration>>,
}

impl EventTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event_listener(
        &self,
        event_type: EventType,
        listener: &Listener,
        options: ListenerOptions,
    ) {
        let mut registrations = self.registrations.lock();
        let duplicate = registrations
            .iter()
            .any(|r| r.event_type == event_type && same_listener(&r.listener, listener));
        if duplicate {
            return;
        }
        registrations.push(Registration {
            event_type,
            listener: Arc::clone(listener),
            once: options.once,
        });
    }

    pub fn remove_event_listener(&self, event_type: EventType, listener: &Listener) {
        self.registrations
            .lock()
            .retain(|r| !(r.event_type == event_type && same_listener(&r.listener, listener)));
    }

    pub fn dispatch(&self, event: &Event) {
        let snapshot: Vec<Listener> = {
            let mut registrations = self.registrations.lock();
            let matching = registrations
                .iter()
                .filter(|r| r.event_type == event.event_type)
                .map(|r| Arc::clone(&r.listener))
                .collect();
            registrations.retain(|r| !(r.once && r.event_type == event.event_type));
            matching
        };
        tracing::trace!(
            event = event.event_type.as_str(),
            listeners = snapshot.len(),
            "dispatching event"
        );
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.event_type == event_type)
            .count()
    }
}

impl EventSource for EventTarget {
    fn add_event_listener(&self, event_type: EventType, listener: &Listener, options: ListenerOptions) {
        EventTarget::add_event_listener(self, event_type, listener, options);
    }

    fn remove_event_listener(&self, event_type: EventType, listener: &Listener) {
        EventTarget::remove_event_listener(self, event_type, listener);
    }
}

/// Shares a handle whose concrete trait extends [`EventSource`] as a plain
/// `Arc<dyn EventSource>`.
pub(crate) struct SourceRef<S: ?Sized>(pub(crate) Arc<S>);

impl<S: EventSource + ?Sized> EventSource for SourceRef<S> {
    fn add_event_listener(&self, event_type: EventType, listener: &Listener, options: ListenerOptions) {
        self.0.add_event_listener(event_type, listener, options);
    }

    fn remove_event_listener(&self, event_type: EventType, listener: &Listener) {
        self.0.remove_event_listener(event_type, listener);
    }
}

/// Events of one type from one source. Dropping the stream removes its listener.
pub struct EventStream {
    source: Arc<dyn EventSource>,
    event_type: EventType,
    listener: Listener,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub fn new(source: Arc<dyn EventSource>, event_type: EventType) -> Self {
        let (sender, receiver) = mpsc::unbounded();
        let listener = listener(move |event: &Event| {
            let _ = sender.unbounded_send(event.clone());
        });
        source.add_event_listener(event_type, &listener, ListenerOptions::default());
        Self {
            source,
            event_type,
            listener,
            receiver,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.source
            .remove_event_listener(self.event_type, &self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = Arc::clone(counter);
        listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn remove_with_same_reference_stops_delivery() {
        let target = EventTarget::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = counting_listener(&calls);

        target.add_event_listener(EventType::Abort, &callback, ListenerOptions::default());
        target.remove_event_listener(EventType::Abort, &callback);
        target.dispatch(&Event::new(EventType::Abort));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_with_equivalent_but_distinct_listener_is_noop() {
        let target = EventTarget::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let registered = counting_listener(&calls);
        let lookalike = counting_listener(&calls);

        target.add_event_listener(EventType::Abort, &registered, ListenerOptions::default());
        target.remove_event_listener(EventType::Abort, &lookalike);
        target.dispatch(&Event::new(EventType::Abort));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn adding_same_listener_twice_registers_once() {
        let target = EventTarget::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = counting_listener(&calls);

        target.add_event_listener(EventType::Complete, &callback, ListenerOptions::default());
        target.add_event_listener(EventType::Complete, &callback, ListenerOptions::default());
        target.add_event_listener(EventType::Abort, &callback, ListenerOptions::default());
        target.dispatch(&Event::new(EventType::Complete));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(target.listener_count(EventType::Complete), 1);
        assert_eq!(target.listener_count(EventType::Abort), 1);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let target = EventTarget::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = counting_listener(&calls);

        target.add_event_listener(EventType::Error, &callback, ListenerOptions::once());
        target.dispatch(&Event::new(EventType::Error));
        target.dispatch(&Event::new(EventType::Error));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(target.listener_count(EventType::Error), 0);
    }

    #[test]
    fn listener_removing_itself_during_dispatch_does_not_deadlock() {
        let target = Arc::new(EventTarget::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let callback = {
            let target = Arc::clone(&target);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            listener(move |event| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = slot.lock().as_ref() {
                    target.remove_event_listener(event.event_type, me);
                }
            })
        };
        *slot.lock() = Some(Arc::clone(&callback));

        target.add_event_listener(EventType::Abort, &callback, ListenerOptions::default());
        target.dispatch(&Event::new(EventType::Abort));
        target.dispatch(&Event::new(EventType::Abort));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn event_stream_forwards_events_and_unregisters_on_drop() {
        let target = Arc::new(EventTarget::new());
        let mut stream = EventStream::new(target.clone(), EventType::VersionChange);
        assert_eq!(target.listener_count(EventType::VersionChange), 1);

        target.dispatch(&Event::version_change(1, Some(2)));
        let event = stream.next().await.expect("stream should yield the event");
        assert_eq!(event.old_version, Some(1));
        assert_eq!(event.new_version, Some(2));

        drop(stream);
        assert_eq!(target.listener_count(EventType::VersionChange), 0);
    }
}
