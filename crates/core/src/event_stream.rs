//! The per-session event stream: an append-only log plus a synchronous pub/sub bus.
//!
//! Unlike a broadcast channel, subscribers here are plain callbacks invoked
//! on the publisher's thread, in publish order, before `send_event` returns.
//! Derived views (`get_latest_assistant_response`, `get_latest_tool_results`)
//! are folds over the log, never separately maintained caches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace};
use crate::error::EventError;
use crate::event::{Event, EventKind, EventType};
use crate::tool::ToolResult;

/// Bounds for an event stream.
#[derive(Debug, Clone)]
pub struct EventStreamOptions {
    /// Maximum number of events retained.
    pub max_events: usize,

    /// Drop events once `max_events` is exceeded. Streaming deltas go
    /// first, oldest first; they are redundant once their message is
    /// finalized. Other events are dropped oldest first after that.
    pub auto_trim: bool,
}

impl Default for EventStreamOptions {
    fn default() -> Self {
        Self {
            max_events: 1000,
            auto_trim: true,
        }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: Option<Vec<EventType>>,
    callback: Callback,
}

impl Subscriber {
    fn accepts(&self, event_type: EventType) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|types| types.contains(&event_type))
    }
}

#[derive(Default)]
struct Inner {
    events: VecDeque<Event>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panicking subscriber never holds the lock, so poisoning only means a
    // panic elsewhere; the log itself is still consistent.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by the `subscribe*` methods.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            lock_inner(&inner).subscribers.retain(|s| s.id != self.id);
        }
    }
}

/// Ordered, subscribable log of a session's events.
pub struct EventStream {
    inner: Arc<Mutex<Inner>>,
    dispatching: AtomicUsize,
    options: EventStreamOptions,
}

/// Decrements the dispatch counter even if a callback panics.
struct DispatchGuard<'a>(&'a AtomicUsize);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EventStream {
    pub fn new(options: EventStreamOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            dispatching: AtomicUsize::new(0),
            options,
        }
    }

    pub fn options(&self) -> &EventStreamOptions {
        &self.options
    }

    /// Stamp a payload with an id and timestamp. Does not publish.
    pub fn create_event(&self, kind: EventKind) -> Event {
        Event::new(kind)
    }

    /// Validate, append, and synchronously notify subscribers.
    ///
    /// Nothing is appended if validation fails. Subscribers registered while
    /// this event is being dispatched do not receive it.
    pub fn send_event(&self, event: Event) -> Result<(), EventError> {
        event.validate()?;
        let event_type = event.event_type();

        let callbacks: Vec<Callback> = {
            let mut inner = lock_inner(&self.inner);
            inner.events.push_back(event.clone());
            if self.options.auto_trim {
                let mut dropped = 0usize;
                while inner.events.len() > self.options.max_events {
                    // Never the event being published.
                    let older = inner.events.len() - 1;
                    let victim = inner
                        .events
                        .iter()
                        .take(older)
                        .position(|e| e.event_type().is_streaming())
                        .unwrap_or(0);
                    inner.events.remove(victim);
                    dropped += 1;
                }
                if dropped > 0 {
                    trace!(dropped, max = self.options.max_events, "Trimmed oldest events");
                }
            }
            inner
                .subscribers
                .iter()
                .filter(|s| s.accepts(event_type))
                .map(|s| s.callback.clone())
                .collect()
        };

        self.dispatching.fetch_add(1, Ordering::SeqCst);
        let _guard = DispatchGuard(&self.dispatching);
        for callback in callbacks {
            callback(&event);
        }
        Ok(())
    }

    /// Convenience: create and publish in one step, returning the event.
    pub fn publish(&self, kind: EventKind) -> Result<Event, EventError> {
        let event = self.create_event(kind);
        self.send_event(event.clone())?;
        Ok(event)
    }

    /// Decode one line of JSON and publish it.
    pub fn send_json(&self, line: &str) -> Result<Event, EventError> {
        let event = Event::from_json_line(line)?;
        self.send_event(event.clone())?;
        Ok(event)
    }

    /// Events in publish order, optionally filtered by type. `limit` keeps
    /// the newest matching events.
    pub fn get_events(&self, filter: Option<&[EventType]>, limit: Option<usize>) -> Vec<Event> {
        let inner = lock_inner(&self.inner);
        let matching: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| filter.is_none_or(|types| types.contains(&e.event_type())))
            .cloned()
            .collect();
        match limit {
            Some(n) if n < matching.len() => matching[matching.len() - n..].to_vec(),
            _ => matching,
        }
    }

    pub fn get_events_by_type(&self, types: &[EventType], limit: Option<usize>) -> Vec<Event> {
        self.get_events(Some(types), limit)
    }

    fn add_subscriber(
        &self,
        filter: Option<Vec<EventType>>,
        callback: Callback,
    ) -> Subscription {
        let mut inner = lock_inner(&self.inner);
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber { id, filter, callback });
        debug!(subscriber = id, total = inner.subscribers.len(), "Event subscriber added");
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_subscriber(None, Arc::new(callback))
    }

    /// Receive only events of the given types.
    pub fn subscribe_to_types<F>(&self, types: &[EventType], callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_subscriber(Some(types.to_vec()), Arc::new(callback))
    }

    /// Receive only streaming delta events.
    pub fn subscribe_to_streaming_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_to_types(&EventType::STREAMING, callback)
    }

    /// The most recent finalized assistant message.
    pub fn get_latest_assistant_response(&self) -> Option<Event> {
        let inner = lock_inner(&self.inner);
        inner
            .events
            .iter()
            .rev()
            .find(|e| e.event_type() == EventType::AssistantMessage)
            .cloned()
    }

    /// All tool results published after the most recent assistant message.
    pub fn get_latest_tool_results(&self) -> Vec<ToolResult> {
        let inner = lock_inner(&self.inner);
        let start = inner
            .events
            .iter()
            .rposition(|e| e.event_type() == EventType::AssistantMessage)
            .map(|i| i + 1)
            .unwrap_or(0);
        inner
            .events
            .iter()
            .skip(start)
            .filter_map(|e| match &e.kind {
                EventKind::ToolResult {
                    tool_call_id,
                    name,
                    content,
                    error,
                    elapsed_ms,
                } => Some(ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    name: name.clone(),
                    content: content.clone(),
                    error: error.clone(),
                    elapsed_ms: *elapsed_ms,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_inner(&self.inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all events. Subscribers stay registered.
    ///
    /// Fails if called from inside a subscriber callback.
    pub fn clear(&self) -> Result<(), EventError> {
        if self.dispatching.load(Ordering::SeqCst) > 0 {
            return Err(EventError::ClearDuringDispatch);
        }
        lock_inner(&self.inner).events.clear();
        debug!("Event stream cleared");
        Ok(())
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(EventStreamOptions::default())
    }
}
