//! Event bus for a single session
//!
//! Synchronous listeners run inline on `emit` in registration order.
//! Asynchronous listeners each own a queue drained by a dedicated Tokio task,
//! so the emitter never waits on them and each one still sees events in
//! emission order. A Tokio broadcast channel mirrors every event for stream
//! consumers.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::types::{Event, EventId, LISTENER_ERROR};
use crate::error::{Result, RoundtableError};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// History size used by [`EventBus::new`]
pub const DEFAULT_HISTORY_CAPACITY: usize = 512;

/// Error a listener may return; it never reaches the emitter.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every listener
pub type ListenerResult = std::result::Result<(), ListenerError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Removable registration returned by `on`/`on_async`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type SyncListener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;
type AsyncListener = Arc<dyn Fn(Event) -> BoxFuture<'static, ListenerResult> + Send + Sync>;

#[derive(Clone)]
enum Delivery {
    Sync(SyncListener),
    Async(mpsc::UnboundedSender<Event>),
}

#[derive(Clone)]
struct Registration {
    handle: ListenerHandle,
    event_type: Option<String>,
    delivery: Delivery,
}

impl Registration {
    fn wants(&self, event: &Event) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |wanted| wanted == event.event_type)
    }
}

struct BusCore {
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    listeners: RwLock<Vec<Registration>>,
    next_handle: AtomicU64,
    sender: broadcast::Sender<Event>,
}

impl BusCore {
    /// Append to history (evicting the oldest entry) and mirror to the stream.
    fn record(&self, event: Event) {
        {
            let mut history = self.history.lock();
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    fn listener_failed(&self, handle: ListenerHandle, source: &Event, error: &str) {
        warn!(
            listener = handle.0,
            event_type = %source.event_type,
            error,
            "Event listener failed"
        );
        let mut event = Event::new(
            LISTENER_ERROR,
            json!({
                "listener": handle.0,
                "source_event_id": source.id,
                "source_event_type": source.event_type,
                "error": error,
            }),
        );
        event.session_id = source.session_id.clone();
        event.task_id = source.task_id.clone();
        self.record(event);
    }
}

/// Per-session pub/sub dispatcher with bounded history
pub struct EventBus {
    core: Arc<BusCore>,
}

impl EventBus {
    /// Create a bus with the default history capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus keeping at most `capacity` events of history
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            core: Arc::new(BusCore {
                history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity: capacity.max(1),
                listeners: RwLock::new(Vec::new()),
                next_handle: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event.
    ///
    /// Listener failures (errors or panics) are recorded as `listener_error`
    /// events and never propagate here.
    pub fn emit(&self, event: Event) -> EventId {
        let id = event.id.clone();
        self.core.record(event.clone());

        let targets: Vec<Registration> = self
            .core
            .listeners
            .read()
            .iter()
            .filter(|r| r.wants(&event))
            .cloned()
            .collect();

        for registration in &targets {
            if let Delivery::Sync(listener) = &registration.delivery {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        self.core
                            .listener_failed(registration.handle, &event, &e.to_string())
                    }
                    Err(panic) => self.core.listener_failed(
                        registration.handle,
                        &event,
                        &panic_message(panic),
                    ),
                }
            }
        }

        for registration in &targets {
            if let Delivery::Async(queue) = &registration.delivery {
                if queue.send(event.clone()).is_err() {
                    debug!(
                        listener = registration.handle.0,
                        "Async listener worker gone, dropping event"
                    );
                }
            }
        }

        debug!(event_type = %event.event_type, listeners = targets.len(), "Event emitted");
        id
    }

    /// Register a synchronous listener for every event type
    pub fn on<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(None, Delivery::Sync(Arc::new(listener)))
    }

    /// Register a synchronous listener for one event type
    pub fn on_event<F>(&self, event_type: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(
            Some(event_type.to_string()),
            Delivery::Sync(Arc::new(listener)),
        )
    }

    /// Register an asynchronous listener for every event type.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_async<F, Fut>(&self, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        self.register_async(None, Arc::new(move |event: Event| listener(event).boxed()))
    }

    /// Register an asynchronous listener for one event type
    pub fn on_async_event<F, Fut>(&self, event_type: &str, listener: F) -> Result<ListenerHandle>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        self.register_async(
            Some(event_type.to_string()),
            Arc::new(move |event: Event| listener(event).boxed()),
        )
    }

    /// Remove a listener. Returns false (and does nothing) if it was absent.
    pub fn off(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.core.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.handle != handle);
        before != listeners.len()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.core.listeners.read().len()
    }

    /// Ordered history, optionally restricted to one event type
    pub fn history(&self, event_type: Option<&str>) -> Vec<Event> {
        self.core
            .history
            .lock()
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect()
    }

    /// Ordered history matching a filter
    pub fn history_matching(&self, filter: &EventFilter) -> Vec<Event> {
        self.core
            .history
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.core.history.lock().len()
    }

    pub fn history_capacity(&self) -> usize {
        self.core.capacity
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.core.sender.subscribe()
    }

    /// Subscribe with a filter
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    /// Drop every listener; async workers exit once their queues drain.
    pub fn clear_listeners(&self) {
        self.core.listeners.write().clear();
    }

    fn next_handle(&self) -> ListenerHandle {
        ListenerHandle(self.core.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, event_type: Option<String>, delivery: Delivery) -> ListenerHandle {
        let handle = self.next_handle();
        self.core.listeners.write().push(Registration {
            handle,
            event_type,
            delivery,
        });
        handle
    }

    fn register_async(
        &self,
        event_type: Option<String>,
        listener: AsyncListener,
    ) -> Result<ListenerHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RoundtableError::config("async listeners require a running Tokio runtime")
        })?;

        let (queue, mut inbox) = mpsc::unbounded_channel::<Event>();
        let handle = self.register(event_type, Delivery::Async(queue));
        let core: Weak<BusCore> = Arc::downgrade(&self.core);

        runtime.spawn(async move {
            while let Some(event) = inbox.recv().await {
                let outcome = AssertUnwindSafe(async { listener(event.clone()).await })
                    .catch_unwind()
                    .await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(panic) => Some(panic_message(panic)),
                };
                if let Some(error) = failure {
                    match core.upgrade() {
                        Some(core) => core.listener_failed(handle, &event, &error),
                        None => break,
                    }
                }
            }
            debug!(listener = handle.0, "Async listener worker stopped");
        });

        Ok(handle)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {s}")
    } else {
        "listener panicked".to_string()
    }
}

/// Event filter for selective subscription and history queries
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter. Unscoped events never match a
    /// scoped filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref sid) = self.session_id {
            if event.session_id.as_deref() != Some(sid.as_str()) {
                return false;
            }
        }
        if let Some(ref tid) = self.task_id {
            if event.task_id.as_deref() != Some(tid.as_str()) {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| *t == event.event_type) {
                return false;
            }
        }
        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<Event>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> std::result::Result<Event, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
